pub mod auth;
pub mod chat;
pub mod metrics;
pub mod msgid;
pub mod notifier;
pub mod payload;
pub mod registry;
pub mod rest;
pub mod settings;
pub mod stats;
pub mod undelivered;
pub mod watchdog;
pub mod ws;

pub use chat::{ChatOptions, ChatServer};
pub use payload::MessagePayload;
pub use settings::Settings;
