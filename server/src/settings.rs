//! Server configuration.
//!
//! A single JSON file deserialized into the [`Settings`] tree. Every key has
//! a default, so a minimal deployment can run with `{}`. Structural problems
//! (bad size strings, enabled notifier without targets) surface at startup.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub server: ServerSettings,
    pub rest_api: RestApiSettings,
    pub chat: ChatSettings,
    pub event: EventSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub address: String,
    pub port: u16,
    pub endpoint: String,
    /// 0 means "hardware concurrency".
    pub workers: usize,
    pub idle_timeout_seconds: Option<u64>,
    pub watchdog: WatchdogSettings,
    /// Authenticator subtree, handed to `auth::from_config`.
    pub auth: Value,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "*".to_string(),
            port: 8085,
            endpoint: "/chat".to_string(),
            workers: 0,
            idle_timeout_seconds: None,
            watchdog: WatchdogSettings::default(),
            auth: Value::Null,
        }
    }
}

impl ServerSettings {
    pub fn worker_threads(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        hardware_concurrency()
    }

    /// `"*"` binds every interface.
    pub fn bind_address(&self) -> String {
        if self.address == "*" {
            "0.0.0.0".to_string()
        } else {
            self.address.clone()
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchdogSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestApiSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatSettings {
    pub message: MessageSettings,
    pub enable_undelivered_queue: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageSettings {
    pub max_size: String,
    pub enable_delivery_status: bool,
    pub enable_send_back: bool,
    pub ignored_types_send_back: Vec<String>,
    pub enable_timestamp_override_api: bool,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            max_size: "10M".to_string(),
            enable_delivery_status: false,
            enable_send_back: false,
            ignored_types_send_back: Vec::new(),
            enable_timestamp_override_api: false,
        }
    }
}

impl MessageSettings {
    pub fn max_size_bytes(&self) -> anyhow::Result<usize> {
        parse_size(&self.max_size)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventSettings {
    pub enabled: bool,
    pub enable_retry: bool,
    pub send_bot_messages: bool,
    pub retry_interval_seconds: u64,
    pub retry_count: u32,
    /// 0 means "2x hardware concurrency".
    pub max_parallel_workers: usize,
    pub ignore_types: Vec<String>,
    pub targets: Vec<Value>,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            enable_retry: true,
            send_bot_messages: false,
            retry_interval_seconds: 10,
            retry_count: 3,
            max_parallel_workers: 0,
            ignore_types: Vec::new(),
            targets: Vec::new(),
        }
    }
}

impl EventSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }

    pub fn parallel_workers(&self) -> usize {
        if self.max_parallel_workers > 0 {
            return self.max_parallel_workers;
        }
        hardware_concurrency() * 2
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("can't open config file {}", path.display()))?;
        let mut settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("unable to load config {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&mut self) -> anyhow::Result<()> {
        self.chat.message.max_size_bytes()?;
        if self.event.enabled && self.event.targets.is_empty() {
            warn!("event notifier enabled without targets, disabling it");
            self.event.enabled = false;
        }
        Ok(())
    }
}

/// Parse `"10M"` / `"500K"` into bytes.
pub fn parse_size(input: &str) -> anyhow::Result<usize> {
    let input = input.trim();
    let Some((idx, unit)) = input.char_indices().last() else {
        bail!("empty message.maxSize value");
    };
    let digits = &input[..idx];
    let number: usize = digits.parse().with_context(|| {
        format!("invalid message.maxSize value \"{input}\"; expected a form like 10M or 500K")
    })?;
    match unit {
        'M' | 'm' => Ok(number * 1024 * 1024),
        'K' | 'k' => Ok(number * 1024),
        _ => bail!("invalid message.maxSize value \"{input}\"; expected a form like 10M or 500K"),
    }
}

/// "10.0 MiB"-style rendering used in close reasons.
pub fn human_readable_bytes(bytes: usize) -> String {
    const UNIT: f64 = 1024.0;
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let exp = ((bytes as f64).ln() / UNIT.ln()) as u32;
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][(exp - 1) as usize];
    format!("{:.1} {}iB", bytes as f64 / UNIT.powi(exp as i32), prefix)
}

fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_a_minimal_config() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.server.port, 8085);
        assert_eq!(settings.server.endpoint, "/chat");
        assert_eq!(settings.server.bind_address(), "0.0.0.0");
        assert!(!settings.server.watchdog.enabled);
        assert_eq!(settings.chat.message.max_size, "10M");
        assert!(!settings.chat.enable_undelivered_queue);
        assert!(!settings.event.enabled);
        assert_eq!(settings.event.retry_count, 3);
        assert_eq!(settings.event.retry_interval_seconds, 10);
        assert!(settings.event.enable_retry);
    }

    #[test]
    fn size_strings() {
        assert_eq!(parse_size("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("500K").unwrap(), 500 * 1024);
        assert_eq!(parse_size("1k").unwrap(), 1024);
        assert!(parse_size("10").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("ten megabytes").is_err());
    }

    #[test]
    fn human_readable_rendering() {
        assert_eq!(human_readable_bytes(512), "512 B");
        assert_eq!(human_readable_bytes(500 * 1024), "500.0 KiB");
        assert_eq!(human_readable_bytes(10 * 1024 * 1024), "10.0 MiB");
    }

    #[test]
    fn loads_a_full_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "server": {{
                    "address": "127.0.0.1",
                    "port": 9000,
                    "endpoint": "/relay",
                    "workers": 4,
                    "idleTimeoutSeconds": 120,
                    "watchdog": {{"enabled": true}},
                    "auth": {{"type": "bearer", "value": "t"}}
                }},
                "restApi": {{"enabled": true}},
                "chat": {{
                    "message": {{
                        "maxSize": "500K",
                        "enableDeliveryStatus": true,
                        "enableSendBack": true,
                        "ignoredTypesSendBack": ["binary"]
                    }},
                    "enableUndeliveredQueue": true
                }},
                "event": {{
                    "enabled": true,
                    "retryIntervalSeconds": 5,
                    "retryCount": 4,
                    "maxParallelWorkers": 8,
                    "ignoreTypes": ["notification_received"],
                    "targets": [{{"type": "postback", "url": "http://localhost/hook"}}]
                }}
            }}"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.endpoint, "/relay");
        assert_eq!(settings.server.worker_threads(), 4);
        assert_eq!(settings.server.idle_timeout(), Some(Duration::from_secs(120)));
        assert!(settings.server.watchdog.enabled);
        assert!(settings.rest_api.enabled);
        assert_eq!(settings.chat.message.max_size_bytes().unwrap(), 500 * 1024);
        assert!(settings.chat.message.enable_delivery_status);
        assert!(settings.chat.enable_undelivered_queue);
        assert!(settings.event.enabled);
        assert_eq!(settings.event.retry_count, 4);
        assert_eq!(settings.event.parallel_workers(), 8);
        assert_eq!(settings.event.targets.len(), 1);
    }

    #[test]
    fn notifier_without_targets_is_disabled() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"event": {{"enabled": true}}}}"#).unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert!(!settings.event.enabled);
    }

    #[test]
    fn bad_size_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"chat": {{"message": {{"maxSize": "huge"}}}}}}"#
        )
        .unwrap();
        assert!(Settings::load(file.path()).is_err());
    }
}
