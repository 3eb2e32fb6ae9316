//! Pluggable delivery sinks for the event notifier.
//!
//! A target is a trait object built by [`build_target`] from its config
//! subtree; construction failures are fatal at startup. Fallback chains are
//! declared inline and built recursively.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;

use crate::payload::MessagePayload;

use super::amqp::AmqpTarget;
use super::postback::PostbackTarget;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TargetError {
    pub message: String,
}

impl TargetError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait EventTarget: Send + Sync {
    /// Best-effort delivery of one payload. Blocking inside is fine; the
    /// notifier calls this from fire-and-forget tasks.
    async fn deliver(&self, payload: &MessagePayload) -> Result<(), TargetError>;

    /// Stable identifier used in logs and fallback handovers.
    fn kind(&self) -> &'static str;

    /// Alternates to try after this target exhausts its retries.
    fn fallbacks(&self) -> &[Arc<dyn EventTarget>];
}

/// Build a target (and its fallback chain) from configuration.
pub fn build_target(config: &Value) -> anyhow::Result<Arc<dyn EventTarget>> {
    let kind = config
        .get("type")
        .and_then(Value::as_str)
        .context("target type required")?;

    let mut fallbacks: Vec<Arc<dyn EventTarget>> = Vec::new();
    if let Some(items) = config.get("fallback").and_then(Value::as_array) {
        for item in items {
            fallbacks.push(build_target(item)?);
        }
    }

    let target: Arc<dyn EventTarget> = if kind.eq_ignore_ascii_case("postback") {
        Arc::new(PostbackTarget::from_config(config, fallbacks)?)
    } else if kind.eq_ignore_ascii_case("amqp") {
        Arc::new(AmqpTarget::from_config(config, fallbacks)?)
    } else {
        bail!("Unsupported target type: {kind}");
    };

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_a_postback_with_fallbacks() {
        let target = build_target(&json!({
            "type": "postback",
            "url": "http://localhost/hook",
            "fallback": [
                {"type": "postback", "url": "http://backup/hook"},
                {"type": "amqp", "apiUrl": "http://localhost:15672"}
            ]
        }))
        .unwrap();
        assert_eq!(target.kind(), "postback");
        let kinds: Vec<_> = target.fallbacks().iter().map(|t| t.kind()).collect();
        assert_eq!(kinds, vec!["postback", "amqp"]);
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let err = build_target(&json!({"type": "carrier-pigeon"})).err().unwrap();
        assert!(err.to_string().contains("Unsupported target type"));
    }

    #[test]
    fn missing_kind_is_fatal() {
        assert!(build_target(&json!({"url": "http://x"})).is_err());
    }

    #[test]
    fn invalid_fallback_is_fatal() {
        assert!(build_target(&json!({
            "type": "postback",
            "url": "http://localhost/hook",
            "fallback": [{"type": "postback"}]
        }))
        .is_err());
    }
}
