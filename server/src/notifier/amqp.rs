//! Broker publish target over the RabbitMQ HTTP API.
//!
//! Publishes the serialized envelope to an exchange via
//! `POST {api}/api/exchanges/{vhost}/{exchange}/publish`. Delivery counts
//! only when the broker replies 2xx *and* acknowledges the message as routed;
//! an unrouted publish is an error so the fallback chain can take over.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::payload::MessagePayload;

use super::target::{EventTarget, TargetError};

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AmqpTarget {
    api_url: String,
    vhost: String,
    exchange: String,
    routing_key: String,
    user: String,
    password: String,
    client: reqwest::Client,
    fallbacks: Vec<Arc<dyn EventTarget>>,
}

impl AmqpTarget {
    pub fn from_config(
        config: &Value,
        fallbacks: Vec<Arc<dyn EventTarget>>,
    ) -> anyhow::Result<Self> {
        let api_url = config
            .get("apiUrl")
            .and_then(Value::as_str)
            .context("Invalid amqp target configuration: apiUrl required")?
            .trim_end_matches('/')
            .to_string();

        let str_or = |key: &str, default: &str| -> String {
            config
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };

        let exchange = str_or("exchange", "chat_direct");
        let routing_key = str_or("routingKey", "chat");

        let connect_timeout = config
            .get("connectionTimeoutSeconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT);

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout * 3)
            .build()
            .context("Invalid amqp target configuration")?;

        Ok(Self {
            api_url,
            vhost: str_or("vhost", "/"),
            exchange,
            routing_key,
            user: str_or("user", "guest"),
            password: str_or("password", "guest"),
            client,
            fallbacks,
        })
    }

    fn publish_url(&self) -> String {
        // the default vhost "/" must travel percent-encoded in the path
        let vhost = self.vhost.replace('/', "%2F");
        format!(
            "{}/api/exchanges/{}/{}/publish",
            self.api_url, vhost, self.exchange
        )
    }
}

#[async_trait]
impl EventTarget for AmqpTarget {
    async fn deliver(&self, payload: &MessagePayload) -> Result<(), TargetError> {
        let body = json!({
            "properties": {"content_type": "application/json"},
            "routing_key": self.routing_key,
            "payload": payload.to_wire(),
            "payload_encoding": "string",
        });

        let response = self
            .client
            .post(self.publish_url())
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| TargetError::new(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TargetError::new(format!("{status}\n{text}")));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| TargetError::new(format!("unreadable broker reply: {e}")))?;
        if reply.get("routed").and_then(Value::as_bool) != Some(true) {
            return Err(TargetError::new(format!(
                "broker did not route the message to exchange {}",
                self.exchange
            )));
        }

        debug!(exchange = %self.exchange, routing_key = %self.routing_key, "publish acknowledged");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "amqp"
    }

    fn fallbacks(&self) -> &[Arc<dyn EventTarget>] {
        &self.fallbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requires_an_api_url() {
        assert!(AmqpTarget::from_config(&json!({"type": "amqp"}), Vec::new()).is_err());
    }

    #[test]
    fn defaults_and_url_shape() {
        let target = AmqpTarget::from_config(
            &json!({"type": "amqp", "apiUrl": "http://broker:15672/"}),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(
            target.publish_url(),
            "http://broker:15672/api/exchanges/%2F/chat_direct/publish"
        );
        assert_eq!(target.user, "guest");
        assert_eq!(target.routing_key, "chat");
    }

    #[test]
    fn honors_overrides() {
        let target = AmqpTarget::from_config(
            &json!({
                "type": "amqp",
                "apiUrl": "http://broker:15672",
                "vhost": "events",
                "exchange": "relay",
                "routingKey": "relay.messages",
                "user": "svc",
                "password": "secret"
            }),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(
            target.publish_url(),
            "http://broker:15672/api/exchanges/events/relay/publish"
        );
        assert_eq!(target.routing_key, "relay.messages");
    }
}
