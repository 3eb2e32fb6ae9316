//! HTTP postback target: the serialized envelope is POSTed (method
//! configurable) to a URL with the configured authenticator applied.
//! Any 2xx/3xx reply counts as delivered.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::auth::{self, Authenticator};
use crate::payload::MessagePayload;

use super::target::{EventTarget, TargetError};

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PostbackTarget {
    url: String,
    method: reqwest::Method,
    auth: Box<dyn Authenticator>,
    client: reqwest::Client,
    fallbacks: Vec<Arc<dyn EventTarget>>,
}

impl PostbackTarget {
    pub fn from_config(
        config: &Value,
        fallbacks: Vec<Arc<dyn EventTarget>>,
    ) -> anyhow::Result<Self> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .context("Invalid postback target configuration: url required")?
            .to_string();

        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .with_context(|| format!("Invalid postback target method: {method}"))?;

        let auth = auth::from_config(config.get("auth").unwrap_or(&Value::Null))?;

        let connect_timeout = config
            .get("connectionTimeoutSeconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT);

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout * 3)
            .build()
            .context("Invalid postback target configuration")?;

        Ok(Self {
            url,
            method,
            auth,
            client,
            fallbacks,
        })
    }
}

#[async_trait]
impl EventTarget for PostbackTarget {
    async fn deliver(&self, payload: &MessagePayload) -> Result<(), TargetError> {
        let request = self
            .client
            .request(self.method.clone(), &self.url)
            .header("Content-Type", "application/json")
            .body(payload.to_wire().to_string());
        let request = self.auth.apply(request);

        let response = request
            .send()
            .await
            .map_err(|e| TargetError::new(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            debug!(url = %self.url, %status, "postback accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(TargetError::new(format!("{status}\n{body}")))
    }

    fn kind(&self) -> &'static str {
        "postback"
    }

    fn fallbacks(&self) -> &[Arc<dyn EventTarget>] {
        &self.fallbacks
    }
}
