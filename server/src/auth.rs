//! Upgrade-handshake authentication strategies.
//!
//! A small algebra chosen from configuration: `noauth`, `basic`, `header`,
//! `bearer`, `cookie`, `oneOf`, `allOf` and `remote`. Every strategy can also
//! apply itself to an outgoing request, which is how postback targets carry
//! credentials.

use std::collections::HashMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::Engine;
use http::HeaderMap;
use serde_json::Value;
use tracing::debug;

/// The upgrade HTTP request as the authenticators see it.
#[derive(Debug, Default)]
pub struct UpgradeRequest {
    headers: HeaderMap,
    params: HashMap<String, String>,
}

impl UpgradeRequest {
    pub fn new(headers: HeaderMap, query: &str) -> Self {
        let params = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Self { headers, params }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Whether the upgrade request carries valid credentials.
    async fn validate(&self, request: &UpgradeRequest) -> bool;

    /// Pull the credential value out of a request, for `remote` delegation.
    fn extract(&self, _request: &UpgradeRequest) -> Option<String> {
        None
    }

    /// Attach this strategy's credentials to an outgoing request.
    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
    }
}

// ---------------------------------------------------------------------------
// Leaf strategies
// ---------------------------------------------------------------------------

/// Accepts everything.
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    fn kind(&self) -> &'static str {
        "noauth"
    }

    async fn validate(&self, _request: &UpgradeRequest) -> bool {
        true
    }
}

pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn local_value(&self) -> String {
        let glued = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(glued)
        )
    }
}

#[async_trait]
impl Authenticator for BasicAuth {
    fn kind(&self) -> &'static str {
        "basic"
    }

    async fn validate(&self, request: &UpgradeRequest) -> bool {
        request.header("authorization") == Some(self.local_value().as_str())
    }

    fn extract(&self, request: &UpgradeRequest) -> Option<String> {
        request.header("authorization").map(str::to_string)
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", self.local_value())
    }
}

pub struct HeaderAuth {
    name: String,
    value: String,
}

impl HeaderAuth {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Authenticator for HeaderAuth {
    fn kind(&self) -> &'static str {
        "header"
    }

    async fn validate(&self, request: &UpgradeRequest) -> bool {
        request.header(&self.name) == Some(self.value.as_str())
    }

    fn extract(&self, request: &UpgradeRequest) -> Option<String> {
        request.header(&self.name).map(str::to_string)
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(&self.name, &self.value)
    }
}

/// `Authorization: Bearer <token>`; a named special case of [`HeaderAuth`].
pub struct BearerAuth {
    inner: HeaderAuth,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: HeaderAuth::new("authorization", format!("Bearer {}", token.into())),
        }
    }
}

#[async_trait]
impl Authenticator for BearerAuth {
    fn kind(&self) -> &'static str {
        "bearer"
    }

    async fn validate(&self, request: &UpgradeRequest) -> bool {
        self.inner.validate(request).await
    }

    fn extract(&self, request: &UpgradeRequest) -> Option<String> {
        self.inner.extract(request)
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        self.inner.apply(request)
    }
}

pub struct CookieAuth {
    name: String,
    value: String,
}

impl CookieAuth {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn cookie_value<'a>(&self, request: &'a UpgradeRequest) -> Option<&'a str> {
        let header = request.header("cookie")?;
        for pair in header.split(';') {
            let mut kv = pair.trim().splitn(2, '=');
            let name = kv.next()?.trim();
            let value = kv.next().unwrap_or("").trim();
            if name.eq_ignore_ascii_case(&self.name) {
                return Some(value);
            }
        }
        None
    }
}

#[async_trait]
impl Authenticator for CookieAuth {
    fn kind(&self) -> &'static str {
        "cookie"
    }

    async fn validate(&self, request: &UpgradeRequest) -> bool {
        self.cookie_value(request) == Some(self.value.as_str())
    }

    fn extract(&self, request: &UpgradeRequest) -> Option<String> {
        self.cookie_value(request).map(str::to_string)
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Cookie", format!("{}={}", self.name, self.value))
    }
}

// ---------------------------------------------------------------------------
// Combinators
// ---------------------------------------------------------------------------

/// Succeeds iff any child succeeds.
pub struct OneOfAuth {
    children: Vec<Box<dyn Authenticator>>,
}

impl OneOfAuth {
    pub fn new(children: Vec<Box<dyn Authenticator>>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl Authenticator for OneOfAuth {
    fn kind(&self) -> &'static str {
        "oneOf"
    }

    async fn validate(&self, request: &UpgradeRequest) -> bool {
        for child in &self.children {
            if child.validate(request).await {
                return true;
            }
        }
        false
    }

    fn apply(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for child in &self.children {
            request = child.apply(request);
        }
        request
    }
}

/// Succeeds iff every child succeeds.
pub struct AllOfAuth {
    children: Vec<Box<dyn Authenticator>>,
}

impl AllOfAuth {
    pub fn new(children: Vec<Box<dyn Authenticator>>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl Authenticator for AllOfAuth {
    fn kind(&self) -> &'static str {
        "allOf"
    }

    async fn validate(&self, request: &UpgradeRequest) -> bool {
        for child in &self.children {
            if !child.validate(request).await {
                return false;
            }
        }
        true
    }

    fn apply(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for child in &self.children {
            request = child.apply(request);
        }
        request
    }
}

// ---------------------------------------------------------------------------
// Remote validation
// ---------------------------------------------------------------------------

/// Extracts a value with a child strategy and validates it against an external
/// HTTP endpoint; 2xx/3xx means valid.
pub struct RemoteAuth {
    url: String,
    method: reqwest::Method,
    headers: Vec<(String, String)>,
    body_template: Option<String>,
    source: Box<dyn Authenticator>,
    client: reqwest::Client,
}

impl RemoteAuth {
    fn from_config(data: &Value, source: Box<dyn Authenticator>) -> anyhow::Result<Self> {
        let url = data
            .get("url")
            .and_then(Value::as_str)
            .context("remote auth requires a url")?
            .to_string();
        let method = data
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .with_context(|| format!("invalid remote auth method {method}"))?;

        let mut headers = Vec::new();
        if let Some(items) = data.get("headers").and_then(Value::as_array) {
            for obj in items {
                if let Some(map) = obj.as_object() {
                    for (name, value) in map {
                        if let Some(value) = value.as_str() {
                            headers.push((name.clone(), value.to_string()));
                        }
                    }
                }
            }
        }

        let body_template = match data.get("data") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(obj @ Value::Object(_)) => Some(obj.to_string()),
            _ => None,
        };

        Ok(Self {
            url,
            method,
            headers,
            body_template,
            source,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Authenticator for RemoteAuth {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn validate(&self, request: &UpgradeRequest) -> bool {
        let Some(value) = self.source.extract(request).filter(|v| !v.is_empty()) else {
            // nothing to validate remotely
            return false;
        };

        let mut req = self.client.request(self.method.clone(), &self.url);
        for (name, header_value) in &self.headers {
            req = req.header(name, header_value);
        }
        if let Some(template) = &self.body_template {
            req = req.body(template.replace("{0}", &value));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                debug!(error = %e, url = %self.url, "remote auth endpoint unreachable");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build an authenticator from its configuration subtree. `null` and unknown
/// types fall back to [`NoAuth`]; structural errors are fatal.
pub fn from_config(config: &Value) -> anyhow::Result<Box<dyn Authenticator>> {
    if config.is_null() {
        return Ok(Box::new(NoAuth));
    }
    if !config.is_object() {
        bail!("auth config must be an object");
    }

    // accept either the bare strategy object or a wrapper with an "auth" key
    let data = config.get("auth").unwrap_or(config);
    let Some(kind) = data.get("type").and_then(Value::as_str) else {
        return Ok(Box::new(NoAuth));
    };

    let auth: Box<dyn Authenticator> = if kind.eq_ignore_ascii_case("basic") {
        Box::new(BasicAuth::new(
            required_str(data, "user")?,
            required_str(data, "password")?,
        ))
    } else if kind.eq_ignore_ascii_case("header") {
        Box::new(HeaderAuth::new(
            required_str(data, "name")?,
            data.get("value").and_then(Value::as_str).unwrap_or(""),
        ))
    } else if kind.eq_ignore_ascii_case("bearer") {
        Box::new(BearerAuth::new(required_str(data, "value")?))
    } else if kind.eq_ignore_ascii_case("cookie") {
        Box::new(CookieAuth::new(
            required_str(data, "name")?,
            data.get("value").and_then(Value::as_str).unwrap_or(""),
        ))
    } else if kind.eq_ignore_ascii_case("oneOf") || kind.eq_ignore_ascii_case("allOf") {
        let items = data
            .get("types")
            .and_then(Value::as_array)
            .context("oneOf/allOf auth requires a types array")?;
        let mut children = Vec::with_capacity(items.len());
        for item in items {
            children.push(from_config(item)?);
        }
        if kind.eq_ignore_ascii_case("oneOf") {
            Box::new(OneOfAuth::new(children))
        } else {
            Box::new(AllOfAuth::new(children))
        }
    } else if kind.eq_ignore_ascii_case("remote") {
        let source_cfg = data.get("source").context("remote auth requires a source")?;
        let source = from_config(source_cfg)?;
        Box::new(RemoteAuth::from_config(data, source)?)
    } else {
        Box::new(NoAuth)
    };

    Ok(auth)
}

fn required_str<'a>(data: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    data.get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("auth config missing \"{key}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(headers: &[(&str, &str)], query: &str) -> UpgradeRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        UpgradeRequest::new(map, query)
    }

    #[tokio::test]
    async fn noauth_accepts_anything() {
        assert!(NoAuth.validate(&request(&[], "")).await);
    }

    #[tokio::test]
    async fn basic_compares_the_encoded_pair() {
        let auth = BasicAuth::new("user", "secret");
        // "user:secret" in base64
        let ok = request(&[("authorization", "Basic dXNlcjpzZWNyZXQ=")], "");
        assert!(auth.validate(&ok).await);
        let bad = request(&[("authorization", "Basic bm9wZTpub3Bl")], "");
        assert!(!auth.validate(&bad).await);
        assert!(!auth.validate(&request(&[], "")).await);
    }

    #[tokio::test]
    async fn bearer_requires_the_exact_token() {
        let auth = BearerAuth::new("tok123");
        assert!(
            auth.validate(&request(&[("authorization", "Bearer tok123")], ""))
                .await
        );
        assert!(
            !auth
                .validate(&request(&[("authorization", "Bearer other")], ""))
                .await
        );
    }

    #[tokio::test]
    async fn cookie_matches_by_name_case_insensitively() {
        let auth = CookieAuth::new("session", "abc");
        let ok = request(&[("cookie", "theme=dark; Session=abc")], "");
        assert!(auth.validate(&ok).await);
        assert_eq!(auth.extract(&ok).as_deref(), Some("abc"));
        let wrong = request(&[("cookie", "session=zzz")], "");
        assert!(!auth.validate(&wrong).await);
    }

    #[tokio::test]
    async fn one_of_needs_any_child() {
        let auth = OneOfAuth::new(vec![
            Box::new(HeaderAuth::new("x-a", "1")),
            Box::new(HeaderAuth::new("x-b", "2")),
        ]);
        assert!(auth.validate(&request(&[("x-b", "2")], "")).await);
        assert!(!auth.validate(&request(&[("x-b", "9")], "")).await);
    }

    #[tokio::test]
    async fn all_of_needs_every_child() {
        let auth = AllOfAuth::new(vec![
            Box::new(HeaderAuth::new("x-a", "1")),
            Box::new(HeaderAuth::new("x-b", "2")),
        ]);
        assert!(
            auth.validate(&request(&[("x-a", "1"), ("x-b", "2")], ""))
                .await
        );
        assert!(!auth.validate(&request(&[("x-a", "1")], "")).await);
    }

    #[test]
    fn factory_builds_the_configured_strategy() {
        let auth = from_config(&json!({"type": "bearer", "value": "t"})).unwrap();
        assert_eq!(auth.kind(), "bearer");

        let auth = from_config(&json!({
            "type": "oneOf",
            "types": [
                {"type": "header", "name": "x-key", "value": "v"},
                {"type": "basic", "user": "u", "password": "p"},
            ]
        }))
        .unwrap();
        assert_eq!(auth.kind(), "oneOf");

        // wrapper form, as found under server.auth
        let auth =
            from_config(&json!({"auth": {"type": "cookie", "name": "sid", "value": "1"}})).unwrap();
        assert_eq!(auth.kind(), "cookie");

        assert_eq!(from_config(&Value::Null).unwrap().kind(), "noauth");
    }

    #[test]
    fn factory_rejects_incomplete_configs() {
        assert!(from_config(&json!({"type": "basic", "user": "u"})).is_err());
        assert!(from_config(&json!({"type": "oneOf"})).is_err());
        assert!(
            from_config(&json!({"type": "remote", "source": {"type": "bearer", "value": "t"}}))
                .is_err()
        );
    }

    #[tokio::test]
    async fn remote_fails_fast_without_a_credential() {
        let auth = from_config(&json!({
            "type": "remote",
            "url": "http://127.0.0.1:9/validate",
            "source": {"type": "bearer", "value": "t"}
        }))
        .unwrap();
        // no Authorization header: nothing to validate, no HTTP call made
        assert!(!auth.validate(&request(&[], "")).await);
    }

    #[test]
    fn query_params_are_parsed() {
        let req = request(&[], "id=42&token=x%20y");
        assert_eq!(req.param("id"), Some("42"));
        assert_eq!(req.param("token"), Some("x y"));
        assert!(req.has_params());
    }
}
