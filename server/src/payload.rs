//! Message payload envelope.
//!
//! One JSON envelope per WebSocket message. Parsing validates the invariants
//! up front so the rest of the pipeline only ever sees well-formed payloads;
//! a failed parse surfaces as a [`PayloadError`] whose rendering becomes the
//! 4001 close reason.

use std::sync::OnceLock;

use chrono::Local;
use serde_json::{json, Value};

use crate::msgid::{self, MessageId};
use crate::registry::UserId;

pub const TYPE_TEXT: &str = "text";
pub const TYPE_BINARY: &str = "binary";
pub const TYPE_NOTIFICATION_RECEIVED: &str = "notification_received";

/// The synthetic "bot" participant. Never owns a connection.
pub const BOT_USER_ID: UserId = 0;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Empty message")]
    Empty,
    #[error("Invalid payload: {0}")]
    Json(String),
    #[error("$.type must be a string")]
    MissingType,
    #[error("$.sender must be an unsigned integer")]
    MissingSender,
    #[error("$.recipients[] must be an array of unsigned integers")]
    MissingRecipients,
    #[error("$.recipients[] must contain at least 1 value")]
    EmptyRecipients,
    #[error("$.text must be a non-empty string")]
    MissingText,
}

/// A chat envelope. Equality is by id.
#[derive(Debug, Clone)]
pub struct MessagePayload {
    id: MessageId,
    kind: String,
    sender: UserId,
    recipients: Vec<UserId>,
    text: String,
    data: Value,
    timestamp: String,
    wire: OnceLock<String>,
}

impl PartialEq for MessagePayload {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessagePayload {}

impl MessagePayload {
    /// Parse and validate a wire envelope.
    ///
    /// The server assigns `id` and `timestamp` unless the input carries them
    /// and, for the timestamp, `preserve_timestamp` is set (the API override
    /// switch).
    pub fn parse(input: &str, preserve_timestamp: bool) -> Result<Self, PayloadError> {
        if input.is_empty() {
            return Err(PayloadError::Empty);
        }
        let value: Value =
            serde_json::from_str(input).map_err(|e| PayloadError::Json(e.to_string()))?;
        Self::from_value(&value, preserve_timestamp)
    }

    pub fn from_value(value: &Value, preserve_timestamp: bool) -> Result<Self, PayloadError> {
        let obj = value
            .as_object()
            .ok_or_else(|| PayloadError::Json("expected a JSON object".into()))?;

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(PayloadError::MissingType)?
            .to_string();
        let sender = obj
            .get("sender")
            .and_then(Value::as_u64)
            .ok_or(PayloadError::MissingSender)?;
        let recipients = obj
            .get("recipients")
            .and_then(Value::as_array)
            .ok_or(PayloadError::MissingRecipients)?
            .iter()
            .map(|v| v.as_u64().ok_or(PayloadError::MissingRecipients))
            .collect::<Result<Vec<_>, _>>()?;
        if recipients.is_empty() {
            return Err(PayloadError::EmptyRecipients);
        }

        let text = match obj.get("text").and_then(Value::as_str) {
            Some(t) if kind == TYPE_TEXT && t.is_empty() => return Err(PayloadError::MissingText),
            Some(t) => t.to_string(),
            None if kind == TYPE_TEXT => return Err(PayloadError::MissingText),
            None => String::new(),
        };

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(msgid::next_id);

        let timestamp = match obj.get("timestamp").and_then(Value::as_str) {
            Some(ts) if preserve_timestamp => ts.to_string(),
            _ => now_timestamp(),
        };

        Ok(Self {
            id,
            kind,
            sender,
            recipients,
            text,
            data: obj.get("data").cloned().unwrap_or(Value::Null),
            timestamp,
            wire: OnceLock::new(),
        })
    }

    /// Server-originated text message, used by tests and embedders.
    pub fn text(sender: UserId, recipients: Vec<UserId>, text: impl Into<String>) -> Self {
        Self {
            id: msgid::next_id(),
            kind: TYPE_TEXT.to_string(),
            sender,
            recipients,
            text: text.into(),
            data: Value::Null,
            timestamp: now_timestamp(),
            wire: OnceLock::new(),
        }
    }

    /// Delivery-status notification addressed to `to`, originated by the bot.
    pub fn delivery_status(to: UserId) -> Self {
        Self {
            id: msgid::next_id(),
            kind: TYPE_NOTIFICATION_RECEIVED.to_string(),
            sender: BOT_USER_ID,
            recipients: vec![to],
            text: String::new(),
            data: Value::Null,
            timestamp: now_timestamp(),
            wire: OnceLock::new(),
        }
    }

    // -- Accessors --------------------------------------------------------------

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn sender(&self) -> UserId {
        self.sender
    }

    pub fn recipients(&self) -> &[UserId] {
        &self.recipients
    }

    pub fn text_body(&self) -> &str {
        &self.text
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn type_is(&self, kind: &str) -> bool {
        self.kind.eq_ignore_ascii_case(kind)
    }

    pub fn is_from_bot(&self) -> bool {
        self.sender == BOT_USER_ID
    }

    pub fn is_for_bot(&self) -> bool {
        self.recipients.len() == 1 && self.recipients[0] == BOT_USER_ID
    }

    pub fn has_single_recipient(&self) -> bool {
        self.recipients.len() == 1
    }

    pub fn is_delivery_status(&self) -> bool {
        self.type_is(TYPE_NOTIFICATION_RECEIVED)
    }

    // -- Mutators (invalidate the wire cache) -----------------------------------

    pub fn set_sender(&mut self, sender: UserId) {
        self.sender = sender;
        self.wire.take();
    }

    pub fn set_recipient(&mut self, recipient: UserId) {
        self.recipients.clear();
        self.recipients.push(recipient);
        self.wire.take();
    }

    pub fn set_recipients(&mut self, recipients: Vec<UserId>) {
        self.recipients = recipients;
        self.wire.take();
    }

    pub fn add_recipient(&mut self, recipient: UserId) {
        self.recipients.push(recipient);
        self.wire.take();
    }

    /// Clone rewritten to a single recipient, as stored in the undelivered
    /// queue and reported through send completions.
    pub fn with_recipient(&self, recipient: UserId) -> Self {
        let mut clone = self.clone();
        clone.set_recipient(recipient);
        clone
    }

    // -- Serialization ----------------------------------------------------------

    /// Serialized envelope. Cached until the next mutator call.
    pub fn to_wire(&self) -> &str {
        self.wire.get_or_init(|| self.wire_value().to_string())
    }

    fn wire_value(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            "type": self.kind,
            "text": self.text,
            "timestamp": self.timestamp,
            "sender": self.sender,
            "recipients": self.recipients,
            "data": self.data,
        })
    }
}

/// ISO-8601 timestamp with fractional seconds and local offset.
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_text_envelope() {
        let p = MessagePayload::parse(
            r#"{"type":"text","sender":17,"recipients":[42,99],"text":"hi","data":{"k":"v"}}"#,
            false,
        )
        .unwrap();
        assert_eq!(p.kind(), "text");
        assert_eq!(p.sender(), 17);
        assert_eq!(p.recipients(), &[42, 99]);
        assert_eq!(p.text_body(), "hi");
        assert_eq!(p.data()["k"], "v");
        assert!(!p.timestamp().is_empty());
    }

    #[test]
    fn round_trip_preserves_envelope_fields() {
        let p = MessagePayload::parse(
            r#"{"type":"text","sender":17,"recipients":[42],"text":"hi"}"#,
            false,
        )
        .unwrap();
        let back = MessagePayload::parse(p.to_wire(), false).unwrap();
        assert_eq!(back.sender(), p.sender());
        assert_eq!(back.recipients(), p.recipients());
        assert_eq!(back.kind(), p.kind());
        assert_eq!(back.text_body(), p.text_body());
        assert_eq!(back.data(), p.data());
        // the wire form carries the id, so it survives the round trip
        assert_eq!(back.id(), p.id());
        assert_eq!(back, p);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let missing_type = r#"{"sender":1,"recipients":[2]}"#;
        assert!(matches!(
            MessagePayload::parse(missing_type, false),
            Err(PayloadError::MissingType)
        ));

        let missing_sender = r#"{"type":"text","recipients":[2],"text":"x"}"#;
        assert!(matches!(
            MessagePayload::parse(missing_sender, false),
            Err(PayloadError::MissingSender)
        ));

        let missing_recipients = r#"{"type":"text","sender":1,"text":"x"}"#;
        assert!(matches!(
            MessagePayload::parse(missing_recipients, false),
            Err(PayloadError::MissingRecipients)
        ));

        let empty_recipients = r#"{"type":"text","sender":1,"recipients":[],"text":"x"}"#;
        assert!(matches!(
            MessagePayload::parse(empty_recipients, false),
            Err(PayloadError::EmptyRecipients)
        ));
    }

    #[test]
    fn text_is_required_for_text_type_only() {
        assert!(matches!(
            MessagePayload::parse(r#"{"type":"text","sender":1,"recipients":[2]}"#, false),
            Err(PayloadError::MissingText)
        ));
        assert!(matches!(
            MessagePayload::parse(
                r#"{"type":"text","sender":1,"recipients":[2],"text":""}"#,
                false
            ),
            Err(PayloadError::MissingText)
        ));
        // non-text types may omit it
        let p = MessagePayload::parse(r#"{"type":"ping","sender":1,"recipients":[2]}"#, false)
            .unwrap();
        assert_eq!(p.text_body(), "");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            MessagePayload::parse("", false),
            Err(PayloadError::Empty)
        ));
        assert!(matches!(
            MessagePayload::parse("not json", false),
            Err(PayloadError::Json(_))
        ));
        assert!(matches!(
            MessagePayload::parse("[1,2,3]", false),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn timestamp_override_is_gated() {
        let input = r#"{"type":"text","sender":1,"recipients":[2],"text":"x","timestamp":"2020-01-01 00:00:00.000000+00:00"}"#;
        let assigned = MessagePayload::parse(input, false).unwrap();
        assert_ne!(assigned.timestamp(), "2020-01-01 00:00:00.000000+00:00");

        let preserved = MessagePayload::parse(input, true).unwrap();
        assert_eq!(preserved.timestamp(), "2020-01-01 00:00:00.000000+00:00");
    }

    #[test]
    fn bot_addressing() {
        let for_bot =
            MessagePayload::parse(r#"{"type":"text","sender":1,"recipients":[0],"text":"x"}"#, false)
                .unwrap();
        assert!(for_bot.is_for_bot());
        assert!(!for_bot.is_from_bot());

        let multi = MessagePayload::parse(
            r#"{"type":"text","sender":0,"recipients":[0,3],"text":"x"}"#,
            false,
        )
        .unwrap();
        assert!(!multi.is_for_bot());
        assert!(multi.is_from_bot());
    }

    #[test]
    fn wire_cache_invalidated_by_mutators() {
        let mut p = MessagePayload::text(1, vec![2, 3], "hello");
        let before = p.to_wire().to_string();
        p.set_recipient(2);
        let after = p.to_wire().to_string();
        assert_ne!(before, after);
        assert!(after.contains("\"recipients\":[2]"));
    }

    #[test]
    fn delivery_status_shape() {
        let status = MessagePayload::delivery_status(12);
        assert!(status.is_from_bot());
        assert_eq!(status.recipients(), &[12]);
        assert!(status.is_delivery_status());
        assert!(status.type_is(TYPE_NOTIFICATION_RECEIVED));
    }

    #[test]
    fn equality_is_by_id() {
        let a = MessagePayload::text(1, vec![2], "x");
        let b = a.with_recipient(9);
        assert_eq!(a, b);
        let c = MessagePayload::text(1, vec![2], "x");
        assert_ne!(a, c);
    }
}
