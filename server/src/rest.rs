//! REST control surface: statistics dumps, online checks, liveness, and
//! server-side message injection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

use crate::chat::ChatServer;
use crate::payload::MessagePayload;
use crate::registry::UserId;
use crate::stats::StatSnapshot;

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"success": false, "message": message}))).into_response()
}

fn parse_id(params: &HashMap<String, String>) -> Result<UserId, Response> {
    let raw = params
        .get("id")
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Id required"))?;
    raw.parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid id"))
}

/// GET /stats — dump every statistics record.
pub async fn stats(State(chat): State<Arc<ChatServer>>) -> Response {
    let records = chat.stats().snapshot_all();
    debug!(records = records.len(), "statistics dump");
    Json(json!({"success": true, "data": records})).into_response()
}

/// GET /stat?id=<u> — one record; unknown users yield a zero-valued record.
pub async fn stat(
    State(chat): State<Arc<ChatServer>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let id = match parse_id(&params) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let record = chat
        .stats()
        .peek(id)
        .map(|s| s.snapshot())
        .unwrap_or_else(|| StatSnapshot::zero(id));
    Json(json!({"success": true, "data": record})).into_response()
}

/// GET /check-online?id=<u>
pub async fn check_online(
    State(chat): State<Arc<ChatServer>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let id = match parse_id(&params) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let online = chat
        .stats()
        .peek(id)
        .map(|s| s.is_online())
        .unwrap_or(false);
    Json(json!({"success": true, "data": {"isOnline": online}})).into_response()
}

/// POST /send-message — inject a payload server-side. Refuses bot-only
/// recipients; 202 on acceptance.
pub async fn send_message(
    State(chat): State<Arc<ChatServer>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Content-Type must be application/json",
        );
    }

    let payload =
        match MessagePayload::parse(&body, chat.options().preserve_api_timestamps) {
            Ok(payload) => payload,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

    if payload.is_for_bot() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Can't send message to bot through the api",
        );
    }

    chat.send(payload);
    StatusCode::ACCEPTED.into_response()
}

/// HEAD /status — liveness.
pub async fn status() -> StatusCode {
    StatusCode::OK
}
