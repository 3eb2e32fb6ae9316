//! Chat core: the single fan-out entry point and the lifecycle glue between
//! the transport layer and the sidecars (registry, undelivered queue,
//! statistics, event listeners).
//!
//! `send` is synchronous: per-connection delivery is an enqueue into the
//! connection's writer task, and all completion work (statistics, the
//! delivery-status echo, undeliverable spill) runs after the registry lock is
//! released, so the echo can recurse into `send` safely.

use std::sync::Arc;

use http::HeaderMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::auth::{Authenticator, UpgradeRequest};
use crate::payload::{MessagePayload, BOT_USER_ID};
use crate::registry::{Connection, ConnectionRegistry, Outbound, UserId};
use crate::settings::human_readable_bytes;
use crate::stats::StatsRegistry;
use crate::undelivered::UndeliveredStore;

// Close status codes the core emits.
pub const STATUS_NORMAL: u16 = 1000;
pub const STATUS_GOING_AWAY: u16 = 1001;
pub const STATUS_MESSAGE_TOO_BIG: u16 = 1009;
pub const STATUS_INVALID_QUERY_PARAMS: u16 = 4000;
pub const STATUS_INVALID_MESSAGE_PAYLOAD: u16 = 4001;
pub const STATUS_UNAUTHORIZED: u16 = 4002;
pub const STATUS_INACTIVE_CONNECTION: u16 = 4003;

/// A close requested by the core: status code plus human-readable reason.
pub type CloseRequest = (u16, String);

pub type MessageListener = Box<dyn Fn(MessagePayload) + Send + Sync>;
pub type StopListener = Box<dyn Fn() + Send + Sync>;

/// Behavior switches derived from [`crate::settings::Settings`].
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_message_size: usize,
    pub enable_delivery_status: bool,
    pub enable_send_back: bool,
    pub ignored_types_send_back: Vec<String>,
    pub enable_undelivered_queue: bool,
    pub preserve_api_timestamps: bool,
    pub idle_timeout: Option<std::time::Duration>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            enable_delivery_status: false,
            enable_send_back: false,
            ignored_types_send_back: Vec::new(),
            enable_undelivered_queue: false,
            preserve_api_timestamps: false,
            idle_timeout: None,
        }
    }
}

pub struct ChatServer {
    registry: Arc<ConnectionRegistry>,
    undelivered: UndeliveredStore,
    stats: StatsRegistry,
    auth: Box<dyn Authenticator>,
    options: ChatOptions,
    message_listeners: RwLock<Vec<MessageListener>>,
    stop_listeners: RwLock<Vec<StopListener>>,
}

impl ChatServer {
    pub fn new(options: ChatOptions, auth: Box<dyn Authenticator>) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            undelivered: UndeliveredStore::new(options.enable_undelivered_queue),
            stats: StatsRegistry::new(),
            auth,
            options,
            message_listeners: RwLock::new(Vec::new()),
            stop_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    pub fn undelivered(&self) -> &UndeliveredStore {
        &self.undelivered
    }

    pub fn add_message_listener(&self, listener: MessageListener) {
        self.message_listeners.write().push(listener);
    }

    pub fn add_stop_listener(&self, listener: StopListener) {
        self.stop_listeners.write().push(listener);
    }

    // -- Lifecycle --------------------------------------------------------------

    /// Handle a fresh upgrade: validate the query string, authenticate, and
    /// register the connection. On success the user's undelivered backlog is
    /// replayed.
    pub async fn on_connected(
        &self,
        query: &str,
        headers: &HeaderMap,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Connection, CloseRequest> {
        let request = UpgradeRequest::new(headers.clone(), query);

        if !request.has_params() {
            debug!(query, "upgrade with no query parameters");
            return Err((STATUS_INVALID_QUERY_PARAMS, "Invalid request".to_string()));
        }
        let raw_id = request.param("id").filter(|v| !v.is_empty()).ok_or((
            STATUS_INVALID_QUERY_PARAMS,
            "Id required in query parameter: ?id={id}".to_string(),
        ))?;
        let user_id: UserId = raw_id.parse().map_err(|_| {
            (
                STATUS_INVALID_QUERY_PARAMS,
                format!("Passed invalid id: id={raw_id}"),
            )
        })?;

        if !self.auth.validate(&request).await {
            debug!(user_id, "upgrade rejected by authenticator");
            return Err((STATUS_UNAUTHORIZED, "Unauthorized".to_string()));
        }

        let conn = self.registry.add(user_id, tx);
        self.stats.get(user_id).add_connection();
        metrics::gauge!("chat_connections_active", self.registry.total() as f64);
        info!(user_id, conn_id = conn.conn_id(), "user connected");

        self.redeliver_to(user_id);
        Ok(conn)
    }

    /// Peer or server closed the connection.
    pub fn on_disconnected(&self, conn: &Connection, code: u16, reason: &str) {
        // reaped and auth-refused connections are already gone
        if !self.registry.contains(conn.user_id(), conn.conn_id()) {
            return;
        }
        debug!(
            user_id = conn.user_id(),
            conn_id = conn.conn_id(),
            code,
            reason,
            "user disconnected"
        );
        self.stats.get(conn.user_id()).add_disconnection();
        self.registry.remove_connection(conn);
        metrics::gauge!("chat_connections_active", self.registry.total() as f64);
    }

    /// Ingress glue: one assembled message per call (the endpoint library
    /// reunites continuation frames before we see them), checked against the
    /// size cap and parsed into `send`. An error is a close request for the
    /// transport layer.
    pub fn on_frame(&self, conn: &Connection, frame: &[u8]) -> Result<(), CloseRequest> {
        if frame.len() > self.options.max_message_size {
            return Err((
                STATUS_MESSAGE_TOO_BIG,
                format!(
                    "Message too big. Maximum size: {}",
                    human_readable_bytes(self.options.max_message_size)
                ),
            ));
        }

        let raw = std::str::from_utf8(frame).map_err(|_| {
            (
                STATUS_INVALID_MESSAGE_PAYLOAD,
                "Invalid payload. Message is not valid UTF-8".to_string(),
            )
        })?;

        let payload = MessagePayload::parse(raw, self.options.preserve_api_timestamps)
            .map_err(|e| {
                (
                    STATUS_INVALID_MESSAGE_PAYLOAD,
                    format!("Invalid payload. {e}"),
                )
            })?;

        if self.should_send_back(&payload) {
            // the sender's copy never produces a delivery-status notification
            self.fan_out(payload.sender(), &payload, false);
        }

        self.send(payload);
        Ok(())
    }

    fn should_send_back(&self, payload: &MessagePayload) -> bool {
        if !self.options.enable_send_back || payload.is_for_bot() {
            return false;
        }
        !self
            .options
            .ignored_types_send_back
            .iter()
            .any(|t| payload.type_is(t))
    }

    // -- Fan-out ----------------------------------------------------------------

    /// The single fan-out entry point.
    ///
    /// Event listeners are notified exactly once per call, regardless of the
    /// delivery outcome. Bot-only payloads never touch the registry.
    pub fn send(&self, payload: MessagePayload) {
        if payload.is_for_bot() {
            debug!(id = %payload.id(), "payload addressed to bot only");
            self.notify_message_listeners(&payload);
            return;
        }

        self.notify_message_listeners(&payload);

        for &recipient in payload.recipients() {
            if recipient == BOT_USER_ID {
                // bot mixed into a multi-recipient list gets no connection lookup
                continue;
            }
            self.send_to(recipient, &payload);
        }
    }

    /// Fan a payload out to every live connection of one user.
    pub fn send_to(&self, recipient: UserId, payload: &MessagePayload) {
        self.fan_out(recipient, payload, true);
    }

    fn fan_out(&self, recipient: UserId, payload: &MessagePayload, echo: bool) {
        let wire = payload.to_wire().to_string();
        let bytes = wire.len();

        if self.registry.count(recipient) == 0 {
            self.handle_undeliverable(recipient, payload);
            // synthetic completion: the send still counts for the sender
            self.on_message_sent(payload, recipient, bytes, 0, echo);
            return;
        }

        let mut delivered = 0usize;
        let mut broken = Vec::new();
        let mut missing = 0usize;

        self.registry.for_each(
            recipient,
            |idx, conn, conn_id, user_id| {
                // one serialized buffer, a fresh enqueue per connection
                match conn.send_text(wire.clone()) {
                    Ok(_) => {
                        debug!(user_id, conn_id, idx, bytes, "frame enqueued");
                        delivered += 1;
                    }
                    Err(_) => broken.push(conn_id),
                }
            },
            |user_id, conn_id| {
                debug!(user_id, conn_id, "connection slot gone, spilling to undelivered");
                missing += 1;
            },
        );

        // registry lock released: now the completion work
        for conn_id in broken {
            debug!(recipient, conn_id, "dropping broken connection");
            self.registry.remove(recipient, conn_id);
            self.handle_undeliverable(recipient, payload);
        }
        for _ in 0..missing {
            self.handle_undeliverable(recipient, payload);
        }
        self.on_message_sent(payload, recipient, bytes, delivered, echo);
        if delivered > 0 {
            metrics::counter!("chat_messages_relayed_total", delivered as u64);
        }
    }

    /// Send completion for one recipient: the sender's counters move once per
    /// fan-out, the recipient's once per connection actually delivered.
    fn on_message_sent(
        &self,
        payload: &MessagePayload,
        recipient: UserId,
        bytes: usize,
        delivered: usize,
        echo: bool,
    ) {
        // delivery-status payloads never count nor echo, which is what keeps
        // the echo from amplifying itself
        if payload.is_delivery_status() {
            return;
        }

        self.stats.get(payload.sender()).add_sent(bytes as u64);
        for _ in 0..delivered {
            self.stats.get(recipient).add_received(bytes as u64);
        }

        if echo && self.options.enable_delivery_status {
            for _ in 0..delivered {
                self.send(MessagePayload::delivery_status(payload.sender()));
            }
        }
    }

    fn handle_undeliverable(&self, recipient: UserId, payload: &MessagePayload) {
        metrics::counter!("chat_messages_undeliverable_total", 1);
        if !self.undelivered.enabled() {
            debug!(recipient, "user unavailable, skipping message");
            return;
        }
        self.undelivered.push(recipient, payload.with_recipient(recipient));
    }

    /// Replay the undelivered backlog on reconnect, in arrival order. Each
    /// replay is a regular `send` and may spill back into the queue.
    fn redeliver_to(&self, recipient: UserId) {
        if !self.undelivered.enabled() {
            return;
        }
        let pending = self.undelivered.drain(recipient);
        if pending.is_empty() {
            return;
        }
        debug!(recipient, count = pending.len(), "redelivering queued messages");
        for payload in pending {
            self.send(payload);
        }
    }

    fn notify_message_listeners(&self, payload: &MessagePayload) {
        for listener in self.message_listeners.read().iter() {
            listener(payload.clone());
        }
    }

    // -- Shutdown ---------------------------------------------------------------

    /// Close every live connection and tell the sidecars to wind down.
    pub fn stop(&self) {
        info!("closing all chat connections");
        self.registry.close_all(STATUS_GOING_AWAY, "Going away");
        for listener in self.stop_listeners.read().iter() {
            listener();
        }
    }
}
