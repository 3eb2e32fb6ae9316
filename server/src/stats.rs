//! Per-user counters.
//!
//! Records are created lazily; once a record exists every increment is a
//! lock-free atomic. Snapshots feed the REST control surface.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::registry::UserId;

pub struct UserStats {
    id: UserId,
    connected_times: AtomicU64,
    disconnected_times: AtomicU64,
    bytes_transferred: AtomicU64,
    sent_messages: AtomicU64,
    received_messages: AtomicU64,
    last_connect_at: AtomicI64,
    last_disconnect_at: AtomicI64,
    last_message_at: AtomicI64,
}

impl UserStats {
    fn new(id: UserId) -> Self {
        Self {
            id,
            connected_times: AtomicU64::new(0),
            disconnected_times: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            sent_messages: AtomicU64::new(0),
            received_messages: AtomicU64::new(0),
            last_connect_at: AtomicI64::new(0),
            last_disconnect_at: AtomicI64::new(0),
            last_message_at: AtomicI64::new(0),
        }
    }

    pub fn add_connection(&self) {
        self.connected_times.fetch_add(1, Ordering::Relaxed);
        self.last_connect_at.store(now(), Ordering::Relaxed);
    }

    pub fn add_disconnection(&self) {
        self.disconnected_times.fetch_add(1, Ordering::Relaxed);
        self.last_disconnect_at.store(now(), Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: u64) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.last_message_at.store(now(), Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.last_message_at.store(now(), Ordering::Relaxed);
    }

    /// Online while more connects than disconnects have been recorded.
    pub fn is_online(&self) -> bool {
        self.connected_times.load(Ordering::Relaxed) > self.disconnected_times.load(Ordering::Relaxed)
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    pub fn received_messages(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn connected_times(&self) -> u64 {
        self.connected_times.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatSnapshot {
        let now = now();
        let online = self.is_online();
        let last_connect = self.last_connect_at.load(Ordering::Relaxed);
        let last_disconnect = self.last_disconnect_at.load(Ordering::Relaxed);
        let last_message = self.last_message_at.load(Ordering::Relaxed);

        // inactivity counts from the last message when there was one,
        // otherwise from the last connection
        let inactive_since = if last_message > 0 { last_message } else { last_connect };

        StatSnapshot {
            id: self.id,
            is_online: online,
            last_connection: last_connect,
            connected_times: self.connected_times.load(Ordering::Relaxed),
            disconnected_times: self.disconnected_times.load(Ordering::Relaxed),
            last_message_time: last_message,
            time_online: if online { seconds_since(now, last_connect) } else { 0 },
            time_offline: if online { 0 } else { seconds_since(now, last_disconnect) },
            time_inactivity: seconds_since(now, inactive_since),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            received_messages: self.received_messages.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn seconds_since(now: i64, then: i64) -> i64 {
    if then <= 0 {
        return 0;
    }
    (now - then).max(0)
}

/// Wire shape of one statistics record, field names matching the control
/// surface contract.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatSnapshot {
    pub id: UserId,
    pub is_online: bool,
    pub last_connection: i64,
    pub connected_times: u64,
    pub disconnected_times: u64,
    pub last_message_time: i64,
    pub time_online: i64,
    pub time_offline: i64,
    pub time_inactivity: i64,
    pub sent_messages: u64,
    pub received_messages: u64,
    pub bytes_transferred: u64,
}

impl StatSnapshot {
    /// Zero-valued record for users the store has never seen.
    pub fn zero(id: UserId) -> Self {
        Self {
            id,
            is_online: false,
            last_connection: 0,
            connected_times: 0,
            disconnected_times: 0,
            last_message_time: 0,
            time_online: 0,
            time_offline: 0,
            time_inactivity: 0,
            sent_messages: 0,
            received_messages: 0,
            bytes_transferred: 0,
        }
    }
}

pub struct StatsRegistry {
    records: DashMap<UserId, Arc<UserStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Record for `id`, created on first touch.
    pub fn get(&self, id: UserId) -> Arc<UserStats> {
        self.records
            .entry(id)
            .or_insert_with(|| Arc::new(UserStats::new(id)))
            .clone()
    }

    /// Record for `id` without creating one.
    pub fn peek(&self, id: UserId) -> Option<Arc<UserStats>> {
        self.records.get(&id).map(|r| r.clone())
    }

    pub fn snapshot_all(&self) -> Vec<StatSnapshot> {
        let mut out: Vec<StatSnapshot> = self.records.iter().map(|r| r.snapshot()).collect();
        out.sort_by_key(|s| s.id);
        out
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
