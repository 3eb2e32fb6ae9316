//! Per-recipient FIFO of payloads awaiting the user's return.
//!
//! Disabled by configuration; when off, undeliverable payloads are dropped
//! with a log line. Enqueued payloads already carry the single-recipient
//! rewrite, so redelivery is a plain `send`.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use crate::payload::MessagePayload;
use crate::registry::UserId;

pub struct UndeliveredStore {
    enabled: bool,
    queues: Mutex<HashMap<UserId, VecDeque<MessagePayload>>>,
}

impl UndeliveredStore {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Append for `user`. Returns false when the queue is disabled.
    pub fn push(&self, user: UserId, payload: MessagePayload) -> bool {
        if !self.enabled {
            debug!(user, "undelivered queue disabled, dropping payload");
            return false;
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(user).or_default();
        queue.push_back(payload);
        debug!(user, pending = queue.len(), "payload queued for redelivery");
        true
    }

    /// Remove and return everything pending for `user`, in arrival order.
    pub fn drain(&self, user: UserId) -> Vec<MessagePayload> {
        self.queues
            .lock()
            .remove(&user)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, user: UserId) -> usize {
        self.queues.lock().get(&user).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, user: UserId) -> bool {
        self.len(user) == 0
    }
}
