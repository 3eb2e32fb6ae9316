//! Event notifier: mirrors every payload the chat core sees to the
//! configured targets, with bounded retry and per-target fallback chains.
//!
//! Producer side is the chat core's message listener; consumer side is a
//! worker loop draining a shared queue under a condition variable keyed to
//! the retry interval, spawning one fire-and-forget task per due entry.
//! Ordering is not guaranteed anywhere, and a retry may duplicate toward a
//! target that already received the payload; consumers must be idempotent.

pub mod amqp;
pub mod postback;
pub mod target;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::ChatServer;
use crate::payload::MessagePayload;
use crate::settings::EventSettings;

pub use target::{build_target, EventTarget, TargetError};

#[derive(Debug, Clone)]
pub struct NotifierOptions {
    pub enable_retry: bool,
    pub retry_interval: std::time::Duration,
    pub max_retries: u32,
    pub max_parallel_workers: usize,
    pub send_bot_messages: bool,
    pub ignore_types: Vec<String>,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            enable_retry: true,
            retry_interval: std::time::Duration::from_secs(10),
            max_retries: 3,
            max_parallel_workers: 8,
            send_bot_messages: false,
            ignore_types: Vec::new(),
        }
    }
}

impl From<&EventSettings> for NotifierOptions {
    fn from(settings: &EventSettings) -> Self {
        Self {
            enable_retry: settings.enable_retry,
            retry_interval: settings.retry_interval(),
            max_retries: settings.retry_count,
            max_parallel_workers: settings.parallel_workers(),
            send_bot_messages: settings.send_bot_messages,
            ignore_types: settings.ignore_types.clone(),
        }
    }
}

/// One in-flight delivery: a payload bound to its current target.
pub struct SendStatus {
    pub target: Arc<dyn EventTarget>,
    pub payload: MessagePayload,
    pub last_attempt_at: Option<Instant>,
    pub attempts: u32,
    pub fallback_chain: VecDeque<Arc<dyn EventTarget>>,
    pub last_error: Option<String>,
}

impl SendStatus {
    fn new(target: Arc<dyn EventTarget>, payload: MessagePayload) -> Self {
        let fallback_chain = target.fallbacks().iter().cloned().collect();
        Self {
            target,
            payload,
            last_attempt_at: None,
            attempts: 0,
            fallback_chain,
            last_error: None,
        }
    }
}

pub type ErrorListener = Box<dyn Fn(&SendStatus) + Send + Sync>;

pub struct EventNotifier {
    options: NotifierOptions,
    targets: Vec<Arc<dyn EventTarget>>,
    queue: Mutex<VecDeque<SendStatus>>,
    wakeup: Notify,
    error_listeners: RwLock<Vec<ErrorListener>>,
    shutdown: CancellationToken,
}

impl EventNotifier {
    pub fn new(
        options: NotifierOptions,
        targets: Vec<Arc<dyn EventTarget>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            targets,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            error_listeners: RwLock::new(Vec::new()),
            shutdown,
        })
    }

    /// Hook into the chat core: mirror its messages, stop when it stops.
    pub fn subscribe(self: &Arc<Self>, chat: &ChatServer) {
        let notifier = Arc::clone(self);
        chat.add_message_listener(Box::new(move |payload| notifier.on_message(payload)));

        let notifier = Arc::clone(self);
        chat.add_stop_listener(Box::new(move || notifier.shutdown.cancel()));
    }

    /// Called when the subject payload is definitively undeliverable to its
    /// current target. Hands over to the fallback chain.
    pub fn add_error_listener(&self, listener: ErrorListener) {
        self.error_listeners.write().push(listener);
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    // -- Ingress ----------------------------------------------------------------

    /// Message listener: filter, then enqueue one entry per primary target.
    pub fn on_message(&self, payload: MessagePayload) {
        if payload.is_from_bot() && !self.options.send_bot_messages {
            debug!("skipping bot message (sender=0)");
            return;
        }
        if self
            .options
            .ignore_types
            .iter()
            .any(|t| payload.type_is(t))
        {
            return;
        }

        let mut queue = self.queue.lock();
        for target in &self.targets {
            queue.push_back(SendStatus::new(target.clone(), payload.clone()));
        }
        drop(queue);
        self.wakeup.notify_one();
    }

    // -- Worker -----------------------------------------------------------------

    /// Drain loop. Runs until shutdown; wakes on new work or after one retry
    /// interval, whichever comes first.
    pub async fn run_worker(self: Arc<Self>) {
        info!("event notifier started with targets:");
        for target in &self.targets {
            info!(" - {}", target.kind());
            for fallback in target.fallbacks() {
                info!("   - fallback: {}", fallback.kind());
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::timeout(self.options.retry_interval, self.wakeup.notified()) => {}
            }

            let bulk: Vec<SendStatus> = {
                let mut queue = self.queue.lock();
                let take = queue.len().min(self.options.max_parallel_workers);
                queue.drain(..take).collect()
            };

            let mut dispatched = 0;
            for status in bulk {
                if !self.ready(&status) {
                    self.requeue(status);
                    continue;
                }
                let notifier = Arc::clone(&self);
                tokio::spawn(async move { notifier.attempt(status).await });
                dispatched += 1;
            }
            if dispatched > 0 {
                debug!(dispatched, "dispatched notifier deliveries");
            }
        }

        info!("event notifier stopped");
    }

    /// A status is due when it has never been attempted or its last attempt
    /// is at least one retry interval old.
    fn ready(&self, status: &SendStatus) -> bool {
        if !self.options.enable_retry || status.attempts == 0 {
            return true;
        }
        status
            .last_attempt_at
            .map(|at| at.elapsed() >= self.options.retry_interval)
            .unwrap_or(true)
    }

    fn max_attempts(&self) -> u32 {
        if self.options.enable_retry {
            self.options.max_retries.max(1)
        } else {
            1
        }
    }

    async fn attempt(self: Arc<Self>, mut status: SendStatus) {
        // a stopped notifier starts no new deliveries
        if self.shutdown.is_cancelled() {
            return;
        }

        match status.target.deliver(&status.payload).await {
            Ok(()) => {
                debug!(target = status.target.kind(), "event delivered");
                metrics::counter!("event_deliveries_total", 1);
            }
            Err(e) => {
                status.attempts += 1;
                status.last_attempt_at = Some(Instant::now());
                status.last_error = Some(e.to_string());
                debug!(
                    target = status.target.kind(),
                    attempts = status.attempts,
                    error = %e,
                    "event delivery failed"
                );
                metrics::counter!("event_delivery_failures_total", 1);

                if status.attempts < self.max_attempts() {
                    self.requeue(status);
                    self.wakeup.notify_one();
                } else {
                    self.on_delivery_failed(status);
                }
            }
        }
    }

    fn requeue(&self, status: SendStatus) {
        self.queue.lock().push_back(status);
    }

    /// Retries exhausted: notify listeners, then hand over to the next
    /// fallback with a fresh attempt budget. An empty chain drops the
    /// payload for good.
    fn on_delivery_failed(&self, mut status: SendStatus) {
        for listener in self.error_listeners.read().iter() {
            listener(&status);
        }

        match status.fallback_chain.pop_front() {
            Some(next) => {
                warn!(
                    from = status.target.kind(),
                    to = next.kind(),
                    error = status.last_error.as_deref().unwrap_or(""),
                    "target exhausted retries, failing over"
                );
                status.target = next;
                status.attempts = 0;
                status.last_attempt_at = None;
                self.requeue(status);
                self.wakeup.notify_one();
            }
            None => {
                warn!(
                    target = status.target.kind(),
                    id = %status.payload.id(),
                    error = status.last_error.as_deref().unwrap_or(""),
                    "no fallback left, dropping payload"
                );
                metrics::counter!("event_payloads_dropped_total", 1);
            }
        }
    }
}
