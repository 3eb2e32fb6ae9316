//! Connection registry: users to their live connections, plus the pong-wait
//! table driving the watchdog sweep.
//!
//! A connection is an unbounded sender into its socket's writer task. Enqueue
//! failure means the writer is gone, which is the broken-pipe signal the chat
//! core reacts to. `visit` callbacks in [`ConnectionRegistry::for_each`] run
//! under the registry lock and must not call back into the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

pub type UserId = u64;
pub type ConnId = u64;

/// Frames a connection's writer task understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
#[error("broken pipe")]
pub struct BrokenPipe;

/// Handle to one live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    user_id: UserId,
    conn_id: ConnId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Enqueue a text frame. Returns the payload length on success.
    pub fn send_text(&self, wire: String) -> Result<usize, BrokenPipe> {
        let bytes = wire.len();
        self.tx
            .send(Outbound::Text(wire))
            .map(|_| bytes)
            .map_err(|_| BrokenPipe)
    }

    pub fn send_ping(&self) -> Result<(), BrokenPipe> {
        self.tx.send(Outbound::Ping).map_err(|_| BrokenPipe)
    }

    pub fn send_close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct PongWait {
    user_id: UserId,
    received: bool,
}

/// `{user → {connection-id → connection}}` plus the pong-wait table.
///
/// The only way a connection enters the registry is [`ConnectionRegistry::add`],
/// so every registered connection has a user id.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<UserId, HashMap<ConnId, Connection>>>,
    pong_wait: Mutex<HashMap<ConnId, PongWait>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            pong_wait: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a connection for `user_id`, assigning its connection id.
    pub fn add(&self, user_id: UserId, tx: mpsc::UnboundedSender<Outbound>) -> Connection {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection {
            user_id,
            conn_id,
            tx,
        };
        let mut map = self.connections.lock();
        let user_conns = map.entry(user_id).or_default();
        user_conns.insert(conn_id, conn.clone());
        debug!(user_id, conn_id, connections = user_conns.len(), "connection added");
        conn
    }

    /// Idempotent removal by `(user, connection)` pair.
    pub fn remove(&self, user_id: UserId, conn_id: ConnId) {
        let mut map = self.connections.lock();
        if let Some(user_conns) = map.get_mut(&user_id) {
            if user_conns.remove(&conn_id).is_some() {
                debug!(user_id, conn_id, left = user_conns.len(), "connection removed");
            }
            if user_conns.is_empty() {
                map.remove(&user_id);
            }
        }
    }

    pub fn remove_connection(&self, conn: &Connection) {
        self.remove(conn.user_id, conn.conn_id);
    }

    /// Whether the `(user, connection)` pair is currently registered.
    pub fn contains(&self, user_id: UserId, conn_id: ConnId) -> bool {
        self.connections
            .lock()
            .get(&user_id)
            .is_some_and(|c| c.contains_key(&conn_id))
    }

    pub fn count(&self, user_id: UserId) -> usize {
        self.connections
            .lock()
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    pub fn total(&self) -> usize {
        self.connections.lock().values().map(HashMap::len).sum()
    }

    pub fn all_users(&self) -> Vec<UserId> {
        self.connections.lock().keys().copied().collect()
    }

    /// Snapshot of the user's connections.
    pub fn get(&self, user_id: UserId) -> Vec<Connection> {
        self.connections
            .lock()
            .get(&user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Iterate the user's connections under the registry lock.
    ///
    /// `visit` receives a stable index for logging. Connections whose writer
    /// is already gone are removed in place and reported via `on_missing`.
    pub fn for_each(
        &self,
        user_id: UserId,
        mut visit: impl FnMut(usize, &Connection, ConnId, UserId),
        mut on_missing: impl FnMut(UserId, ConnId),
    ) {
        let mut map = self.connections.lock();
        let Some(user_conns) = map.get_mut(&user_id) else {
            return;
        };

        let mut stale = Vec::new();
        for (idx, (conn_id, conn)) in user_conns.iter().enumerate() {
            if conn.is_closed() {
                stale.push(*conn_id);
                on_missing(user_id, *conn_id);
                continue;
            }
            visit(idx, conn, *conn_id, user_id);
        }
        for conn_id in stale {
            user_conns.remove(&conn_id);
        }
        if user_conns.is_empty() {
            map.remove(&user_id);
        }
    }

    // -- Watchdog support -------------------------------------------------------

    /// Ping every live connection and arm the pong-wait table.
    ///
    /// Connections that cannot even enqueue the ping are dropped on the spot.
    /// Returns the number of pings issued.
    pub fn verify(&self) -> usize {
        let mut map = self.connections.lock();
        let mut pong_wait = self.pong_wait.lock();
        let mut pinged = 0;
        let mut empty_users = Vec::new();

        for (user_id, user_conns) in map.iter_mut() {
            user_conns.retain(|conn_id, conn| {
                if conn.send_ping().is_ok() {
                    pong_wait.insert(
                        *conn_id,
                        PongWait {
                            user_id: *user_id,
                            received: false,
                        },
                    );
                    pinged += 1;
                    true
                } else {
                    debug!(user_id, conn_id, "dropping connection that refused a ping");
                    false
                }
            });
            if user_conns.is_empty() {
                empty_users.push(*user_id);
            }
        }
        for user_id in empty_users {
            map.remove(&user_id);
        }
        pinged
    }

    pub fn mark_pong_received(&self, conn_id: ConnId) {
        if let Some(entry) = self.pong_wait.lock().get_mut(&conn_id) {
            entry.received = true;
        }
    }

    /// Drain the pong-wait table; close and unregister every connection that
    /// never answered. Returns how many were reaped.
    pub fn reap_without_pong(&self, code: u16, reason: &str) -> usize {
        let waiting: Vec<(ConnId, PongWait)> = self.pong_wait.lock().drain().collect();
        let mut reaped = 0;

        for (conn_id, wait) in waiting {
            if wait.received {
                continue;
            }
            let conn = {
                let mut map = self.connections.lock();
                let removed = map
                    .get_mut(&wait.user_id)
                    .and_then(|user_conns| user_conns.remove(&conn_id));
                if map.get(&wait.user_id).is_some_and(HashMap::is_empty) {
                    map.remove(&wait.user_id);
                }
                removed
            };
            if let Some(conn) = conn {
                conn.send_close(code, reason);
                reaped += 1;
            }
        }
        reaped
    }

    /// Close every connection, e.g. on server stop.
    pub fn close_all(&self, code: u16, reason: &str) {
        let drained: Vec<Connection> = {
            let mut map = self.connections.lock();
            map.drain()
                .flat_map(|(_, conns)| conns.into_values())
                .collect()
        };
        for conn in drained {
            conn.send_close(code, reason);
        }
        self.pong_wait.lock().clear();
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &ConnectionRegistry, user: UserId) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.add(user, tx), rx)
    }

    #[test]
    fn add_count_remove() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.count(7), 0);

        let (a, _rx_a) = connect(&registry, 7);
        let (b, _rx_b) = connect(&registry, 7);
        assert_ne!(a.conn_id(), b.conn_id());
        assert_eq!(registry.count(7), 2);
        assert_eq!(registry.total(), 2);
        assert_eq!(registry.get(7).len(), 2);
        assert!(registry.get(8).is_empty());

        registry.remove(7, a.conn_id());
        assert_eq!(registry.count(7), 1);
        // removal is idempotent
        registry.remove(7, a.conn_id());
        assert_eq!(registry.count(7), 1);

        registry.remove_connection(&b);
        assert_eq!(registry.count(7), 0);
        assert!(registry.all_users().is_empty());
    }

    #[test]
    fn for_each_visits_live_and_reports_stale() {
        let registry = ConnectionRegistry::new();
        let (_a, _rx_a) = connect(&registry, 7);
        let (b, rx_b) = connect(&registry, 7);
        drop(rx_b); // writer gone: slot is stale

        let mut visited = Vec::new();
        let mut missing = Vec::new();
        registry.for_each(
            7,
            |idx, conn, conn_id, user_id| {
                assert_eq!(conn.conn_id(), conn_id);
                assert_eq!(user_id, 7);
                visited.push(idx);
            },
            |_, conn_id| missing.push(conn_id),
        );

        assert_eq!(visited.len(), 1);
        assert_eq!(missing, vec![b.conn_id()]);
        // stale slot was removed in place
        assert_eq!(registry.count(7), 1);
    }

    #[test]
    fn verify_then_reap_closes_silent_connections() {
        let registry = ConnectionRegistry::new();
        let (alive, mut rx_alive) = connect(&registry, 1);
        let (silent, mut rx_silent) = connect(&registry, 2);

        assert_eq!(registry.verify(), 2);
        assert_eq!(rx_alive.try_recv().unwrap(), Outbound::Ping);
        assert_eq!(rx_silent.try_recv().unwrap(), Outbound::Ping);

        // only the first connection answers
        registry.mark_pong_received(alive.conn_id());

        let reaped = registry.reap_without_pong(4003, "Dangling connection");
        assert_eq!(reaped, 1);
        assert_eq!(registry.count(1), 1);
        assert_eq!(registry.count(2), 0);
        match rx_silent.try_recv().unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 4003);
                assert_eq!(reason, "Dangling connection");
            }
            other => panic!("expected close, got {other:?}"),
        }
        let _ = silent;

        // table fully drained: next sweep starts fresh
        assert_eq!(registry.reap_without_pong(4003, "Dangling connection"), 0);
    }

    #[test]
    fn pong_within_one_cycle_is_never_reaped() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connect(&registry, 1);

        for _ in 0..3 {
            registry.verify();
            registry.mark_pong_received(conn.conn_id());
            assert_eq!(registry.reap_without_pong(4003, "Dangling connection"), 0);
            assert_eq!(registry.count(1), 1);
        }
    }

    #[test]
    fn verify_drops_connections_refusing_the_ping() {
        let registry = ConnectionRegistry::new();
        let (_a, rx) = connect(&registry, 1);
        drop(rx);
        assert_eq!(registry.verify(), 0);
        assert_eq!(registry.count(1), 0);
    }

    #[test]
    fn close_all_empties_the_registry() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = connect(&registry, 1);
        let (_b, mut rx_b) = connect(&registry, 2);

        registry.close_all(1001, "Going away");
        assert_eq!(registry.total(), 0);
        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                Outbound::Close { code, .. } => assert_eq!(code, 1001),
                other => panic!("expected close, got {other:?}"),
            }
        }
    }
}
