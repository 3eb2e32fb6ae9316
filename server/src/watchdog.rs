//! Liveness watchdog.
//!
//! Two-tick cadence: each sweep first reaps the connections that never
//! answered the previous round's ping, then pings everyone again. A peer
//! therefore has one full interval to answer before it is classified as
//! silent and closed with 4003.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chat::STATUS_INACTIVE_CONNECTION;
use crate::registry::ConnectionRegistry;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const REAP_REASON: &str = "Dangling connection";

/// Run the sweep loop until `shutdown` is cancelled.
pub async fn run_watchdog(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately; the first sweep waits one period
    ticker.tick().await;

    info!(interval_secs = interval.as_secs(), "watchdog started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = registry.reap_without_pong(STATUS_INACTIVE_CONNECTION, REAP_REASON);
                if reaped > 0 {
                    debug!(reaped, "disconnected dangling connections");
                    metrics::counter!("chat_connections_reaped_total", reaped as u64);
                }
                let pinged = registry.verify();
                debug!(pinged, "ping round issued");
            }
            _ = shutdown.cancelled() => {
                info!("watchdog stopping");
                break;
            }
        }
    }
}
