//! Liveness watchdog: reaps connections whose peer has gone silent.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;

use tether_core::HubConfig;

use crate::connection::ConnectionLifecycle;

/// Spawn the per-connection liveness timer. Each tick compares the time
/// since the last inbound frame against `heartbeat_interval *
/// heartbeat_tolerance`; crossing the line cancels the pending read and
/// forces disposal. Runs independently of the receive loop and stops when
/// the connection's cancellation token fires.
pub(crate) fn spawn_watchdog(lifecycle: Arc<ConnectionLifecycle>, config: &HubConfig) -> JoinHandle<()> {
    let interval = config.heartbeat_interval;
    let deadline = config.liveness_deadline();
    let tolerance = config.heartbeat_tolerance;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                _ = lifecycle.core.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let elapsed = lifecycle.core.since_last_inbound();
                    if elapsed >= deadline {
                        warn!(
                            conn_id = %lifecycle.core.id(),
                            elapsed_ms = elapsed.as_millis() as u64,
                            missed = tolerance,
                            "no inbound traffic, reaping connection"
                        );
                        // dispose queues the close frame and then cancels
                        // the pending read.
                        lifecycle.dispose(false).await;
                        break;
                    }
                }
            }
        }
    })
}
