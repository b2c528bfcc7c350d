//! Liveness beacon.
//!
//! Agents ping the name server on a fixed period so an operator can see who
//! is alive. A missed ping never aborts work; peers discover death through
//! resolve and connect failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::nameserver::NameClient;

pub const DEFAULT_PING_PERIOD: Duration = Duration::from_millis(100);

/// Background task pinging the name server until stopped.
pub struct PingTask {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl PingTask {
    pub fn spawn(client: Arc<NameClient>, name: String, period: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.ping(&name).await {
                            debug!(agent = %name, error = %e, "ping failed");
                        }
                    }
                }
            }
        });
        Self { handle, shutdown }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}
