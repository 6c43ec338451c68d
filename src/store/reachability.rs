use crate::store::DurableStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const REACHABILITY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Refreshes `flag` from the store's health check until cancelled. The first
/// check runs immediately.
pub fn spawn_reachability_poller(
    store: Arc<dyn DurableStore>,
    flag: Arc<AtomicBool>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let reachable = store.is_reachable().await;
                    let previous = flag.swap(reachable, Ordering::Relaxed);
                    if previous != reachable {
                        if reachable {
                            info!("durable store reachable, persistence resumed");
                        } else {
                            warn!("durable store unreachable, persistence paused");
                        }
                    }
                }
            }
        }
    })
}
