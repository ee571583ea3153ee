//! Background stale-lease sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Dispatcher;

/// Spawn the periodic sweep that reclaims `running` jobs whose lease went
/// stale and enqueues `pending` jobs a failed submission left behind. Runs
/// until `shutdown` is cancelled.
pub fn spawn_stale_lease_sweep(
    dispatcher: Arc<Dispatcher>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Stale lease sweep stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = dispatcher.sweep_stale_leases().await {
                        tracing::error!(error = %e, "Stale lease sweep failed");
                    }
                    if let Err(e) = dispatcher.enqueue_stranded().await {
                        tracing::error!(error = %e, "Enqueue of stranded jobs failed");
                    }
                }
            }
        }
    })
}
