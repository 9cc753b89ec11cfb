//! Periodic reclamation of sessions whose heartbeat has lapsed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::InstanceCoordinator;

/// Run `reclaim_stale` every `interval` until `shutdown` flips to true or
/// its sender is dropped.
pub fn spawn_sweeper(
    coordinator: Arc<InstanceCoordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Session sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let coordinator = coordinator.clone();
                    match tokio::task::spawn_blocking(move || coordinator.reclaim_stale()).await {
                        Ok(Ok(report)) => {
                            if !report.marked_stale.is_empty() || !report.reclaimed.is_empty() {
                                info!(
                                    marked_stale = report.marked_stale.len(),
                                    reclaimed = report.reclaimed.len(),
                                    released = report.released_count(),
                                    "Sweep finished"
                                );
                            } else {
                                debug!("Sweep found nothing to reclaim");
                            }
                        }
                        Ok(Err(e)) => warn!(error = %e, "Sweep failed"),
                        Err(e) => warn!(error = %e, "Sweep task panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Session sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::memory_db::schema::{LeaseMode, SessionState};
    use crate::memory_db::{MemoryStore, StoreOptions};

    #[tokio::test]
    async fn test_sweeper_reclaims_and_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::open_in_memory(&StoreOptions::default()).unwrap());
        let coordinator = Arc::new(InstanceCoordinator::new(
            store,
            CoordinatorConfig {
                heartbeat_timeout: chrono::Duration::seconds(60),
                ..Default::default()
            },
        ));
        let long_ago = chrono::Utc::now() - chrono::Duration::minutes(10);
        coordinator.register_at("ghost", "coder", "/ws", long_ago).unwrap();
        coordinator.acquire_lease_at("ghost", "src/lib.rs", LeaseMode::Write, long_ago).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_sweeper(coordinator.clone(), Duration::from_millis(20), rx);

        let mut reclaimed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if coordinator.session("ghost").is_err() {
                reclaimed = true;
                break;
            }
        }
        assert!(reclaimed, "ghost session was never reclaimed");
        assert!(coordinator.leases_for("src/lib.rs").unwrap().is_empty());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_leaves_live_sessions_alone() {
        let store = Arc::new(MemoryStore::open_in_memory(&StoreOptions::default()).unwrap());
        let coordinator = Arc::new(InstanceCoordinator::new(store, CoordinatorConfig::default()));
        coordinator.register("alive", "coder", "/ws").unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_sweeper(coordinator.clone(), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        let session = coordinator.session("alive").unwrap();
        assert_eq!(session.state, SessionState::Active);
    }
}
