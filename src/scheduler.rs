//! Periodic staleness sweep.
//!
//! One cooperative loop: 30 s after startup, then every 15 min, find hosts
//! whose update cache is past the horizon, check them in parallel (the SSH
//! semaphore bounds real concurrency), and hand the outcomes to the
//! notification digester. Scheduled digests flush on the same tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::constants::scheduler::{STARTUP_DELAY_SECONDS, SWEEP_INTERVAL_SECONDS};
use crate::database::records::Reachability;
use crate::database::Database;
use crate::notify::{CheckEvent, Notifier};
use crate::orchestrator::Orchestrator;

pub struct Scheduler {
    database: Arc<Database>,
    orchestrator: Arc<Orchestrator>,
    notifier: Arc<Notifier>,
    cache_horizon_hours: u64,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(
        database: Arc<Database>,
        orchestrator: Arc<Orchestrator>,
        notifier: Arc<Notifier>,
        cache_horizon_hours: u64,
    ) -> Self {
        Self {
            database,
            orchestrator,
            notifier,
            cache_horizon_hours,
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the sweep loop. Calling this again is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running; start ignored");
            return;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(STARTUP_DELAY_SECONDS)).await;
            info!(
                "Scheduler running: sweep every {}s, cache horizon {}h",
                SWEEP_INTERVAL_SECONDS, scheduler.cache_horizon_hours
            );
            loop {
                if let Err(e) = scheduler.sweep().await {
                    warn!("Staleness sweep failed: {e:#}");
                }
                if let Err(e) = scheduler.notifier.flush_scheduled().await {
                    warn!("Digest flush failed: {e:#}");
                }
                tokio::time::sleep(Duration::from_secs(SWEEP_INTERVAL_SECONDS)).await;
            }
        });
    }

    /// One sweep: check every stale host and digest the outcomes.
    pub async fn sweep(&self) -> Result<()> {
        let stale_ids = self
            .database
            .stale_host_ids(self.cache_horizon_hours)
            .await?;
        if stale_ids.is_empty() {
            return Ok(());
        }
        info!("Staleness sweep: {} hosts due for a check", stale_ids.len());

        // Snapshot name and reachability before the checks overwrite them;
        // the digester needs the previous state for edge detection.
        let mut snapshots = Vec::with_capacity(stale_ids.len());
        for id in &stale_ids {
            let Some(host) = self.database.get_host(id).await? else {
                continue;
            };
            snapshots.push((host.id.clone(), host.name.clone(), host.reachability));
        }

        let checks = snapshots
            .iter()
            .map(|(id, _, _)| self.orchestrator.check(id));
        let results = futures::future::join_all(checks).await;

        let mut events = Vec::with_capacity(snapshots.len());
        for ((host_id, name, previous), result) in snapshots.into_iter().zip(results) {
            let previously_reachable = previous == Reachability::Reachable;
            match result {
                Ok(summary) => events.push(CheckEvent {
                    host_id,
                    host_name: name,
                    update_count: summary.update_count,
                    security_count: summary.security_count,
                    previously_reachable,
                    now_unreachable: false,
                }),
                Err(e) => {
                    warn!("Scheduled check failed for {name}: {e:#}");
                    events.push(CheckEvent {
                        host_id,
                        host_name: name,
                        update_count: 0,
                        security_count: 0,
                        previously_reachable,
                        now_unreachable: true,
                    });
                }
            }
        }

        self.notifier.dispatch_batch(&events).await
    }
}
