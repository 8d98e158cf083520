//! Maintenance loops that run beside the scan and ingest workers.
//!
//! The liveness monitor flips roots online/offline as their paths come and
//! go, rescanning a root when it returns. The catch-up loop feeds photos that
//! lack an embedding for the active model back into the ingest queue. Both
//! run on threads owned by the [`Indexer`] so `Indexer::stop` waits for them.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{Database, RootStatus};
use crate::indexer::Indexer;
use crate::watcher::WatchService;

/// Catch-up delay after a pass that enqueued work.
const CATCHUP_BUSY: Duration = Duration::from_millis(150);
/// Catch-up delay after a pass that found nothing to do.
const CATCHUP_IDLE: Duration = Duration::from_secs(3);
/// Catch-up delay while embeddings are disabled or the model cannot load.
const CATCHUP_DISABLED: Duration = Duration::from_secs(5);

/// What one liveness pass observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub online: usize,
    pub offline: usize,
    /// Roots that came back (or were seen for the first time) and got a scan.
    pub rescanned: Vec<i64>,
}

/// Check every tracked root once.
pub fn run_liveness_pass(
    db: &Database,
    indexer: &Indexer,
    watcher: Option<&dyn WatchService>,
) -> Result<LivenessReport> {
    let mut report = LivenessReport::default();

    for root in db.list_roots()? {
        let present = match root.path.try_exists() {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!(root_id = root.id, path = %root.path.display(), error = %e, "Root check failed");
                db.set_root_offline(root.id, Some(&e.to_string()))?;
                report.offline += 1;
                continue;
            }
        };

        if present {
            db.set_root_online(root.id)?;
            report.online += 1;
            if root.status != RootStatus::Online {
                tracing::info!(root_id = root.id, path = %root.path.display(), "Root online, rescanning");
                if indexer.enqueue_scan_root(root.id, &root.path) {
                    report.rescanned.push(root.id);
                }
            }
            if let Some(watcher) = watcher {
                if let Err(e) = watcher.watch(root.id, &root.path) {
                    tracing::warn!(root_id = root.id, error = %format!("{:#}", e), "Failed to watch root");
                }
            }
        } else {
            if root.status != RootStatus::Offline {
                tracing::warn!(root_id = root.id, path = %root.path.display(), "Root offline");
            }
            db.set_root_offline(root.id, None)?;
            report.offline += 1;
            // A remount needs a fresh watch.
            if let Some(watcher) = watcher {
                watcher.unwatch(root.id);
            }
        }
    }

    Ok(report)
}

/// Run [`run_liveness_pass`] every `interval` until the indexer stops.
pub fn spawn_monitor(
    indexer: &Arc<Indexer>,
    watcher: Option<Arc<dyn WatchService>>,
    interval: Duration,
) -> Result<()> {
    indexer.spawn_worker("lighthouse-monitor", move |indexer| {
        indexer.run_worker("monitor", |indexer, db| {
            if let Err(e) = run_liveness_pass(db, indexer, watcher.as_deref()) {
                tracing::warn!(error = %format!("{:#}", e), "Liveness pass failed");
            }
            indexer.sleep_unless_stopped(interval)
        });
    })
}

/// One catch-up pass. Returns how long to wait before the next.
pub fn catchup_step(indexer: &Indexer, db: &Database) -> Duration {
    match indexer.embedder() {
        Some(embedder) if indexer.vectors().is_some() && embedder.is_available() => {}
        _ => return CATCHUP_DISABLED,
    }
    match indexer.enqueue_missing_embeddings(db) {
        Ok(0) => CATCHUP_IDLE,
        Ok(n) => {
            tracing::debug!(enqueued = n, "Queued photos missing embeddings");
            CATCHUP_BUSY
        }
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "Embedding catch-up failed");
            CATCHUP_IDLE
        }
    }
}

pub fn spawn_catchup(indexer: &Arc<Indexer>) -> Result<()> {
    indexer.spawn_worker("lighthouse-catchup", |indexer| {
        indexer.run_worker("catchup", |indexer, db| {
            let pause = catchup_step(indexer, db);
            indexer.sleep_unless_stopped(pause)
        });
    })
}
