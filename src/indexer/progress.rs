//! In-memory pipeline progress.
//!
//! Written by the scanner and ingest threads, read by status reporting. One
//! mutex guards everything; each call holds it only for a few field updates
//! and readers get owned snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct ScanProgress {
    generation: u64,
    root_path: PathBuf,
    started_at: DateTime<Utc>,
    current_path: Option<PathBuf>,
    found: usize,
    enqueued: usize,
    processed: usize,
    scan_done: bool,
    had_errors: bool,
    finished_marked: bool,
}

#[derive(Debug)]
struct Wave {
    started_at: DateTime<Utc>,
    roots: HashSet<i64>,
    found: usize,
    enqueued: usize,
    had_errors: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveScan {
    pub root_id: i64,
    pub root_path: PathBuf,
    pub current_path: Option<PathBuf>,
    pub found: usize,
    pub enqueued: usize,
    pub processed: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub root_id: i64,
    pub root_path: PathBuf,
    pub found: usize,
    pub enqueued: usize,
    pub processed: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub had_errors: bool,
}

/// Totals across every root scanned while the scan queue stayed non-empty.
#[derive(Debug, Clone, Serialize)]
pub struct WaveSummary {
    pub roots: usize,
    pub found: usize,
    pub enqueued: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub had_errors: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub root_id: i64,
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRecord {
    pub at: DateTime<Utc>,
    pub photo_id: i64,
    pub root_id: i64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexerStats {
    pub scan_queue_len: usize,
    pub ingest_queue_len: usize,
    /// The running scan, or the root the ingest worker is catching up on.
    pub active_scan: Option<ActiveScan>,
    pub active_ingest_path: Option<PathBuf>,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub failed_total: u64,
    pub last_failure: Option<FailureRecord>,
    pub last_scan: Option<ScanSummary>,
    pub last_wave: Option<WaveSummary>,
}

#[derive(Debug, Clone)]
struct ActiveIngest {
    root_id: i64,
    root_path: PathBuf,
    path: PathBuf,
}

#[derive(Debug, Default)]
struct ProgressState {
    next_generation: u64,
    active_scan: Option<(i64, PathBuf)>,
    active_ingest: Option<ActiveIngest>,
    last_ingested_at: Option<DateTime<Utc>>,
    recent: VecDeque<IngestRecord>,
    scans: HashMap<i64, ScanProgress>,
    failed_total: u64,
    last_failure: Option<FailureRecord>,
    last_scan: Option<ScanSummary>,
    wave: Option<Wave>,
    last_wave: Option<WaveSummary>,
}

pub struct ProgressTracker {
    state: Mutex<ProgressState>,
    recent_max: usize,
}

impl ProgressTracker {
    pub fn new(recent_max: usize) -> Self {
        Self {
            state: Mutex::new(ProgressState::default()),
            recent_max: recent_max.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // Counters stay meaningful even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a scan of `root_id` and return its generation. Only ingest
    /// tasks tagged with this generation count towards the scan finishing.
    pub fn begin_scan(&self, root_id: i64, root_path: &Path) -> u64 {
        let now = Utc::now();
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.active_scan = Some((root_id, root_path.to_path_buf()));
        state.scans.insert(
            root_id,
            ScanProgress {
                generation,
                root_path: root_path.to_path_buf(),
                started_at: now,
                current_path: None,
                found: 0,
                enqueued: 0,
                processed: 0,
                scan_done: false,
                had_errors: false,
                finished_marked: false,
            },
        );
        let wave = state.wave.get_or_insert_with(|| Wave {
            started_at: now,
            roots: HashSet::new(),
            found: 0,
            enqueued: 0,
            had_errors: false,
        });
        wave.roots.insert(root_id);
        generation
    }

    pub fn scan_found(&self, root_id: i64, path: &Path) {
        let mut state = self.lock();
        if let Some(prog) = state.scans.get_mut(&root_id) {
            prog.current_path = Some(path.to_path_buf());
            prog.found += 1;
        }
        if let Some(wave) = state.wave.as_mut() {
            wave.found += 1;
        }
    }

    pub fn scan_enqueued(&self, root_id: i64) {
        let mut state = self.lock();
        if let Some(prog) = state.scans.get_mut(&root_id) {
            prog.enqueued += 1;
        }
        if let Some(wave) = state.wave.as_mut() {
            wave.enqueued += 1;
        }
    }

    /// Flag the root's current scan and the wave as having errors.
    pub fn scan_error(&self, root_id: i64) {
        let mut state = self.lock();
        if let Some(prog) = state.scans.get_mut(&root_id) {
            prog.had_errors = true;
        }
        if let Some(wave) = state.wave.as_mut() {
            wave.had_errors = true;
        }
    }

    /// An ingest queued by scan `scan` failed; that scan can no longer
    /// finish cleanly.
    pub fn ingest_failed(&self, root_id: i64, scan: Option<u64>) {
        if let Some(prog) = self.lock().scans.get_mut(&root_id) {
            if scan == Some(prog.generation) {
                prog.had_errors = true;
            }
        }
    }

    pub fn scan_enumerated(&self, root_id: i64) {
        if let Some(prog) = self.lock().scans.get_mut(&root_id) {
            prog.scan_done = true;
        }
    }

    /// Path the scan of `root_id` last yielded, if any.
    pub fn scan_current_path(&self, root_id: i64) -> Option<PathBuf> {
        self.lock()
            .scans
            .get(&root_id)
            .and_then(|p| p.current_path.clone())
    }

    /// Close the scan of `root_id`. The wave closes with it when no further
    /// scans are queued.
    pub fn end_scan(&self, root_id: i64, scan_queue_empty: bool) {
        let now = Utc::now();
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(prog) = state.scans.get_mut(&root_id) {
            prog.current_path = None;
            let summary = ScanSummary {
                root_id,
                root_path: prog.root_path.clone(),
                found: prog.found,
                enqueued: prog.enqueued,
                processed: prog.processed,
                started_at: prog.started_at,
                ended_at: now,
                had_errors: prog.had_errors,
            };
            state.last_scan = Some(summary);
        }
        state.active_scan = None;

        if scan_queue_empty {
            if let Some(wave) = state.wave.take() {
                state.last_wave = Some(WaveSummary {
                    roots: wave.roots.len(),
                    found: wave.found,
                    enqueued: wave.enqueued,
                    started_at: wave.started_at,
                    ended_at: now,
                    had_errors: wave.had_errors,
                });
            }
        }
    }

    pub fn begin_ingest(&self, root_id: i64, root_path: &Path, path: &Path) {
        self.lock().active_ingest = Some(ActiveIngest {
            root_id,
            root_path: root_path.to_path_buf(),
            path: path.to_path_buf(),
        });
    }

    /// Record one ingest. It counts as processed for the root's scan only
    /// when `scan` is that scan's generation. `photo_id` is set when the
    /// ingest wrote something, and lands in the recent activity feed.
    pub fn ingest_succeeded(&self, root_id: i64, path: &Path, photo_id: Option<i64>, scan: Option<u64>) {
        let now = Utc::now();
        let mut state = self.lock();
        state.last_ingested_at = Some(now);
        if let Some(prog) = state.scans.get_mut(&root_id) {
            if scan == Some(prog.generation) {
                prog.processed += 1;
            }
        }
        if let Some(photo_id) = photo_id {
            state.recent.push_back(IngestRecord {
                at: now,
                photo_id,
                root_id,
                path: path.to_path_buf(),
            });
            while state.recent.len() > self.recent_max {
                state.recent.pop_front();
            }
        }
    }

    pub fn end_ingest(&self) {
        self.lock().active_ingest = None;
    }

    pub fn record_failure(&self, root_id: i64, path: &Path, error: &str) {
        let mut state = self.lock();
        state.failed_total += 1;
        state.last_failure = Some(FailureRecord {
            at: Utc::now(),
            root_id,
            path: path.to_path_buf(),
            error: error.to_string(),
        });
    }

    /// True exactly once per scan: when enumeration finished without errors
    /// and ingest has processed everything the scan enqueued.
    pub fn take_scan_finished(&self, root_id: i64) -> bool {
        let mut state = self.lock();
        match state.scans.get_mut(&root_id) {
            Some(prog)
                if prog.scan_done
                    && !prog.had_errors
                    && !prog.finished_marked
                    && prog.processed >= prog.enqueued =>
            {
                prog.finished_marked = true;
                true
            }
            _ => false,
        }
    }

    /// Drop per-root progress after the root is untracked.
    pub fn forget_root(&self, root_id: i64) {
        self.lock().scans.remove(&root_id);
    }

    pub fn snapshot(&self, scan_queue_len: usize, ingest_queue_len: usize) -> IndexerStats {
        let state = self.lock();

        // Once enumeration ends, ingest may still be working through that
        // root; keep reporting its progress until it catches up.
        let focus = state.active_scan.clone().or_else(|| {
            state
                .active_ingest
                .as_ref()
                .map(|i| (i.root_id, i.root_path.clone()))
        });
        let active_scan = focus.map(|(root_id, root_path)| match state.scans.get(&root_id) {
            Some(prog) => ActiveScan {
                root_id,
                root_path,
                current_path: prog.current_path.clone(),
                found: prog.found,
                enqueued: prog.enqueued,
                processed: prog.processed,
                started_at: prog.started_at,
            },
            None => ActiveScan {
                root_id,
                root_path,
                current_path: None,
                found: 0,
                enqueued: 0,
                processed: 0,
                started_at: Utc::now(),
            },
        });

        IndexerStats {
            scan_queue_len,
            ingest_queue_len,
            active_scan,
            active_ingest_path: state.active_ingest.as_ref().map(|i| i.path.clone()),
            last_ingested_at: state.last_ingested_at,
            failed_total: state.failed_total,
            last_failure: state.last_failure.clone(),
            last_scan: state.last_scan.clone(),
            last_wave: state.last_wave.clone(),
        }
    }

    /// Most recent ingests, newest first.
    pub fn recent_activity(&self, limit: usize) -> Vec<IngestRecord> {
        let limit = limit.clamp(1, self.recent_max);
        self.lock().recent.iter().rev().take(limit).cloned().collect()
    }
}

/// Limits persisted root errors to one per interval per root.
pub struct RootErrorLimiter {
    interval: Duration,
    last: Mutex<HashMap<i64, Instant>>,
}

impl RootErrorLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// True when an error for `root_id` may be written now; records the write.
    pub fn allow(&self, root_id: i64) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match last.get(&root_id) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                last.insert(root_id, now);
                true
            }
        }
    }
}
