use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub enum WorkEvent {
    WorkerSpawned {
        worker: usize,
    },
    WorkerDied {
        worker: usize,
        panicked: bool,
    },
    Started {
        id: String,
    },
    Done {
        id: String,
        elapsed_ms: u128,
    },
    Retrying {
        id: String,
        remaining: u32,
        error: String,
    },
    Failed {
        id: String,
        error: String,
        elapsed_ms: u128,
    },
}

/// Tallies of one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub workers_spawned: usize,
    pub workers_died: usize,
    pub started: usize,
    pub done: usize,
    pub retried: usize,
    pub failed: usize,
    pub failed_items: Vec<String>,
    pub elapsed: Duration,
}

impl Report {
    pub fn ok(&self) -> bool {
        self.failed == 0
    }

    /// Fold the tallies of a later run into this one.
    pub fn absorb(&mut self, other: Report) {
        self.workers_spawned += other.workers_spawned;
        self.workers_died += other.workers_died;
        self.started += other.started;
        self.done += other.done;
        self.retried += other.retried;
        self.failed += other.failed;
        self.failed_items.extend(other.failed_items);
        self.elapsed += other.elapsed;
    }
}

#[derive(Default)]
struct ReporterState {
    started_at: Option<Instant>,
    report: Report,
}

/// Turns worker events into log lines and keeps the tallies for the summary.
/// Terminal failures go out at `error` so they also land in the error log.
#[derive(Default)]
pub struct Reporter {
    state: Mutex<ReporterState>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, ev: WorkEvent) {
        let mut s = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if s.started_at.is_none() {
            s.started_at = Some(Instant::now());
        }
        let r = &mut s.report;
        match ev {
            WorkEvent::WorkerSpawned { worker } => {
                r.workers_spawned = r.workers_spawned.saturating_add(1);
                tracing::debug!(worker, "worker spawned");
            }
            WorkEvent::WorkerDied { worker, panicked } => {
                if panicked {
                    r.workers_died = r.workers_died.saturating_add(1);
                    warn!(worker, "worker died, replacing it if work remains");
                }
            }
            WorkEvent::Started { id } => {
                r.started = r.started.saturating_add(1);
                info!(item = %id, "start");
            }
            WorkEvent::Done { id, elapsed_ms } => {
                r.done = r.done.saturating_add(1);
                info!(item = %id, elapsed_ms = elapsed_ms as u64, "done");
            }
            WorkEvent::Retrying {
                id,
                remaining,
                error,
            } => {
                r.retried = r.retried.saturating_add(1);
                warn!(item = %id, remaining, "{error}; re-queued");
            }
            WorkEvent::Failed {
                id,
                error,
                elapsed_ms,
            } => {
                r.failed = r.failed.saturating_add(1);
                r.failed_items.push(id.clone());
                error!(item = %id, elapsed_ms = elapsed_ms as u64, "failed: {error}");
            }
        }
    }

    pub fn snapshot(&self) -> Report {
        let s = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut report = s.report.clone();
        report.elapsed = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
        report
    }

    /// Log the end-of-run summary and hand back the tallies.
    pub fn finish(&self, what: &str) -> Report {
        let report = self.snapshot();
        info!(
            status = if report.ok() { "ok" } else { "failed" },
            workers = report.workers_spawned,
            started = report.started,
            done = report.done,
            retried = report.retried,
            failed = report.failed,
            elapsed = %format_elapsed_hms(report.elapsed.as_secs()),
            "{what} summary"
        );
        if !report.failed_items.is_empty() {
            let mut failed = report.failed_items.clone();
            failed.sort();
            failed.dedup();
            error!("{what}: failed items: {}", failed.join(", "));
        }
        report
    }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
