use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters across every run of a coordinator.
///
/// Updated from worker threads while runs execute; callers can snapshot them at any time.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    files_rejected: AtomicU64,
    rows_processed: AtomicU64,
    values_stored: AtomicU64,
    errors_logged: AtomicU64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_run_started(&self) {
        let _ = self.runs_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_run_completed(&self) {
        let _ = self.runs_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_run_failed(&self) {
        let _ = self.runs_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_file_rejected(&self) {
        let _ = self.files_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_row_processed(&self) {
        let _ = self.rows_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_value_stored(&self) {
        let _ = self.values_stored.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_error_logged(&self) {
        let _ = self.errors_logged.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::SeqCst),
            runs_completed: self.runs_completed.load(Ordering::SeqCst),
            runs_failed: self.runs_failed.load(Ordering::SeqCst),
            files_rejected: self.files_rejected.load(Ordering::SeqCst),
            rows_processed: self.rows_processed.load(Ordering::SeqCst),
            values_stored: self.values_stored.load(Ordering::SeqCst),
            errors_logged: self.errors_logged.load(Ordering::SeqCst),
        }
    }
}

/// Immutable snapshot of [`IngestMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestMetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub files_rejected: u64,
    pub rows_processed: u64,
    pub values_stored: u64,
    pub errors_logged: u64,
}

impl fmt::Display for IngestMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "runs={}/{} (failed={}), files_rejected={}, rows={}, values={}, errors={}",
            self.runs_completed,
            self.runs_started,
            self.runs_failed,
            self.files_rejected,
            self.rows_processed,
            self.values_stored,
            self.errors_logged
        )
    }
}
