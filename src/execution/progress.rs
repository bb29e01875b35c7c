use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::types::IngestId;

/// Lifecycle of an ingest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    Pending,
    Processing,
    Complete,
    Failed,
}

/// Live progress of one run, as returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub id: IngestId,
    pub status: IngestState,
    pub percent: u64,
    pub current_file_percent: u64,
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressSnapshot {
    fn pending(id: IngestId) -> Self {
        Self {
            id,
            status: IngestState::Pending,
            percent: 0,
            current_file_percent: 0,
            current_file: None,
            error: None,
        }
    }
}

/// Integer percentage, floor-divided. An empty denominator counts as finished.
pub fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    (u128::from(done.min(total)) * 100 / u128::from(total)) as u64
}

/// Progress of every tracked run, keyed by ingest id.
///
/// Runs are tracked from registration until they are retired. The coordinator retires failed
/// runs too once their failure is on the ingest record, so the table only holds runs in flight
/// plus failures the store could not take.
#[derive(Debug, Default)]
pub struct ProgressTable {
    runs: Mutex<HashMap<IngestId, ProgressSnapshot>>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IngestId, ProgressSnapshot>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: IngestId) {
        self.lock().insert(id, ProgressSnapshot::pending(id));
    }

    pub fn start(&self, id: IngestId) {
        if let Some(run) = self.lock().get_mut(&id) {
            run.status = IngestState::Processing;
        }
    }

    /// Record the position reached in `file`.
    pub fn update(
        &self,
        id: IngestId,
        file: &str,
        file_position: u64,
        file_size: u64,
        processed: u64,
        total: u64,
    ) {
        if let Some(run) = self.lock().get_mut(&id) {
            run.status = IngestState::Processing;
            run.percent = percent(processed, total);
            run.current_file_percent = percent(file_position, file_size);
            if run.current_file.as_deref() != Some(file) {
                run.current_file = Some(file.to_owned());
            }
        }
    }

    pub fn fail(&self, id: IngestId, message: impl Into<String>) {
        if let Some(run) = self.lock().get_mut(&id) {
            run.status = IngestState::Failed;
            run.error = Some(message.into());
        }
    }

    /// Stop tracking a finished run.
    pub fn retire(&self, id: IngestId) -> Option<ProgressSnapshot> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: IngestId) -> Option<ProgressSnapshot> {
        self.lock().get(&id).cloned()
    }

    /// Every tracked run, ordered by id.
    pub fn tracked(&self) -> Vec<ProgressSnapshot> {
        let mut runs: Vec<_> = self.lock().values().cloned().collect();
        runs.sort_by_key(|r| r.id);
        runs
    }
}
