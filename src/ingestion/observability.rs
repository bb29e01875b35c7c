use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::IngestionError;
use crate::storage::{LogLevel, SensorIngestLog};
use crate::types::{DataMapId, IngestId};

/// How bad an ingest event is. Ordered, so a threshold can be compared with `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum IngestionSeverity {
    Info,
    Warning,
    /// A file was rejected or the run failed on its input.
    Error,
    /// The files or the store could not be used.
    Critical,
}

impl IngestionSeverity {
    pub fn log_level(self) -> LogLevel {
        match self {
            IngestionSeverity::Info => LogLevel::Info,
            IngestionSeverity::Warning => LogLevel::Warning,
            IngestionSeverity::Error => LogLevel::Error,
            IngestionSeverity::Critical => LogLevel::Critical,
        }
    }
}

/// Classify an error for observers.
///
/// Anything that means the backing files or store are unusable is critical; problems with the
/// uploaded content itself are errors.
pub fn severity_for_error(e: &IngestionError) -> IngestionSeverity {
    match e {
        IngestionError::Io(_) | IngestionError::Storage(_) => IngestionSeverity::Critical,
        IngestionError::Csv(err) if matches!(err.kind(), ::csv::ErrorKind::Io(_)) => IngestionSeverity::Critical,
        IngestionError::Json(err) if err.is_io() => IngestionSeverity::Critical,
        IngestionError::Csv(_)
        | IngestionError::Json(_)
        | IngestionError::SignatureMismatch { .. }
        | IngestionError::Validation(_)
        | IngestionError::NotFound { .. }
        | IngestionError::InvalidSetting { .. } => IngestionSeverity::Error,
    }
}

/// Identifies the ingest run an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionContext {
    pub ingest: IngestId,
    pub map_id: DataMapId,
}

/// Totals reported when a run completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestionStats {
    pub files: usize,
    pub files_rejected: usize,
    pub rows: u64,
    pub values: u64,
    pub errors: u64,
}

/// Observer interface for ingest runs.
///
/// All methods have empty defaults, so implementors only override what they record. Calls come
/// from the worker thread running the ingest.
pub trait IngestionObserver: Send + Sync {
    /// A file is about to be read.
    fn on_file_started(&self, _ctx: &IngestionContext, _file: &str, _size: u64) {}

    /// A recoverable cell or row problem was logged.
    fn on_row_error(&self, _ctx: &IngestionContext, _entry: &SensorIngestLog) {}

    /// A file was skipped because it could not be read as its signature.
    fn on_file_rejected(&self, _ctx: &IngestionContext, _file: &str, _error: &IngestionError) {}

    /// The run committed.
    fn on_complete(&self, _ctx: &IngestionContext, _stats: IngestionStats) {}

    /// The run failed and was rolled back.
    fn on_failure(&self, _ctx: &IngestionContext, _severity: IngestionSeverity, _error: &IngestionError) {}

    /// Called when a failure or rejection meets the alert threshold.
    ///
    /// Default behavior forwards to [`Self::on_failure`].
    fn on_alert(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &IngestionError) {
        self.on_failure(ctx, severity, error)
    }
}

/// Forwards every callback to each observer in turn.
#[derive(Default)]
pub struct CompositeObserver {
    members: Vec<Arc<dyn IngestionObserver>>,
}

impl CompositeObserver {
    pub fn new(members: Vec<Arc<dyn IngestionObserver>>) -> Self {
        Self { members }
    }

    pub fn push(&mut self, observer: Arc<dyn IngestionObserver>) {
        self.members.push(observer);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn each(&self, f: impl Fn(&dyn IngestionObserver)) {
        self.members.iter().for_each(|o| f(o.as_ref()));
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver").field("members", &self.members.len()).finish()
    }
}

impl IngestionObserver for CompositeObserver {
    fn on_file_started(&self, ctx: &IngestionContext, file: &str, size: u64) {
        self.each(|o| o.on_file_started(ctx, file, size));
    }

    fn on_row_error(&self, ctx: &IngestionContext, entry: &SensorIngestLog) {
        self.each(|o| o.on_row_error(ctx, entry));
    }

    fn on_file_rejected(&self, ctx: &IngestionContext, file: &str, error: &IngestionError) {
        self.each(|o| o.on_file_rejected(ctx, file, error));
    }

    fn on_complete(&self, ctx: &IngestionContext, stats: IngestionStats) {
        self.each(|o| o.on_complete(ctx, stats));
    }

    fn on_failure(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &IngestionError) {
        self.each(|o| o.on_failure(ctx, severity, error));
    }

    fn on_alert(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &IngestionError) {
        self.each(|o| o.on_alert(ctx, severity, error));
    }
}

/// Forwards ingestion events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl IngestionObserver for TracingObserver {
    fn on_file_started(&self, ctx: &IngestionContext, file: &str, size: u64) {
        tracing::debug!(ingest = ctx.ingest, file, size, "reading file");
    }

    fn on_row_error(&self, ctx: &IngestionContext, entry: &SensorIngestLog) {
        tracing::debug!(
            ingest = ctx.ingest,
            file = %entry.file,
            row = ?entry.row,
            column = ?entry.column,
            "{}",
            entry.message
        );
    }

    fn on_file_rejected(&self, ctx: &IngestionContext, file: &str, error: &IngestionError) {
        tracing::warn!(ingest = ctx.ingest, file, %error, "file rejected");
    }

    fn on_complete(&self, ctx: &IngestionContext, stats: IngestionStats) {
        tracing::info!(
            ingest = ctx.ingest,
            map = ctx.map_id,
            files = stats.files,
            rejected = stats.files_rejected,
            rows = stats.rows,
            values = stats.values,
            errors = stats.errors,
            "ingest complete"
        );
    }

    fn on_failure(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &IngestionError) {
        tracing::error!(ingest = ctx.ingest, map = ctx.map_id, ?severity, %error, "ingest failed");
    }

    fn on_alert(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &IngestionError) {
        tracing::error!(ingest = ctx.ingest, map = ctx.map_id, ?severity, %error, "ALERT");
    }
}

/// Appends one JSON object per event to a local file.
///
/// Every line carries `at` (RFC 3339, UTC), `event`, `ingest` and `map`, plus event-specific
/// fields. Writing is best-effort: an unwritable path never fails the run.
#[derive(Debug)]
pub struct FileObserver {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileObserver {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record(&self, ctx: &IngestionContext, event: &str, fields: serde_json::Value) {
        let mut line = json!({
            "at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "event": event,
            "ingest": ctx.ingest,
            "map": ctx.map_id,
        });
        if let (Some(obj), serde_json::Value::Object(extra)) = (line.as_object_mut(), fields) {
            obj.extend(extra);
        }

        let _guard = self.lock.lock().ok();
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(f, "{line}");
        }
    }
}

impl IngestionObserver for FileObserver {
    fn on_row_error(&self, ctx: &IngestionContext, entry: &SensorIngestLog) {
        self.record(
            ctx,
            "row_error",
            json!({
                "file": entry.file,
                "row": entry.row,
                "column": entry.column,
                "message": entry.message,
            }),
        );
    }

    fn on_file_rejected(&self, ctx: &IngestionContext, file: &str, error: &IngestionError) {
        self.record(ctx, "file_rejected", json!({"file": file, "error": error.to_string()}));
    }

    fn on_complete(&self, ctx: &IngestionContext, stats: IngestionStats) {
        self.record(ctx, "complete", json!({"stats": stats}));
    }

    fn on_failure(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &IngestionError) {
        self.record(ctx, "failure", json!({"severity": severity, "error": error.to_string()}));
    }

    fn on_alert(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &IngestionError) {
        self.record(ctx, "alert", json!({"severity": severity, "error": error.to_string()}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;

    #[test]
    fn infrastructure_errors_are_critical() {
        let io = IngestionError::Io(std::io::Error::other("gone"));
        assert_eq!(severity_for_error(&io), IngestionSeverity::Critical);
        let store = IngestionError::Storage(StoreError::Backend("down".into()));
        assert_eq!(severity_for_error(&store), IngestionSeverity::Critical);
        let mismatch = IngestionError::SignatureMismatch {
            file: "0".into(),
            message: "bad header".into(),
        };
        assert_eq!(severity_for_error(&mismatch), IngestionSeverity::Error);
    }

    #[test]
    fn severity_maps_to_log_level() {
        assert_eq!(IngestionSeverity::Warning.log_level(), LogLevel::Warning);
        assert!(IngestionSeverity::Critical > IngestionSeverity::Error);
    }

    #[test]
    fn file_observer_appends_one_json_object_per_event() {
        let path = std::env::temp_dir().join(format!(
            "openeis-ingest-events-{}.jsonl",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let obs = FileObserver::new(&path);
        let mut fanout = CompositeObserver::default();
        fanout.push(Arc::new(TracingObserver));
        fanout.push(Arc::new(FileObserver::new(&path)));
        assert_eq!(fanout.len(), 2);

        let ctx = IngestionContext { ingest: 3, map_id: 1 };
        let entry = SensorIngestLog {
            file: "0".into(),
            row: Some(12),
            column: Some(1),
            level: LogLevel::Error,
            message: "could not parse 'n/a' as float".into(),
        };
        obs.on_row_error(&ctx, &entry);
        fanout.on_complete(&ctx, IngestionStats { files: 1, rows: 11, values: 10, errors: 1, ..Default::default() });

        let text = std::fs::read_to_string(obs.path()).unwrap();
        std::fs::remove_file(&path).ok();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "row_error");
        assert_eq!(lines[0]["row"], 12);
        assert_eq!(lines[1]["event"], "complete");
        assert_eq!(lines[1]["stats"]["values"], 10);
        assert_eq!(lines[1]["ingest"], 3);
    }
}
