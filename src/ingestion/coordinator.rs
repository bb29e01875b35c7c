//! Ingest runs: validation, background execution, persistence and status.
//!
//! [`IngestionCoordinator::start_ingest`] validates the request synchronously (configuration
//! errors are returned to the caller), records the run, and hands it to the worker pool. The
//! run then streams every file through a [`FileIngestor`], writing values and log entries into
//! one store transaction that commits only if the whole run succeeds.
//!
//! Error handling inside a run:
//!
//! - malformed cells and unparseable timestamps are logged and skipped
//! - a file whose delimiter or header cannot be matched is logged at file level and skipped
//! - I/O and storage failures abort the run; its transaction is dropped, its end time stays
//!   unset and the failure is recorded on the ingest record
//!
//! Runs over the same datamap may overlap. Sensors are looked up or created inside each run's
//! transaction, so two runs that both find a sensor missing still end up sharing one record.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, mpsc};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::config::Settings;
use crate::datamap::DataMap;
use crate::error::{IngestionError, IngestionResult, ValidationErrors};
use crate::execution::{IngestMetrics, IngestMetricsSnapshot, IngestState, ProgressSnapshot, ProgressTable, WorkerPool};
use crate::storage::{LogLevel, Sensor, SensorIngestFile, SensorIngestLog, SensorStore, StoreTransaction};
use crate::types::{DataMapId, FileId, IngestId, TypedValue, Value};

use super::file::{FileIngestor, FilePlan};
use super::observability::{
    IngestionContext, IngestionObserver, IngestionSeverity, IngestionStats, severity_for_error,
};

/// Options for an [`IngestionCoordinator`].
#[derive(Clone)]
pub struct CoordinatorOptions {
    /// Worker threads; `None` uses the platform's available parallelism.
    pub workers: Option<usize>,
    /// Bytes read from the start of each file to detect its delimiter.
    pub delimiter_sample_bytes: usize,
    /// Optional observer for logging/alerts.
    pub observer: Option<Arc<dyn IngestionObserver>>,
    /// Severity threshold at which `on_alert` is invoked.
    pub alert_at_or_above: IngestionSeverity,
}

impl CoordinatorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            workers: Some(settings.ingest_workers),
            delimiter_sample_bytes: settings.delimiter_sample_bytes,
            ..Self::default()
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            workers: None,
            delimiter_sample_bytes: Settings::default().delimiter_sample_bytes,
            observer: None,
            alert_at_or_above: IngestionSeverity::Critical,
        }
    }
}

impl fmt::Debug for CoordinatorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorOptions")
            .field("workers", &self.workers)
            .field("delimiter_sample_bytes", &self.delimiter_sample_bytes)
            .field("observer_set", &self.observer.is_some())
            .field("alert_at_or_above", &self.alert_at_or_above)
            .finish()
    }
}

/// Result of a committed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub id: IngestId,
    pub end: DateTime<Utc>,
    pub stats: IngestionStats,
}

/// Handle to a started run.
///
/// Dropping the ticket does not affect the run.
#[derive(Debug)]
pub struct IngestTicket {
    id: IngestId,
    rx: mpsc::Receiver<IngestionResult<IngestSummary>>,
}

impl IngestTicket {
    pub fn id(&self) -> IngestId {
        self.id
    }

    /// Block until the run finishes.
    pub fn wait(self) -> IngestionResult<IngestSummary> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(IngestionError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("ingest {} stopped without reporting a result", self.id),
            )))
        })
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestStatus {
    /// Still tracked in-process.
    Running(ProgressSnapshot),
    /// Committed and no longer tracked.
    Complete,
    /// Rolled back.
    Failed { id: IngestId, error: String },
    /// Not tracked and never committed (the hosting process stopped mid-run).
    Interrupted,
}

#[derive(Serialize)]
struct FailedStatus<'a> {
    id: IngestId,
    status: IngestState,
    error: &'a str,
}

impl Serialize for IngestStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IngestStatus::Running(snap) => snap.serialize(serializer),
            IngestStatus::Failed { id, error } => FailedStatus {
                id: *id,
                status: IngestState::Failed,
                error,
            }
            .serialize(serializer),
            IngestStatus::Complete => serializer.serialize_str("Complete"),
            IngestStatus::Interrupted => serializer.serialize_str("Interrupted"),
        }
    }
}

/// Runs ingests in the background and answers status queries.
pub struct IngestionCoordinator {
    store: Arc<dyn SensorStore>,
    pool: WorkerPool,
    progress: Arc<ProgressTable>,
    metrics: Arc<IngestMetrics>,
    options: CoordinatorOptions,
}

impl fmt::Debug for IngestionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionCoordinator")
            .field("pool", &self.pool)
            .field("options", &self.options)
            .finish()
    }
}

impl IngestionCoordinator {
    pub fn new(store: Arc<dyn SensorStore>, options: CoordinatorOptions) -> IngestionResult<Self> {
        Ok(Self {
            store,
            pool: WorkerPool::new(options.workers)?,
            progress: Arc::new(ProgressTable::new()),
            metrics: Arc::new(IngestMetrics::new()),
            options,
        })
    }

    pub fn store(&self) -> &Arc<dyn SensorStore> {
        &self.store
    }

    pub fn metrics(&self) -> IngestMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Snapshots of every run still tracked in-process.
    pub fn tracked(&self) -> Vec<ProgressSnapshot> {
        self.progress.tracked()
    }

    /// Validate and launch an ingest of `files` (datamap file key, uploaded file id) under
    /// datamap `map_id`. Returns as soon as the run is queued.
    pub fn start_ingest(
        &self,
        map_id: DataMapId,
        files: &[(String, FileId)],
    ) -> IngestionResult<IngestTicket> {
        let record = self.store.datamap(map_id)?.ok_or(IngestionError::NotFound {
            kind: "datamap",
            id: map_id,
        })?;
        let map = record.map;

        let mut errors = ValidationErrors::new();
        if files.is_empty() {
            errors.add("files", "at least one file is required");
        }

        let mut job_files = Vec::with_capacity(files.len());
        for (key, file_id) in files {
            let plan = match FilePlan::from_datamap(&map, key) {
                Ok(plan) => plan,
                Err(e) => {
                    errors.extend(e);
                    continue;
                }
            };
            if plan.timestamp.is_none() {
                errors.add("files", format!("datamap file '{key}' declares no timestamp columns"));
                continue;
            }
            let Some(upload) = self.store.file(*file_id)? else {
                errors.add("files", format!("file {file_id} does not exist"));
                continue;
            };
            match std::fs::metadata(&upload.path) {
                Ok(meta) => job_files.push(JobFile {
                    key: key.clone(),
                    file_id: *file_id,
                    path: upload.path,
                    size: meta.len(),
                    plan,
                }),
                Err(e) => errors.add("files", format!("file {file_id} is not readable: {e}")),
            }
        }

        let existing = self.store.sensors(map_id)?;
        check_declared_sensors(&map, &existing, &mut errors);
        errors.into_result()?;

        let ingest = self.store.create_ingest(
            map_id,
            job_files
                .iter()
                .map(|f| SensorIngestFile {
                    name: f.key.clone(),
                    file_id: f.file_id,
                    size: f.size,
                })
                .collect(),
        )?;
        self.progress.register(ingest.id);
        tracing::info!(ingest = ingest.id, map = map_id, files = job_files.len(), "ingest queued");

        let job = IngestJob {
            ctx: IngestionContext {
                ingest: ingest.id,
                map_id,
            },
            store: Arc::clone(&self.store),
            progress: Arc::clone(&self.progress),
            metrics: Arc::clone(&self.metrics),
            observer: self.options.observer.clone(),
            alert_at_or_above: self.options.alert_at_or_above,
            sample_bytes: self.options.delimiter_sample_bytes,
            map,
            files: job_files,
        };
        let (tx, rx) = mpsc::channel();
        self.pool.spawn(move || {
            let _ = tx.send(job.execute());
        });

        Ok(IngestTicket { id: ingest.id, rx })
    }

    /// Status of run `id`.
    pub fn status(&self, id: IngestId) -> IngestionResult<IngestStatus> {
        if let Some(snap) = self.progress.get(id) {
            return Ok(match snap.status {
                IngestState::Failed => IngestStatus::Failed {
                    id,
                    error: snap.error.unwrap_or_default(),
                },
                _ => IngestStatus::Running(snap),
            });
        }
        match self.store.ingest(id)? {
            None => Err(IngestionError::NotFound { kind: "ingest", id }),
            Some(rec) if rec.is_complete() => Ok(IngestStatus::Complete),
            Some(rec) => Ok(match rec.error {
                Some(error) => IngestStatus::Failed { id, error },
                None => IngestStatus::Interrupted,
            }),
        }
    }

    /// Every recoverable problem logged by a committed run.
    pub fn errors(&self, id: IngestId) -> IngestionResult<Vec<SensorIngestLog>> {
        if self.store.ingest(id)?.is_none() {
            return Err(IngestionError::NotFound { kind: "ingest", id });
        }
        Ok(self.store.logs(id)?)
    }
}

/// Once a datamap has sensor records, every declared sensor must match one by name and type.
fn check_declared_sensors(map: &DataMap, existing: &[Sensor], errors: &mut ValidationErrors) {
    if existing.is_empty() {
        return;
    }
    for def in &map.sensors {
        match existing.iter().find(|s| s.name == def.name) {
            None => errors.add(
                "sensors",
                format!("column '{}' maps to unknown sensor '{}'", def.column_index, def.name),
            ),
            Some(s) if s.data_type != def.data_type => errors.add(
                "sensors",
                format!(
                    "sensor '{}' stores {} values, datamap declares {}",
                    def.name, s.data_type, def.data_type
                ),
            ),
            Some(_) => {}
        }
    }
}

struct JobFile {
    key: String,
    file_id: FileId,
    path: PathBuf,
    size: u64,
    plan: FilePlan,
}

struct IngestJob {
    ctx: IngestionContext,
    store: Arc<dyn SensorStore>,
    progress: Arc<ProgressTable>,
    metrics: Arc<IngestMetrics>,
    observer: Option<Arc<dyn IngestionObserver>>,
    alert_at_or_above: IngestionSeverity,
    sample_bytes: usize,
    map: DataMap,
    files: Vec<JobFile>,
}

impl IngestJob {
    fn execute(self) -> IngestionResult<IngestSummary> {
        let span = tracing::info_span!("ingest", id = self.ctx.ingest, map = self.ctx.map_id);
        let _enter = span.enter();

        self.metrics.on_run_started();
        self.progress.start(self.ctx.ingest);
        match self.run() {
            Ok(summary) => {
                self.progress.retire(self.ctx.ingest);
                self.metrics.on_run_completed();
                if let Some(obs) = &self.observer {
                    obs.on_complete(&self.ctx, summary.stats);
                }
                Ok(summary)
            }
            Err(e) => {
                self.record_failure(&e);
                self.metrics.on_run_failed();
                let severity = severity_for_error(&e);
                tracing::error!(error = %e, ?severity, "ingest rolled back");
                if let Some(obs) = &self.observer {
                    obs.on_failure(&self.ctx, severity, &e);
                    if severity >= self.alert_at_or_above {
                        obs.on_alert(&self.ctx, severity, &e);
                    }
                }
                Err(e)
            }
        }
    }

    fn run(&self) -> IngestionResult<IngestSummary> {
        let mut tx = self.store.begin(self.ctx.ingest)?;
        let sensors = self.resolve_sensors(tx.as_mut())?;

        let total: u64 = self.files.iter().map(|f| f.size).sum();
        let mut processed = 0u64;
        let mut stats = IngestionStats {
            files: self.files.len(),
            ..IngestionStats::default()
        };

        for file in &self.files {
            let span = tracing::info_span!("file", key = %file.key, size = file.size);
            let _enter = span.enter();
            if let Some(obs) = &self.observer {
                obs.on_file_started(&self.ctx, &file.key, file.size);
            }
            self.progress
                .update(self.ctx.ingest, &file.key, 0, file.size, processed, total);

            match FileIngestor::open(&file.path, &file.key, file.plan.clone(), self.sample_bytes) {
                Ok(ingestor) => {
                    self.ingest_file(ingestor, file, &sensors, tx.as_mut(), processed, total, &mut stats)?;
                }
                Err(e @ (IngestionError::SignatureMismatch { .. } | IngestionError::Validation(_))) => {
                    self.reject_file(file, &e, tx.as_mut(), &mut stats)?;
                }
                Err(e) => return Err(e),
            }

            processed += file.size;
            self.progress
                .update(self.ctx.ingest, &file.key, file.size, file.size, processed, total);
        }

        let end = Utc::now();
        tx.commit(end)?;
        Ok(IngestSummary {
            id: self.ctx.ingest,
            end,
            stats,
        })
    }

    /// Keep the failure on the ingest record and stop tracking the run. The progress table keeps
    /// it only when the store cannot take the failure either.
    fn record_failure(&self, error: &IngestionError) {
        let message = error.to_string();
        match self.store.fail_ingest(self.ctx.ingest, &message) {
            Ok(()) => {
                self.progress.retire(self.ctx.ingest);
            }
            Err(store_err) => {
                tracing::warn!(error = %store_err, "could not record the failure");
                self.progress.fail(self.ctx.ingest, message);
            }
        }
    }

    /// Sensor records by name, read or created inside the run's transaction.
    fn resolve_sensors(&self, tx: &mut dyn StoreTransaction) -> IngestionResult<HashMap<String, Sensor>> {
        let mut sensors = HashMap::with_capacity(self.map.sensors.len());
        for def in &self.map.sensors {
            let sensor = tx.ensure_sensor(self.ctx.map_id, &def.name, def.data_type, def.unit.as_deref())?;
            tracing::debug!(sensor = %sensor.name, id = sensor.id, "resolved sensor");
            sensors.insert(def.name.clone(), sensor);
        }
        Ok(sensors)
    }

    #[allow(clippy::too_many_arguments)]
    fn ingest_file(
        &self,
        ingestor: FileIngestor<std::io::BufReader<std::fs::File>>,
        file: &JobFile,
        sensors: &HashMap<String, Sensor>,
        tx: &mut dyn StoreTransaction,
        processed: u64,
        total: u64,
        stats: &mut IngestionStats,
    ) -> IngestionResult<()> {
        let mut targets = Vec::with_capacity(ingestor.columns().len());
        for column in ingestor.columns() {
            let sensor = sensors.get(&column.sensor).ok_or_else(|| {
                ValidationErrors::single("sensors", format!("unknown sensor '{}'", column.sensor))
            })?;
            targets.push(sensor.clone());
        }

        for row in ingestor {
            let row = row?;
            stats.rows += 1;
            self.metrics.on_row_processed();

            match row.time {
                Some(Ok(time)) => {
                    for (cell, sensor) in row.columns.into_iter().zip(&targets) {
                        let value = match cell {
                            TypedValue::Bool(v) => Value::Bool(v),
                            TypedValue::Integer(v) => Value::Integer(v),
                            TypedValue::Float(v) => Value::Float(v),
                            TypedValue::String(v) => Value::String(v),
                            TypedValue::DateTime(v) => Value::DateTime(v),
                            TypedValue::NoValue => continue,
                            TypedValue::ParseError(err) => {
                                let entry = SensorIngestLog {
                                    file: file.key.clone(),
                                    row: Some(err.row),
                                    column: Some(err.column),
                                    level: LogLevel::Error,
                                    message: format!("{}: {} (raw='{}')", sensor.name, err.reason, err.raw),
                                };
                                self.log(tx, entry, stats)?;
                                continue;
                            }
                        };
                        tx.insert_datum(sensor, time, value)?;
                        stats.values += 1;
                        self.metrics.on_value_stored();
                    }
                }
                Some(Err(err)) => {
                    let entry = SensorIngestLog {
                        file: file.key.clone(),
                        row: Some(row.line),
                        column: None,
                        level: LogLevel::Error,
                        message: err.to_string(),
                    };
                    self.log(tx, entry, stats)?;
                }
                None => {}
            }

            self.progress.update(
                self.ctx.ingest,
                &file.key,
                row.position,
                file.size,
                processed + row.position.min(file.size),
                total,
            );
        }
        Ok(())
    }

    fn reject_file(
        &self,
        file: &JobFile,
        error: &IngestionError,
        tx: &mut dyn StoreTransaction,
        stats: &mut IngestionStats,
    ) -> IngestionResult<()> {
        let severity = severity_for_error(error);
        tracing::warn!(%error, "skipping file");
        stats.files_rejected += 1;
        self.metrics.on_file_rejected();

        let message = match error {
            IngestionError::Validation(errors) => errors.to_string(),
            other => other.to_string(),
        };
        tx.insert_log(SensorIngestLog {
            file: file.key.clone(),
            row: None,
            column: None,
            level: severity.log_level(),
            message,
        })?;
        stats.errors += 1;
        self.metrics.on_error_logged();

        if let Some(obs) = &self.observer {
            obs.on_file_rejected(&self.ctx, &file.key, error);
            if severity >= self.alert_at_or_above {
                obs.on_alert(&self.ctx, severity, error);
            }
        }
        Ok(())
    }

    fn log(
        &self,
        tx: &mut dyn StoreTransaction,
        entry: SensorIngestLog,
        stats: &mut IngestionStats,
    ) -> IngestionResult<()> {
        if let Some(obs) = &self.observer {
            obs.on_row_error(&self.ctx, &entry);
        }
        tx.insert_log(entry)?;
        stats.errors += 1;
        self.metrics.on_error_logged();
        Ok(())
    }
}
