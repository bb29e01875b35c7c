//! Storage collaborator: the records the ingestion pipeline reads and writes.
//!
//! The pipeline only talks to [`SensorStore`]. [`MemoryStore`] is the in-process implementation
//! used by the CLI and the tests.

mod memory;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::datamap::DataMap;
use crate::types::{DataMapId, DataType, FileId, IngestId, Sample, SensorId, Value};

pub use memory::MemoryStore;

/// Errors raised by a [`SensorStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} does not exist")]
    Missing { kind: &'static str, id: u64 },

    #[error("sensor '{name}' already exists in datamap {map_id}")]
    DuplicateSensor { map_id: DataMapId, name: String },

    #[error("sensor '{name}' in datamap {map_id} stores {stored} values, not {requested}")]
    SensorTypeConflict {
        map_id: DataMapId,
        name: String,
        stored: DataType,
        requested: DataType,
    },

    #[error("sensor {sensor} stores {expected} values, got {found}")]
    TypeMismatch {
        sensor: SensorId,
        expected: DataType,
        found: &'static str,
    },

    #[error("ingest {0} has already completed")]
    AlreadyComplete(IngestId),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// A stored datamap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataMapRecord {
    pub id: DataMapId,
    pub name: String,
    pub map: DataMap,
}

/// An uploaded file available for ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub id: FileId,
    pub name: String,
    pub path: PathBuf,
}

/// A named, typed sensor owned by one datamap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sensor {
    pub id: SensorId,
    pub map_id: DataMapId,
    pub name: String,
    pub data_type: DataType,
    pub unit: Option<String>,
}

/// One input file of an ingest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorIngestFile {
    /// Datamap file key the upload is read as.
    pub name: String,
    pub file_id: FileId,
    pub size: u64,
}

/// An ingest run. `end` stays `None` until the run commits; `error` is set when it was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorIngest {
    pub id: IngestId,
    pub map_id: DataMapId,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub files: Vec<SensorIngestFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SensorIngest {
    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Severity of an ingest log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// A recoverable problem recorded during an ingest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorIngestLog {
    /// Datamap file key.
    pub file: String,
    /// 1-based line number; `None` for file-level entries.
    pub row: Option<u64>,
    /// 0-based column index; `None` for row- and file-level entries.
    pub column: Option<usize>,
    pub level: LogLevel,
    pub message: String,
}

/// One stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedSensorDatum {
    pub sensor: SensorId,
    pub ingest: IngestId,
    pub time: DateTime<Utc>,
    pub value: Value,
}

/// Where a paged series read resumes: just after this (time, ingest) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeriesPosition {
    pub time: DateTime<Utc>,
    pub ingest: IngestId,
}

/// One page of a series read. `next` is `None` once the series is exhausted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeriesPage {
    pub samples: Vec<Sample>,
    pub next: Option<SeriesPosition>,
}

/// Read and write access to persisted sensor data.
///
/// Writes of an ingest run go through a [`StoreTransaction`] so the run is all-or-nothing.
pub trait SensorStore: Send + Sync {
    fn datamap(&self, id: DataMapId) -> Result<Option<DataMapRecord>, StoreError>;

    fn file(&self, id: FileId) -> Result<Option<UploadedFile>, StoreError>;

    /// Committed sensors of a datamap, in creation order.
    fn sensors(&self, map_id: DataMapId) -> Result<Vec<Sensor>, StoreError>;

    /// Create a new ingest run record with its start time set to now.
    fn create_ingest(
        &self,
        map_id: DataMapId,
        files: Vec<SensorIngestFile>,
    ) -> Result<SensorIngest, StoreError>;

    fn ingest(&self, id: IngestId) -> Result<Option<SensorIngest>, StoreError>;

    /// All ingest runs of a datamap, oldest first.
    fn ingests(&self, map_id: DataMapId) -> Result<Vec<SensorIngest>, StoreError>;

    /// Mark a run that was rolled back, keeping `message` on its record.
    fn fail_ingest(&self, id: IngestId, message: &str) -> Result<(), StoreError>;

    /// Start the write transaction of an ingest run.
    fn begin(&self, ingest: IngestId) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;

    /// Values of `sensor` recorded by any of `ingests`, ordered by time.
    ///
    /// Values sharing a timestamp are ordered by ingest id, oldest first.
    fn series(&self, sensor: SensorId, ingests: &[IngestId]) -> Result<Vec<Sample>, StoreError>;

    /// At most `limit` values of [`SensorStore::series`], starting after `after`.
    fn series_page(
        &self,
        sensor: SensorId,
        ingests: &[IngestId],
        after: Option<SeriesPosition>,
        limit: usize,
    ) -> Result<SeriesPage, StoreError>;

    /// Log entries of a committed ingest run, in insertion order.
    fn logs(&self, ingest: IngestId) -> Result<Vec<SensorIngestLog>, StoreError>;
}

/// Staged writes of one ingest run. Dropping without [`StoreTransaction::commit`] discards them.
pub trait StoreTransaction {
    /// The sensor named `name` in `map_id`, staging a new one when no run has created it yet.
    ///
    /// A same-named sensor staged by a concurrent run that commits first is adopted at commit.
    /// An existing sensor of another type is a [`StoreError::SensorTypeConflict`].
    fn ensure_sensor(
        &mut self,
        map_id: DataMapId,
        name: &str,
        data_type: DataType,
        unit: Option<&str>,
    ) -> Result<Sensor, StoreError>;

    fn insert_datum(
        &mut self,
        sensor: &Sensor,
        time: DateTime<Utc>,
        value: Value,
    ) -> Result<(), StoreError>;

    fn insert_log(&mut self, log: SensorIngestLog) -> Result<(), StoreError>;

    /// Make every staged write visible and set the run's end time.
    fn commit(self: Box<Self>, end: DateTime<Utc>) -> Result<(), StoreError>;
}
