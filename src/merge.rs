//! Reconstruct a time-aligned table from independently stored per-sensor series.
//!
//! [`merge`] performs an N-way merge keyed by timestamp over the series of a [`SeriesSource`]:
//! one row per distinct timestamp, one column per series, [`Value::Null`] where a series has no
//! value at that time. Each call re-opens the source, so the result is restartable per call and
//! repeated merges over unchanged data produce identical rows.
//!
//! Windowing (`start`/`end`) accepts a timestamp or a row offset:
//!
//! - `start = Time(t)` keeps rows with `time >= t`; `end = Time(t)` keeps rows with `time < t`
//! - `start = Offset(n)` skips the first `n` rows of the full merge; `end = Offset(n)` drops the
//!   last `n` rows of the full merge
//! - negative offsets produce no data rows
//!
//! The header row, when included, is emitted even when the window is empty.

use std::collections::HashMap;
use std::io::Write;
use std::iter::Peekable;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as Json;

use crate::error::{IngestionError, IngestionResult};
use crate::ingestion::timestamp::parse_datetime;
use crate::processing::{FilterConfig, SampleStream, Topic, apply_filters};
use crate::storage::{Sensor, SensorStore, SeriesPosition, StoreError};
use crate::types::{DataMapId, DataType, IngestId, Sample, SensorId, Value};

/// Label of the leading header column.
pub const TIME_COLUMN: &str = "time";

/// Samples fetched per store read when streaming a stored series.
pub const SERIES_PAGE_SIZE: usize = 4096;

/// A window bound: a timestamp or a row offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowBound {
    Time(DateTime<Utc>),
    Offset(i64),
}

impl WindowBound {
    /// Parse a query parameter: integers are offsets, anything else must be a timestamp.
    /// Unparseable input gives `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(n) = text.parse::<i64>() {
            return Some(WindowBound::Offset(n));
        }
        parse_datetime(text, None).ok().map(WindowBound::Time)
    }
}

impl From<DateTime<Utc>> for WindowBound {
    fn from(t: DateTime<Utc>) -> Self {
        WindowBound::Time(t)
    }
}

impl From<i64> for WindowBound {
    fn from(n: i64) -> Self {
        WindowBound::Offset(n)
    }
}

/// Merge parameters. The default is the whole dataset with a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub start: Option<WindowBound>,
    pub end: Option<WindowBound>,
    pub include_header: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            include_header: true,
        }
    }
}

impl MergeOptions {
    /// Options from download query parameters; values that do not parse are ignored.
    pub fn from_query(start: Option<&str>, end: Option<&str>) -> Self {
        Self {
            start: start.and_then(WindowBound::parse),
            end: end.and_then(WindowBound::parse),
            include_header: true,
        }
    }
}

/// One merged column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesColumn {
    pub name: String,
    pub data_type: DataType,
}

/// Restartable provider of time-ordered series.
pub trait SeriesSource {
    /// Columns in merge order.
    fn columns(&self) -> Vec<SeriesColumn>;

    /// Fresh streams, one per column, in [`SeriesSource::columns`] order.
    fn open(&self) -> IngestionResult<Vec<SampleStream>>;

    /// Report a read failure that cut a stream short after [`SeriesSource::open`] returned.
    fn check(&self) -> IngestionResult<()> {
        Ok(())
    }
}

/// A merge output row.
#[derive(Debug, Clone, PartialEq)]
pub enum MergedRow {
    Header(Vec<String>),
    Data { time: DateTime<Utc>, values: Vec<Value> },
}

impl MergedRow {
    /// CSV fields of the row; missing values are empty fields.
    pub fn to_record(&self) -> Vec<String> {
        match self {
            MergedRow::Header(names) => names.clone(),
            MergedRow::Data { time, values } => std::iter::once(format_time(time))
                .chain(values.iter().map(Value::to_csv_field))
                .collect(),
        }
    }

    /// JSON cells of the row; missing values are `null`.
    pub fn to_json(&self) -> Vec<Json> {
        match self {
            MergedRow::Header(names) => names.iter().map(|n| Json::String(n.clone())).collect(),
            MergedRow::Data { time, values } => std::iter::once(Json::String(format_time(time)))
                .chain(values.iter().map(value_to_json))
                .collect(),
        }
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(v) => Json::Bool(*v),
        Value::Integer(v) => Json::from(*v),
        Value::Float(v) => serde_json::Number::from_f64(*v).map_or(Json::Null, Json::Number),
        Value::String(v) => Json::String(v.clone()),
        Value::DateTime(v) => Json::String(format_time(v)),
    }
}

/// N-way merge of time-ordered streams. Equal timestamps within one stream collapse to the
/// last value seen.
struct MergeCursor {
    streams: Vec<Peekable<SampleStream>>,
}

impl MergeCursor {
    fn new(streams: Vec<SampleStream>) -> Self {
        Self {
            streams: streams.into_iter().map(Iterator::peekable).collect(),
        }
    }
}

impl Iterator for MergeCursor {
    type Item = (DateTime<Utc>, Vec<Value>);

    fn next(&mut self) -> Option<Self::Item> {
        let time = self
            .streams
            .iter_mut()
            .filter_map(|s| s.peek().map(|sample| sample.time))
            .min()?;
        let values = self
            .streams
            .iter_mut()
            .map(|s| {
                let mut value = Value::Null;
                while let Some(sample) = s.next_if(|sample| sample.time == time) {
                    value = sample.value;
                }
                value
            })
            .collect();
        Some((time, values))
    }
}

/// Lazy merged rows, returned by [`merge`].
pub struct Merge {
    header: Option<Vec<String>>,
    cursor: MergeCursor,
    index: u64,
    skip: u64,
    limit: Option<u64>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    done: bool,
}

impl Iterator for Merge {
    type Item = MergedRow;

    fn next(&mut self) -> Option<MergedRow> {
        if let Some(header) = self.header.take() {
            return Some(MergedRow::Header(header));
        }
        while !self.done {
            let Some((time, values)) = self.cursor.next() else {
                self.done = true;
                break;
            };
            let index = self.index;
            self.index += 1;

            let past_limit = self.limit.is_some_and(|limit| index >= limit);
            let past_end = self.end_time.is_some_and(|end| time >= end);
            if past_limit || past_end {
                self.done = true;
                break;
            }
            if index < self.skip || self.start_time.is_some_and(|start| time < start) {
                continue;
            }
            return Some(MergedRow::Data { time, values });
        }
        None
    }
}

/// Merge every series of `source` into rows, windowed by `options`.
pub fn merge(source: &dyn SeriesSource, options: &MergeOptions) -> IngestionResult<Merge> {
    let header = options.include_header.then(|| {
        std::iter::once(TIME_COLUMN.to_string())
            .chain(source.columns().into_iter().map(|c| c.name))
            .collect()
    });

    let mut merged = Merge {
        header,
        cursor: MergeCursor::new(Vec::new()),
        index: 0,
        skip: 0,
        limit: None,
        start_time: None,
        end_time: None,
        done: false,
    };

    match options.start {
        Some(WindowBound::Offset(n)) if n < 0 => merged.done = true,
        Some(WindowBound::Offset(n)) => merged.skip = n as u64,
        Some(WindowBound::Time(t)) => merged.start_time = Some(t),
        None => {}
    }
    match options.end {
        Some(WindowBound::Offset(n)) if n < 0 => merged.done = true,
        Some(WindowBound::Offset(0)) | None => {}
        Some(WindowBound::Offset(n)) if !merged.done => {
            let total = MergeCursor::new(source.open()?).count() as u64;
            merged.limit = Some(total.saturating_sub(n as u64));
        }
        Some(WindowBound::Offset(_)) => {}
        Some(WindowBound::Time(t)) => merged.end_time = Some(t),
    }

    if !merged.done {
        merged.cursor = MergeCursor::new(source.open()?);
    }
    Ok(merged)
}

/// Write rows as CSV and return the number of data rows written.
pub fn write_csv<W: Write>(rows: impl IntoIterator<Item = MergedRow>, writer: W) -> IngestionResult<u64> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut written = 0;
    for row in rows {
        if matches!(row, MergedRow::Data { .. }) {
            written += 1;
        }
        wtr.write_record(row.to_record())?;
    }
    wtr.flush()?;
    Ok(written)
}

/// Series held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    columns: Vec<SeriesColumn>,
    series: Vec<Vec<Sample>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column. `samples` must be ordered by time.
    pub fn with_series(mut self, name: impl Into<String>, data_type: DataType, samples: Vec<Sample>) -> Self {
        self.columns.push(SeriesColumn {
            name: name.into(),
            data_type,
        });
        self.series.push(samples);
        self
    }
}

impl SeriesSource for MemorySource {
    fn columns(&self) -> Vec<SeriesColumn> {
        self.columns.clone()
    }

    fn open(&self) -> IngestionResult<Vec<SampleStream>> {
        Ok(self
            .series
            .iter()
            .map(|s| Box::new(s.clone().into_iter()) as SampleStream)
            .collect())
    }
}

/// The stored series of a datamap's sensors across one or more ingest runs.
///
/// Columns are the sensors in creation order. When several runs recorded a value for the same
/// sensor and time, the latest run wins. Streams read the store a page at a time; a page read
/// that fails ends its stream and is reported by [`SeriesSource::check`].
pub struct DatasetSource {
    store: Arc<dyn SensorStore>,
    sensors: Vec<Sensor>,
    ingests: Arc<[IngestId]>,
    page_size: usize,
    failure: Arc<Mutex<Option<StoreError>>>,
}

impl DatasetSource {
    /// The dataset produced by one ingest run.
    pub fn for_ingest(store: Arc<dyn SensorStore>, ingest: IngestId) -> IngestionResult<Self> {
        let record = store.ingest(ingest)?.ok_or(IngestionError::NotFound {
            kind: "ingest",
            id: ingest,
        })?;
        let sensors = store.sensors(record.map_id)?;
        Ok(Self::new(store, sensors, vec![ingest]))
    }

    /// Every committed run of a datamap.
    pub fn for_datamap(store: Arc<dyn SensorStore>, map_id: DataMapId) -> IngestionResult<Self> {
        if store.datamap(map_id)?.is_none() {
            return Err(IngestionError::NotFound {
                kind: "datamap",
                id: map_id,
            });
        }
        let ingests = store
            .ingests(map_id)?
            .into_iter()
            .filter(|i| i.is_complete())
            .map(|i| i.id)
            .collect();
        let sensors = store.sensors(map_id)?;
        Ok(Self::new(store, sensors, ingests))
    }

    fn new(store: Arc<dyn SensorStore>, sensors: Vec<Sensor>, ingests: Vec<IngestId>) -> Self {
        Self {
            store,
            sensors,
            ingests: ingests.into(),
            page_size: SERIES_PAGE_SIZE,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Read `n` samples per store call instead of [`SERIES_PAGE_SIZE`].
    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n.max(1);
        self
    }

    pub fn ingests(&self) -> &[IngestId] {
        &self.ingests
    }
}

impl SeriesSource for DatasetSource {
    fn columns(&self) -> Vec<SeriesColumn> {
        self.sensors
            .iter()
            .map(|s| SeriesColumn {
                name: s.name.clone(),
                data_type: s.data_type,
            })
            .collect()
    }

    fn open(&self) -> IngestionResult<Vec<SampleStream>> {
        self.sensors
            .iter()
            .map(|s| {
                let first = self.store.series_page(s.id, &self.ingests, None, self.page_size)?;
                Ok(Box::new(PagedSeries {
                    store: Arc::clone(&self.store),
                    sensor: s.id,
                    ingests: Arc::clone(&self.ingests),
                    page_size: self.page_size,
                    buffer: first.samples.into_iter(),
                    next: first.next,
                    failure: Arc::clone(&self.failure),
                }) as SampleStream)
            })
            .collect()
    }

    fn check(&self) -> IngestionResult<()> {
        match self.failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// One sensor's stored series, read page by page.
struct PagedSeries {
    store: Arc<dyn SensorStore>,
    sensor: SensorId,
    ingests: Arc<[IngestId]>,
    page_size: usize,
    buffer: std::vec::IntoIter<Sample>,
    next: Option<SeriesPosition>,
    failure: Arc<Mutex<Option<StoreError>>>,
}

impl Iterator for PagedSeries {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        loop {
            if let Some(sample) = self.buffer.next() {
                return Some(sample);
            }
            let after = self.next.take()?;
            match self.store.series_page(self.sensor, &self.ingests, Some(after), self.page_size) {
                Ok(page) => {
                    self.buffer = page.samples.into_iter();
                    self.next = page.next;
                }
                Err(err) => {
                    tracing::error!(sensor = self.sensor, error = %err, "series read failed");
                    let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    return None;
                }
            }
        }
    }
}

/// A source whose series pass through a filter chain.
pub struct FilteredSource<S> {
    inner: S,
    configs: Vec<FilterConfig>,
}

impl<S: SeriesSource> FilteredSource<S> {
    /// Wrap `inner`, returning the configuration errors of `configs` alongside.
    pub fn new(inner: S, configs: Vec<FilterConfig>) -> (Self, Vec<String>) {
        let probe: HashMap<String, Topic> = inner
            .columns()
            .into_iter()
            .map(|c| (c.name, Topic::new(c.data_type, Vec::new())))
            .collect();
        let (_, errors) = apply_filters(probe, &configs);
        (Self { inner, configs }, errors)
    }
}

impl<S: SeriesSource> SeriesSource for FilteredSource<S> {
    fn columns(&self) -> Vec<SeriesColumn> {
        self.inner.columns()
    }

    fn open(&self) -> IngestionResult<Vec<SampleStream>> {
        let columns = self.inner.columns();
        let topics: HashMap<String, Topic> = columns
            .iter()
            .zip(self.inner.open()?)
            .map(|(c, stream)| {
                (
                    c.name.clone(),
                    Topic {
                        data_type: c.data_type,
                        stream,
                    },
                )
            })
            .collect();
        let (mut topics, _) = apply_filters(topics, &self.configs);
        Ok(columns
            .iter()
            .map(|c| match topics.remove(&c.name) {
                Some(topic) => topic.stream,
                None => Box::new(std::iter::empty()) as SampleStream,
            })
            .collect())
    }

    fn check(&self) -> IngestionResult<()> {
        self.inner.check()
    }
}
