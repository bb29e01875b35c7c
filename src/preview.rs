//! Preview a datamap applied to uploaded files without persisting anything.
//!
//! The response is the first N rows of the merged table, `{cols, rows, extra_rows}`, where
//! `extra_rows` tops the preview up to two rows so a caller can tell that more data exists even
//! when it asked for zero or one row. `extra_rows` is omitted when empty.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::config::Settings;
use crate::datamap::DataMap;
use crate::error::{IngestionError, IngestionResult, ValidationErrors};
use crate::ingestion::file::{FileIngestor, FilePlan};
use crate::merge::{MemorySource, MergeOptions, SeriesSource, TIME_COLUMN, merge};
use crate::storage::SensorStore;
use crate::types::{DataMapId, FileId, Sample, Value};

/// Rows shown when fewer were requested.
const MIN_VISIBLE_ROWS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapId {
    pub id: DataMapId,
}

/// A datamap given by id, by `{"id": ..}` or inline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MapRef {
    Id(DataMapId),
    IdObject(MapId),
    Inline(Json),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub file: FileId,
}

/// File bindings as `{"0": 12}` or `[{"name": "0", "file": 12}]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FileRefs {
    Map(BTreeMap<String, FileId>),
    List(Vec<FileEntry>),
}

impl FileRefs {
    pub fn pairs(&self) -> Vec<(String, FileId)> {
        match self {
            FileRefs::Map(map) => map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            FileRefs::List(list) => list.iter().map(|e| (e.name.clone(), e.file)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PreviewRequest {
    pub map: MapRef,
    #[serde(default)]
    pub rows: Option<usize>,
    pub files: FileRefs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub cols: Vec<String>,
    pub rows: Vec<Vec<Json>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_rows: Vec<Vec<Json>>,
}

/// The first `rows` data rows of `source`, plus the extra rows described in the module docs.
pub fn head(source: &dyn SeriesSource, rows: usize) -> IngestionResult<Preview> {
    let options = MergeOptions {
        include_header: false,
        ..MergeOptions::default()
    };
    let cols = std::iter::once(TIME_COLUMN.to_string())
        .chain(source.columns().into_iter().map(|c| c.name))
        .collect();

    let extra = MIN_VISIBLE_ROWS.saturating_sub(rows);
    let mut merged = merge(source, &options)?.map(|row| row.to_json());
    let shown: Vec<Vec<Json>> = merged.by_ref().take(rows).collect();
    let extra_rows = merged.take(extra).collect();

    Ok(Preview {
        cols,
        rows: shown,
        extra_rows,
    })
}

/// Preview `request` against uploads known to `store`.
pub fn preview(store: &dyn SensorStore, settings: &Settings, request: &PreviewRequest) -> IngestionResult<Preview> {
    let map = resolve_map(store, &request.map)?;

    let bound = request.files.pairs();

    let mut errors = ValidationErrors::new();
    let mut inputs = Vec::new();
    for (key, file_id) in bound.iter().cloned() {
        let plan = match FilePlan::from_datamap(&map, &key) {
            Ok(plan) => plan,
            Err(e) => {
                errors.extend(e);
                continue;
            }
        };
        match store.file(file_id)? {
            Some(upload) => inputs.push((key, upload.path, plan)),
            None => errors.add("files", format!("file '{key}': invalid file id {file_id}")),
        }
    }
    errors.into_result()?;

    let mut series: HashMap<String, BTreeMap<DateTime<Utc>, Value>> = HashMap::new();
    for (key, path, plan) in inputs {
        let ingestor = FileIngestor::open(&path, key, plan, settings.delimiter_sample_bytes)?;
        let names: Vec<String> = ingestor.columns().iter().map(|c| c.sensor.clone()).collect();
        for row in ingestor {
            let row = row?;
            let Some(Ok(time)) = row.time else {
                continue;
            };
            for (cell, name) in row.columns.iter().zip(&names) {
                if let Some(value) = cell.stored_value() {
                    series.entry(name.clone()).or_default().insert(time, value);
                }
            }
        }
    }

    let source = map
        .sensors
        .iter()
        .filter(|s| bound.iter().any(|(key, _)| *key == s.file))
        .fold(MemorySource::new(), |source, s| {
            let samples = series
                .remove(&s.name)
                .unwrap_or_default()
                .into_iter()
                .map(|(time, value)| Sample::new(time, value))
                .collect();
            source.with_series(s.name.clone(), s.data_type, samples)
        });

    head(&source, settings.head_rows(request.rows))
}

fn resolve_map(store: &dyn SensorStore, map: &MapRef) -> IngestionResult<DataMap> {
    let id = match map {
        MapRef::Inline(doc) => return Ok(DataMap::from_value(doc)?),
        MapRef::Id(id) | MapRef::IdObject(MapId { id }) => *id,
    };
    store
        .datamap(id)?
        .map(|record| record.map)
        .ok_or(IngestionError::NotFound { kind: "datamap", id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;
    use chrono::{TimeDelta, TimeZone};
    use serde_json::json;

    fn source(count: i64) -> MemorySource {
        let t0 = Utc.with_ymd_and_hms(2012, 2, 1, 0, 0, 0).unwrap();
        let samples = (0..count)
            .map(|i| Sample::new(t0 + TimeDelta::minutes(30 * i), Value::Integer(i)))
            .collect();
        MemorySource::new().with_series("s", DataType::Integer, samples)
    }

    #[test]
    fn map_references_accept_three_shapes() {
        let id: MapRef = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(id, MapRef::Id(7));
        let obj: MapRef = serde_json::from_value(json!({"id": 7})).unwrap();
        assert_eq!(obj, MapRef::IdObject(MapId { id: 7 }));
        let inline: MapRef = serde_json::from_value(json!({"extra": {"bad": "robot"}})).unwrap();
        assert!(matches!(inline, MapRef::Inline(_)));
    }

    #[test]
    fn file_references_accept_a_map_or_a_list() {
        let map: FileRefs = serde_json::from_value(json!({"0": 3, "1": 4})).unwrap();
        let list: FileRefs =
            serde_json::from_value(json!([{"name": "0", "file": 3}, {"name": "1", "file": 4}])).unwrap();
        assert_eq!(map.pairs(), list.pairs());
    }

    #[test]
    fn extra_rows_top_up_short_previews() {
        let src = source(10);

        let none = head(&src, 0).unwrap();
        assert!(none.rows.is_empty());
        assert_eq!(none.extra_rows.len(), 2);
        assert_eq!(none.extra_rows[0][1], json!(0));

        let one = head(&src, 1).unwrap();
        assert_eq!(one.rows.len(), 1);
        assert_eq!(one.extra_rows.len(), 1);
        assert_eq!(one.extra_rows[0][1], json!(1));

        let many = head(&src, 5).unwrap();
        assert_eq!(many.rows.len(), 5);
        let body = serde_json::to_value(&many).unwrap();
        assert!(body.get("extra_rows").is_none());
        assert_eq!(body["cols"], json!(["time", "s"]));
        assert_eq!(body["rows"][1], json!(["2012-02-01T00:30:00+00:00", 1]));
    }

    #[test]
    fn short_sources_yield_what_exists() {
        let preview = head(&source(1), 0).unwrap();
        assert_eq!(preview.extra_rows.len(), 1);
    }
}
