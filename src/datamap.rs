//! Datamap documents: the declarative mapping from uploaded file columns to typed sensors.
//!
//! A datamap is persisted as JSON:
//!
//! ```json
//! {
//!   "version": 1,
//!   "sensors": {
//!     "Test/WholeBuildingPower": {"type": "float", "column": "Main Meter [kW]", "file": "0", "unit": "kilowatt"}
//!   },
//!   "files": {
//!     "0": {
//!       "signature": {"headers": ["Date", "Main Meter [kW]"]},
//!       "timestamp": {"columns": [0]}
//!     }
//!   }
//! }
//! ```
//!
//! [`DataMap::from_value`] validates the document and resolves every column reference to a
//! 0-based index, so the ingestion code never sees an unresolvable column. Validation errors
//! are reported under the `map` field, using the wording of a JSON-schema validator for
//! missing properties (`'version' is a required property`).
//!
//! Sensor and file order is the document order.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as Json, json};

use crate::error::ValidationErrors;
use crate::types::DataType;

/// The only datamap document version understood by this crate.
pub const DATAMAP_VERSION: u64 = 1;

const FIELD: &str = "map";

/// Reference to a file column, either by 0-based index or by header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

impl ColumnRef {
    fn from_json(value: &Json) -> Option<Self> {
        match value {
            Json::Number(n) => n.as_u64().map(|i| ColumnRef::Index(i as usize)),
            Json::String(s) => Some(ColumnRef::Name(s.clone())),
            _ => None,
        }
    }

    fn to_json(&self) -> Json {
        match self {
            ColumnRef::Index(i) => json!(i),
            ColumnRef::Name(s) => json!(s),
        }
    }

    /// Resolve against a header list.
    pub fn resolve(&self, headers: &[String]) -> Option<usize> {
        match self {
            ColumnRef::Index(i) if *i < headers.len() => Some(*i),
            ColumnRef::Index(_) => None,
            ColumnRef::Name(name) => headers.iter().position(|h| h == name),
        }
    }
}

/// How the header row of an uploaded file must relate to the declared headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSignature {
    /// File key within the datamap (e.g. `"0"`).
    pub id: String,
    pub headers: Vec<String>,
    /// Strict signatures require the exact header list. Loose signatures compare
    /// case-insensitively and allow extra trailing columns.
    pub strict: bool,
    pub timestamp: Option<TimestampSpec>,
}

impl FileSignature {
    /// Compare an actual header row with the declared one.
    pub fn check_headers(&self, actual: &[String]) -> Result<(), String> {
        if self.strict && actual.len() != self.headers.len() {
            return Err(format!(
                "expected {} columns, found {}",
                self.headers.len(),
                actual.len()
            ));
        }
        if actual.len() < self.headers.len() {
            return Err(format!(
                "expected at least {} columns, found {}",
                self.headers.len(),
                actual.len()
            ));
        }
        for (i, (expected, found)) in self.headers.iter().zip(actual).enumerate() {
            let same = if self.strict {
                expected.trim() == found.trim()
            } else {
                expected.trim().eq_ignore_ascii_case(found.trim())
            };
            if !same {
                return Err(format!(
                    "column {i}: expected header '{expected}', found '{found}'"
                ));
            }
        }
        Ok(())
    }
}

/// Which columns make up a row's timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampSpec {
    pub columns: Vec<ColumnRef>,
    /// Resolved 0-based indices, in listed order.
    pub indices: Vec<usize>,
    /// Explicit strftime format; heuristic parsing when absent.
    pub format: Option<String>,
}

/// One declared sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDefinition {
    pub name: String,
    pub data_type: DataType,
    pub column: ColumnRef,
    /// Resolved 0-based column index in the source file.
    pub column_index: usize,
    /// Key of the source file.
    pub file: String,
    pub unit: Option<String>,
}

/// A validated datamap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMap {
    pub version: u64,
    pub sensors: Vec<SensorDefinition>,
    pub files: Vec<FileSignature>,
}

impl DataMap {
    /// Parse and validate a JSON string.
    pub fn from_json_str(input: &str) -> Result<Self, ValidationErrors> {
        let value: Json = serde_json::from_str(input)
            .map_err(|e| ValidationErrors::single(FIELD, format!("invalid JSON: {e}")))?;
        Self::from_value(&value)
    }

    /// Validate a JSON document.
    pub fn from_value(doc: &Json) -> Result<Self, ValidationErrors> {
        let Some(root) = doc.as_object() else {
            return Err(ValidationErrors::single(FIELD, "datamap must be an object"));
        };
        for required in ["version", "files", "sensors"] {
            if !root.contains_key(required) {
                return Err(ValidationErrors::single(
                    FIELD,
                    format!("'{required}' is a required property"),
                ));
            }
        }

        let mut errors = ValidationErrors::new();

        let version = match root.get("version").and_then(Json::as_u64) {
            Some(v) if v == DATAMAP_VERSION => v,
            Some(v) => {
                errors.add(FIELD, format!("version: unsupported datamap version {v}"));
                v
            }
            None => {
                errors.add(FIELD, "version: must be a non-negative integer");
                0
            }
        };

        let files = match root.get("files").and_then(Json::as_object) {
            Some(files) => parse_files(files, &mut errors),
            None => {
                errors.add(FIELD, "files: must be an object");
                Vec::new()
            }
        };

        let sensors = match root.get("sensors").and_then(Json::as_object) {
            Some(sensors) => parse_sensors(sensors, &files, &mut errors),
            None => {
                errors.add(FIELD, "sensors: must be an object");
                Vec::new()
            }
        };

        errors.into_result()?;
        Ok(Self {
            version,
            sensors,
            files,
        })
    }

    /// Serialize back to the document form.
    pub fn to_value(&self) -> Json {
        let mut sensors = Map::new();
        for s in &self.sensors {
            let mut def = Map::new();
            def.insert("type".into(), json!(s.data_type.as_str()));
            def.insert("column".into(), s.column.to_json());
            def.insert("file".into(), json!(s.file));
            if let Some(unit) = &s.unit {
                def.insert("unit".into(), json!(unit));
            }
            sensors.insert(s.name.clone(), Json::Object(def));
        }

        let mut files = Map::new();
        for f in &self.files {
            let mut def = Map::new();
            def.insert(
                "signature".into(),
                json!({"headers": f.headers, "strict": f.strict}),
            );
            if let Some(ts) = &f.timestamp {
                let mut spec = Map::new();
                spec.insert(
                    "columns".into(),
                    Json::Array(ts.columns.iter().map(ColumnRef::to_json).collect()),
                );
                if let Some(fmt) = &ts.format {
                    spec.insert("format".into(), json!(fmt));
                }
                def.insert("timestamp".into(), Json::Object(spec));
            }
            files.insert(f.id.clone(), Json::Object(def));
        }

        json!({"version": self.version, "sensors": sensors, "files": files})
    }

    pub fn file(&self, id: &str) -> Option<&FileSignature> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn sensor(&self, name: &str) -> Option<&SensorDefinition> {
        self.sensors.iter().find(|s| s.name == name)
    }

    /// Sensors sourced from file `id`, in document order.
    pub fn sensors_for_file<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a SensorDefinition> {
        self.sensors.iter().filter(move |s| s.file == id)
    }
}

impl Serialize for DataMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Json::deserialize(deserializer)?;
        DataMap::from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn parse_files(files: &Map<String, Json>, errors: &mut ValidationErrors) -> Vec<FileSignature> {
    let mut out = Vec::with_capacity(files.len());
    for (id, def) in files {
        let path = format!("files.{id}");
        let Some(def) = def.as_object() else {
            errors.add(FIELD, format!("{path}: must be an object"));
            continue;
        };

        let Some(signature) = def.get("signature").and_then(Json::as_object) else {
            errors.add(FIELD, format!("{path}: 'signature' is a required property"));
            continue;
        };
        let Some(raw_headers) = signature.get("headers").and_then(Json::as_array) else {
            errors.add(FIELD, format!("{path}.signature: 'headers' is a required property"));
            continue;
        };
        let mut headers = Vec::with_capacity(raw_headers.len());
        for (i, h) in raw_headers.iter().enumerate() {
            match h {
                Json::String(s) => headers.push(s.clone()),
                Json::Null => headers.push(String::new()),
                _ => errors.add(FIELD, format!("{path}.signature.headers[{i}]: must be a string")),
            }
        }
        let strict = match signature.get("strict") {
            None => true,
            Some(Json::Bool(b)) => *b,
            Some(_) => {
                errors.add(FIELD, format!("{path}.signature.strict: must be a boolean"));
                true
            }
        };

        let timestamp = match def.get("timestamp") {
            None | Some(Json::Null) => None,
            Some(spec) => parse_timestamp_spec(&path, spec, &headers, errors),
        };

        out.push(FileSignature {
            id: id.clone(),
            headers,
            strict,
            timestamp,
        });
    }
    out
}

fn parse_timestamp_spec(
    path: &str,
    spec: &Json,
    headers: &[String],
    errors: &mut ValidationErrors,
) -> Option<TimestampSpec> {
    let Some(spec) = spec.as_object() else {
        errors.add(FIELD, format!("{path}.timestamp: must be an object"));
        return None;
    };
    let Some(raw_columns) = spec.get("columns").and_then(Json::as_array) else {
        errors.add(FIELD, format!("{path}.timestamp: 'columns' is a required property"));
        return None;
    };
    if raw_columns.is_empty() {
        errors.add(FIELD, format!("{path}.timestamp.columns: must not be empty"));
        return None;
    }

    let mut columns = Vec::with_capacity(raw_columns.len());
    let mut indices = Vec::with_capacity(raw_columns.len());
    for (i, raw) in raw_columns.iter().enumerate() {
        let Some(column) = ColumnRef::from_json(raw) else {
            errors.add(
                FIELD,
                format!("{path}.timestamp.columns[{i}]: must be a column index or header name"),
            );
            continue;
        };
        match column.resolve(headers) {
            Some(idx) => indices.push(idx),
            None => errors.add(
                FIELD,
                format!(
                    "{path}.timestamp.columns[{i}]: invalid column {raw} ({} headers)",
                    headers.len()
                ),
            ),
        }
        columns.push(column);
    }

    let format = match spec.get("format") {
        None | Some(Json::Null) => None,
        Some(Json::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.add(FIELD, format!("{path}.timestamp.format: must be a string"));
            None
        }
    };

    (indices.len() == columns.len()).then_some(TimestampSpec {
        columns,
        indices,
        format,
    })
}

fn parse_sensors(
    sensors: &Map<String, Json>,
    files: &[FileSignature],
    errors: &mut ValidationErrors,
) -> Vec<SensorDefinition> {
    let mut out = Vec::with_capacity(sensors.len());
    for (name, def) in sensors {
        let path = format!("sensors.{name}");
        let Some(def) = def.as_object() else {
            errors.add(FIELD, format!("{path}: must be an object"));
            continue;
        };

        let mut missing = false;
        for required in ["type", "column", "file"] {
            if !def.contains_key(required) {
                errors.add(FIELD, format!("{path}: '{required}' is a required property"));
                missing = true;
            }
        }
        if missing {
            continue;
        }

        let data_type = match DataType::deserialize(&def["type"]) {
            Ok(t) => t,
            Err(_) => {
                errors.add(FIELD, format!("{path}.type: unknown sensor type {}", def["type"]));
                continue;
            }
        };

        let file_id = match &def["file"] {
            Json::String(s) => s.clone(),
            Json::Number(n) => n.to_string(),
            other => {
                errors.add(FIELD, format!("{path}.file: invalid file reference {other}"));
                continue;
            }
        };
        let Some(file) = files.iter().find(|f| f.id == file_id) else {
            errors.add(FIELD, format!("{path}.file: unknown file '{file_id}'"));
            continue;
        };

        let Some(column) = ColumnRef::from_json(&def["column"]) else {
            errors.add(FIELD, format!("{path}.column: must be a column index or header name"));
            continue;
        };
        let Some(column_index) = column.resolve(&file.headers) else {
            errors.add(
                FIELD,
                format!(
                    "{path}.column: column {} does not resolve against file '{file_id}'",
                    def["column"]
                ),
            );
            continue;
        };

        let unit = match def.get("unit") {
            None | Some(Json::Null) => None,
            Some(Json::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };

        out.push(SensorDefinition {
            name: name.clone(),
            data_type,
            column,
            column_index,
            file: file_id,
            unit,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed_map() -> Json {
        json!({
            "version": 1,
            "sensors": {
                "Test/WholeBuildingPower": {"type": "float", "column": "Main Meter [kW]", "file": "0", "unit": "kilowatt"},
                "Test/OutdoorAirTemperature": {"type": "float", "column": 1, "file": "1"}
            },
            "files": {
                "0": {"signature": {"headers": ["Date", "Main Meter [kW]"]}, "timestamp": {"columns": [0]}},
                "1": {"signature": {"headers": ["Date", "Time", "OAT [F]"]}, "timestamp": {"columns": ["Date", 1], "format": "%m/%d/%Y %H:%M"}}
            }
        })
    }

    #[test]
    fn parses_and_resolves_columns() {
        let map = DataMap::from_value(&mixed_map()).unwrap();
        assert_eq!(map.version, 1);
        assert_eq!(map.sensors.len(), 2);
        assert_eq!(map.sensors[0].name, "Test/WholeBuildingPower");
        assert_eq!(map.sensors[0].column_index, 1);
        assert_eq!(map.sensors[0].unit.as_deref(), Some("kilowatt"));
        let ts = map.file("1").unwrap().timestamp.as_ref().unwrap();
        assert_eq!(ts.indices, vec![0, 1]);
        assert_eq!(ts.format.as_deref(), Some("%m/%d/%Y %H:%M"));
    }

    #[test]
    fn missing_version_is_named() {
        let err = DataMap::from_value(&json!({"extra": {"bad": "robot"}})).unwrap_err();
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"map": ["'version' is a required property"]})
        );
    }

    #[test]
    fn out_of_range_timestamp_column_is_a_config_error() {
        let mut doc = mixed_map();
        doc["files"]["0"]["timestamp"]["columns"] = json!([5]);
        let err = DataMap::from_value(&doc).unwrap_err();
        let messages = err.get("map").unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("files.0.timestamp.columns[0]: invalid column 5"));
    }

    #[test]
    fn sensor_must_reference_declared_file_and_column() {
        let mut doc = mixed_map();
        doc["sensors"]["Test/WholeBuildingPower"]["file"] = json!("7");
        doc["sensors"]["Test/OutdoorAirTemperature"]["column"] = json!("nope");
        let err = DataMap::from_value(&doc).unwrap_err();
        let messages = err.get("map").unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("unknown file '7'"));
        assert!(messages[1].contains("does not resolve"));
    }

    #[test]
    fn round_trips_through_document_form() {
        let map = DataMap::from_value(&mixed_map()).unwrap();
        let again = DataMap::from_value(&map.to_value()).unwrap();
        assert_eq!(map, again);
    }

    #[test]
    fn loose_signature_ignores_case_and_extra_columns() {
        let sig = FileSignature {
            id: "0".into(),
            headers: vec!["Date".into(), "kW".into()],
            strict: false,
            timestamp: None,
        };
        assert!(sig.check_headers(&["date".into(), "KW".into(), "extra".into()]).is_ok());
        assert!(sig.check_headers(&["date".into()]).is_err());

        let strict = FileSignature { strict: true, ..sig };
        assert!(strict.check_headers(&["Date".into(), "kW".into(), "extra".into()]).is_err());
        assert!(strict.check_headers(&["Date".into(), "kw".into()]).is_err());
        assert!(strict.check_headers(&["Date".into(), " kW".into()]).is_ok());
    }
}
