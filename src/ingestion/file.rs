//! Streaming ingestion of a single CSV file against its datamap signature.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::datamap::{ColumnRef, DataMap, FileSignature};
use crate::error::{IngestionError, IngestionResult, ValidationErrors};
use crate::types::{DataType, TypedValue};

use super::delimiter::detect_delimiter;
use super::parser::parse_cell;
use super::timestamp::{TimestampAssembler, TimestampError};

/// One sensor column read from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub sensor: String,
    pub data_type: DataType,
    /// 0-based column index in the file.
    pub index: usize,
}

/// Everything needed to ingest one file, resolved from a datamap ahead of time.
#[derive(Debug, Clone)]
pub struct FilePlan {
    pub signature: FileSignature,
    pub columns: Vec<ColumnSpec>,
    pub timestamp: Option<TimestampAssembler>,
}

impl FilePlan {
    /// Build the plan for file `file_id` of `map`.
    pub fn from_datamap(map: &DataMap, file_id: &str) -> Result<Self, ValidationErrors> {
        let signature = map.file(file_id).cloned().ok_or_else(|| {
            ValidationErrors::single("files", format!("unknown datamap file '{file_id}'"))
        })?;

        let timestamp = match &signature.timestamp {
            Some(spec) => Some(TimestampAssembler::new(
                spec.indices.clone(),
                spec.format.clone(),
                signature.headers.len(),
            )?),
            None => None,
        };

        let columns = map
            .sensors_for_file(file_id)
            .map(|s| ColumnSpec {
                sensor: s.name.clone(),
                data_type: s.data_type,
                index: s.column_index,
            })
            .collect();

        Ok(Self {
            signature,
            columns,
            timestamp,
        })
    }
}

/// One data row of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    /// 1-based line number (the header is line 1).
    pub line: u64,
    /// Bytes consumed so far, up to the end of this row.
    pub position: u64,
    /// Assembled timestamp; `None` when the file declares no timestamp columns.
    pub time: Option<Result<DateTime<Utc>, TimestampError>>,
    /// One value per [`FilePlan::columns`] entry, in the same order.
    pub columns: Vec<TypedValue>,
}

/// Streams [`ParsedRow`]s from a CSV source.
///
/// The header row is checked against the signature on construction; a mismatch is a
/// [`IngestionError::SignatureMismatch`] for the whole file. After that, every data row yields
/// exactly one `ParsedRow`, with cell problems reported inside it rather than as errors.
pub struct FileIngestor<R: Read> {
    name: String,
    size: u64,
    reader: csv::Reader<R>,
    headers: Vec<String>,
    plan: FilePlan,
    record: csv::ByteRecord,
    done: bool,
}

impl FileIngestor<BufReader<File>> {
    /// Open `path`, detect its delimiter from the first `sample_bytes` bytes and check its header.
    pub fn open(
        path: impl AsRef<Path>,
        name: impl Into<String>,
        plan: FilePlan,
        sample_bytes: usize,
    ) -> IngestionResult<Self> {
        let mut file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        let delimiter = sniff(&mut file, sample_bytes)?;
        file.seek(SeekFrom::Start(0))?;
        Self::from_reader(BufReader::new(file), size, delimiter, name, plan)
    }
}

impl<R: Read> FileIngestor<R> {
    /// Ingest from an already-open reader of `size` bytes.
    pub fn from_reader(
        reader: R,
        size: u64,
        delimiter: u8,
        name: impl Into<String>,
        plan: FilePlan,
    ) -> IngestionResult<Self> {
        let name = name.into();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(reader);

        let headers: Vec<String> = reader
            .byte_headers()?
            .iter()
            .map(|h| String::from_utf8_lossy(h).trim().to_owned())
            .collect();

        plan.signature
            .check_headers(&headers)
            .map_err(|message| IngestionError::SignatureMismatch {
                file: name.clone(),
                message,
            })?;

        Ok(Self {
            name,
            size,
            reader,
            headers,
            plan,
            record: csv::ByteRecord::new(),
            done: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total size of the source in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.plan.columns
    }

    fn parse_record(&self) -> ParsedRow {
        let line = self.record.position().map(|p| p.line()).unwrap_or(0);
        let fields: Vec<Cow<'_, str>> = self
            .record
            .iter()
            .map(String::from_utf8_lossy)
            .collect();

        let time = self.plan.timestamp.as_ref().map(|ts| ts.assemble(&fields));
        let columns = self
            .plan
            .columns
            .iter()
            .map(|c| {
                let raw = fields.get(c.index).map(|f| f.as_ref()).unwrap_or("");
                parse_cell(line, c.index, c.data_type, raw)
            })
            .collect();

        ParsedRow {
            line,
            position: self.reader.position().byte(),
            time,
            columns,
        }
    }
}

impl<R: Read> Iterator for FileIngestor<R> {
    type Item = IngestionResult<ParsedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.read_byte_record(&mut self.record) {
            Ok(true) => Some(Ok(self.parse_record())),
            Ok(false) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

/// Read up to `sample_bytes` from the start of `reader` and detect the delimiter.
pub fn sniff<R: Read>(reader: &mut R, sample_bytes: usize) -> IngestionResult<u8> {
    let mut sample = Vec::with_capacity(sample_bytes.min(1 << 20));
    reader
        .by_ref()
        .take(sample_bytes as u64)
        .read_to_end(&mut sample)?;
    Ok(detect_delimiter(&sample)?)
}

/// One parsed timestamp: the joined raw text and its ISO 8601 form (`None` when unparseable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimestampPreview(pub String, pub Option<String>);

/// Parse the timestamps of the first `rows` data rows of an uploaded file.
///
/// `columns` are raw column tokens: 0-based indices or header names (optionally quoted). An
/// empty list means the first column. Unknown or out-of-range columns fail with
/// `{"columns": ["invalid column: '<token>'"]}`.
pub fn preview_timestamps(
    path: impl AsRef<Path>,
    columns: &[String],
    format: Option<&str>,
    rows: usize,
    sample_bytes: usize,
) -> IngestionResult<Vec<TimestampPreview>> {
    let mut file = File::open(path.as_ref())?;
    let delimiter = sniff(&mut file, sample_bytes)?;
    file.seek(SeekFrom::Start(0))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(BufReader::new(file));
    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_owned())
        .collect();

    let tokens: Vec<&str> = if columns.is_empty() {
        vec!["0"]
    } else {
        columns.iter().map(String::as_str).collect()
    };
    let mut indices = Vec::with_capacity(tokens.len());
    let mut errors = ValidationErrors::new();
    for token in tokens {
        let column = match token.trim().parse::<i64>() {
            Ok(i) if i >= 0 => ColumnRef::Index(i as usize),
            Ok(_) => {
                errors.add("columns", format!("invalid column: '{token}'"));
                continue;
            }
            Err(_) => ColumnRef::Name(unquote(token.trim()).to_owned()),
        };
        match column.resolve(&headers) {
            Some(idx) => indices.push(idx),
            None => errors.add("columns", format!("invalid column: '{token}'")),
        }
    }
    errors.into_result()?;

    let assembler = TimestampAssembler::new(indices, format.map(str::to_owned), headers.len())?;
    let mut out = Vec::with_capacity(rows);
    let mut record = csv::ByteRecord::new();
    while out.len() < rows && reader.read_byte_record(&mut record)? {
        let fields: Vec<Cow<'_, str>> = record.iter().map(String::from_utf8_lossy).collect();
        let text = assembler.text(&fields);
        let parsed = assembler
            .assemble(&fields)
            .ok()
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, false));
        out.push(TimestampPreview(text, parsed));
    }
    Ok(out)
}

fn unquote(s: &str) -> &str {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan() -> FilePlan {
        let map = DataMap::from_value(&json!({
            "version": 1,
            "sensors": {
                "oat": {"type": "float", "column": "OAT", "file": "0"},
                "occupied": {"type": "boolean", "column": 3, "file": "0"}
            },
            "files": {
                "0": {
                    "signature": {"headers": ["Date", "Time", "OAT", "Occupied"]},
                    "timestamp": {"columns": [0, 1]}
                }
            }
        }))
        .unwrap();
        FilePlan::from_datamap(&map, "0").unwrap()
    }

    fn ingest(input: &str) -> IngestionResult<FileIngestor<&[u8]>> {
        FileIngestor::from_reader(input.as_bytes(), input.len() as u64, b',', "test.csv", plan())
    }

    #[test]
    fn yields_one_row_per_data_line_with_positions() {
        let input = "Date,Time,OAT,Occupied\n9/29/2009,15:00,74.72,yes\n9/29/2009,16:00,bad,\n";
        let rows: Vec<ParsedRow> = ingest(input).unwrap().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].line, 2);
        assert_eq!(rows[0].columns, vec![TypedValue::Float(74.72), TypedValue::Bool(true)]);
        assert!(rows[0].time.as_ref().unwrap().is_ok());

        assert_eq!(rows[1].line, 3);
        assert!(matches!(&rows[1].columns[0], TypedValue::ParseError(e) if e.column == 2 && e.row == 3));
        assert_eq!(rows[1].columns[1], TypedValue::NoValue);
        assert!(rows[0].position < rows[1].position);
        assert!(rows[1].position <= input.len() as u64);
    }

    #[test]
    fn short_rows_have_missing_cells_and_bad_timestamps() {
        let input = "Date,Time,OAT,Occupied\nnope\n";
        let rows: Vec<ParsedRow> = ingest(input).unwrap().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].time.as_ref().unwrap().is_err());
        assert_eq!(rows[0].columns, vec![TypedValue::NoValue, TypedValue::NoValue]);
    }

    #[test]
    fn header_mismatch_rejects_the_file() {
        let input = "Date,Time,Temp,Occupied\n9/29/2009,15:00,74.72,yes\n";
        match ingest(input) {
            Err(IngestionError::SignatureMismatch { file, message }) => {
                assert_eq!(file, "test.csv");
                assert!(message.contains("expected header 'OAT'"));
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected a signature mismatch"),
        }
    }

    #[test]
    fn unquote_strips_matching_quotes_only() {
        assert_eq!(unquote("'Date'"), "Date");
        assert_eq!(unquote("\"Date\""), "Date");
        assert_eq!(unquote("'Date\""), "'Date\"");
    }
}
