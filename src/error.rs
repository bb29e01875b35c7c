use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::storage::StoreError;

/// Convenience result type for ingestion operations.
pub type IngestionResult<T> = Result<T, IngestionError>;

/// Error type returned by ingestion, merge and preview functions.
///
/// Recoverable cell/row problems never show up here; they are reported as
/// [`crate::types::CellError`] values and persisted as ingest log entries.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Underlying I/O error (e.g. file not found, permission denied).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV reader error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Malformed JSON document (datamap, filter config).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// A file's header row does not match its datamap signature.
    #[error("signature mismatch in file '{file}': {message}")]
    SignatureMismatch { file: String, message: String },

    /// Structured, field-named configuration errors.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    /// A referenced record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    /// An environment setting could not be parsed.
    #[error("invalid setting {name}: {message}")]
    InvalidSetting { name: String, message: String },
}

impl From<ValidationErrors> for IngestionError {
    fn from(errors: ValidationErrors) -> Self {
        IngestionError::Validation(errors)
    }
}

/// Field-named validation messages, e.g. `{"file": ["Could not determine delimiter"]}`.
///
/// Serializes as a plain JSON object so a REST layer can return it verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single error for a single field.
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Messages recorded for `field`.
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Merge another set of errors into this one.
    pub fn extend(&mut self, other: ValidationErrors) {
        for (field, messages) in other.fields {
            self.fields.entry(field).or_default().extend(messages);
        }
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                write!(f, "{field}: {message}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}
