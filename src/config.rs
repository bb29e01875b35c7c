//! Runtime settings loaded from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `OPENEIS_HEAD_ROWS_DEFAULT` | 20 |
//! | `OPENEIS_HEAD_ROWS_MAX` | 1000 |
//! | `OPENEIS_INGEST_WORKERS` | available parallelism |
//! | `OPENEIS_DELIMITER_SAMPLE_BYTES` | 65536 |

use std::env;

use crate::error::{IngestionError, IngestionResult};

/// Parse an optional `usize` setting with a default value; zero is rejected.
macro_rules! parse_setting {
    ($lookup:expr, $var_name:expr, $default:expr) => {
        match $lookup($var_name) {
            None => $default,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) => {
                    return Err(IngestionError::InvalidSetting {
                        name: $var_name.to_string(),
                        message: "must be greater than 0".to_string(),
                    })
                }
                Ok(v) => v,
                Err(e) => {
                    return Err(IngestionError::InvalidSetting {
                        name: $var_name.to_string(),
                        message: format!("'{raw}': {e}"),
                    })
                }
            },
        }
    };
}

/// Effective pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Preview rows returned when the caller does not ask for a count.
    pub head_rows_default: usize,
    /// Upper bound on preview rows.
    pub head_rows_max: usize,
    /// Worker threads hosting ingest runs.
    pub ingest_workers: usize,
    /// Bytes sampled from the start of a file for delimiter detection.
    pub delimiter_sample_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            head_rows_default: 20,
            head_rows_max: 1000,
            ingest_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            delimiter_sample_bytes: 64 * 1024,
        }
    }
}

impl Settings {
    pub fn from_env() -> IngestionResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load settings through `lookup`, falling back to [`Settings::default`] per variable.
    pub fn from_lookup<F>(lookup: F) -> IngestionResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let head_rows_default = parse_setting!(lookup, "OPENEIS_HEAD_ROWS_DEFAULT", defaults.head_rows_default);
        let head_rows_max = parse_setting!(lookup, "OPENEIS_HEAD_ROWS_MAX", defaults.head_rows_max);
        let ingest_workers = parse_setting!(lookup, "OPENEIS_INGEST_WORKERS", defaults.ingest_workers);
        let delimiter_sample_bytes =
            parse_setting!(lookup, "OPENEIS_DELIMITER_SAMPLE_BYTES", defaults.delimiter_sample_bytes);

        if head_rows_default > head_rows_max {
            return Err(IngestionError::InvalidSetting {
                name: "OPENEIS_HEAD_ROWS_DEFAULT".to_string(),
                message: format!("{head_rows_default} exceeds OPENEIS_HEAD_ROWS_MAX ({head_rows_max})"),
            });
        }

        Ok(Self {
            head_rows_default,
            head_rows_max,
            ingest_workers,
            delimiter_sample_bytes,
        })
    }

    /// Clamp a requested preview row count to the configured bounds.
    pub fn head_rows(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.head_rows_default)
            .min(self.head_rows_max)
    }

    pub fn log_settings(&self) {
        tracing::info!("Settings loaded:");
        tracing::info!("  OPENEIS_HEAD_ROWS_DEFAULT      : {}", self.head_rows_default);
        tracing::info!("  OPENEIS_HEAD_ROWS_MAX          : {}", self.head_rows_max);
        tracing::info!("  OPENEIS_INGEST_WORKERS         : {}", self.ingest_workers);
        tracing::info!("  OPENEIS_DELIMITER_SAMPLE_BYTES : {}", self.delimiter_sample_bytes);
    }
}
