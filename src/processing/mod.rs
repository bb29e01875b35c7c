//! Filter chains over per-sensor sample streams.
//!
//! A stream is a lazy, time-ordered, single-pass iterator of [`Sample`]s. Every filter wraps a
//! parent stream and is itself a stream, so a chain is built by wrapping in configuration order.
//!
//! Currently implemented:
//!
//! - [`FilterKind::LinearInterpolation`]: resample onto a fixed grid, interpolating linearly
//! - [`FilterKind::Fill`]: resample onto a fixed grid, carrying the last value forward
//! - [`FilterKind::RoundOff`]: round float values to a number of decimal places
//!
//! ## Example: interpolate then round
//!
//! ```rust
//! use std::collections::HashMap;
//!
//! use chrono::{TimeZone, Utc};
//! use openeis_ingest::processing::{apply_filters, FilterConfig, Topic};
//! use openeis_ingest::types::{DataType, Sample, Value};
//!
//! let t0 = Utc.with_ymd_and_hms(2012, 2, 1, 0, 0, 0).unwrap();
//! let samples = vec![
//!     Sample::new(t0, Value::Float(10.0)),
//!     Sample::new(t0 + chrono::Duration::minutes(15), Value::Float(20.0)),
//! ];
//! let mut topics = HashMap::new();
//! topics.insert("oat".to_string(), Topic::new(DataType::Float, samples));
//!
//! let configs = FilterConfig::list_from_str(
//!     r#"[["oat", "LinearInterpolation", {"period_seconds": 600}],
//!         ["oat", "RoundOff", {"places": 2}]]"#,
//! )
//! .unwrap();
//! let (mut topics, errors) = apply_filters(topics, &configs);
//! assert!(errors.is_empty());
//!
//! let values: Vec<Value> = topics.remove("oat").unwrap().stream.map(|s| s.value).collect();
//! assert_eq!(values, vec![Value::Float(10.0), Value::Float(16.67), Value::Float(20.0)]);
//! ```

mod resample;
mod round;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::TimeDelta;
use serde::Deserialize;
use serde_json::Value as Json;

use crate::error::ValidationErrors;
use crate::types::{DataType, Sample};

pub use resample::{ResampleMode, Resampler};
pub use round::{RoundOff, round_to_places};

/// A lazy, time-ordered stream of samples.
pub type SampleStream = Box<dyn Iterator<Item = Sample> + Send>;

/// One named stream with its declared type.
pub struct Topic {
    pub data_type: DataType,
    pub stream: SampleStream,
}

impl Topic {
    pub fn new<I>(data_type: DataType, samples: I) -> Self
    where
        I: IntoIterator<Item = Sample>,
        I::IntoIter: Send + 'static,
    {
        Self {
            data_type,
            stream: Box::new(samples.into_iter()),
        }
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("data_type", &self.data_type)
            .finish_non_exhaustive()
    }
}

/// Known filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    LinearInterpolation,
    RoundOff,
    Fill,
}

impl FromStr for FilterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LinearInterpolation" => Ok(FilterKind::LinearInterpolation),
            "RoundOff" => Ok(FilterKind::RoundOff),
            "Fill" => Ok(FilterKind::Fill),
            other => Err(format!("Invalid filter name: {other}")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResampleParams {
    period_seconds: i64,
    #[serde(default)]
    drop_extra: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoundOffParams {
    places: i32,
}

impl FilterKind {
    /// Validate `params` for this filter.
    pub fn configure(self, params: &Json) -> Result<Filter, String> {
        match self {
            FilterKind::LinearInterpolation | FilterKind::Fill => {
                let p = ResampleParams::deserialize(params).map_err(|e| e.to_string())?;
                if p.period_seconds <= 0 {
                    return Err(format!("period_seconds must be greater than 0, got {}", p.period_seconds));
                }
                let period = TimeDelta::try_seconds(p.period_seconds)
                    .ok_or_else(|| format!("period_seconds {} is out of range", p.period_seconds))?;
                let mode = if self == FilterKind::Fill {
                    ResampleMode::Fill
                } else {
                    ResampleMode::Linear
                };
                Ok(Filter::Resample {
                    mode,
                    period,
                    drop_extra: p.drop_extra,
                })
            }
            FilterKind::RoundOff => {
                let p = RoundOffParams::deserialize(params).map_err(|e| e.to_string())?;
                Ok(Filter::RoundOff { places: p.places })
            }
        }
    }
}

/// A configured filter, ready to wrap a parent stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Resample {
        mode: ResampleMode,
        period: TimeDelta,
        drop_extra: bool,
    },
    RoundOff {
        places: i32,
    },
}

impl Filter {
    pub fn wrap(self, parent: SampleStream) -> SampleStream {
        match self {
            Filter::Resample {
                mode,
                period,
                drop_extra,
            } => Box::new(Resampler::new(parent, mode, period, drop_extra)),
            Filter::RoundOff { places } => Box::new(RoundOff::new(parent, places)),
        }
    }
}

/// Topic reference: a sensor name, or a list whose first element is the name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TopicRef {
    Name(String),
    List(Vec<String>),
}

impl TopicRef {
    pub fn name(&self) -> Option<&str> {
        match self {
            TopicRef::Name(name) => Some(name),
            TopicRef::List(names) => names.first().map(String::as_str),
        }
    }
}

impl fmt::Display for TopicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicRef::Name(name) => f.write_str(name),
            TopicRef::List(names) => write!(f, "{names:?}"),
        }
    }
}

/// One `[topic, filter_name, {params}]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FilterConfig(pub TopicRef, pub String, #[serde(default)] pub Json);

impl FilterConfig {
    /// Parse a JSON list of filter configs. Shape errors are reported under `config`.
    pub fn list_from_str(input: &str) -> Result<Vec<FilterConfig>, ValidationErrors> {
        serde_json::from_str(input)
            .map_err(|e| ValidationErrors::single("config", format!("invalid filter config: {e}")))
    }

    pub fn list_from_value(value: &Json) -> Result<Vec<FilterConfig>, ValidationErrors> {
        Vec::<FilterConfig>::deserialize(value)
            .map_err(|e| ValidationErrors::single("config", format!("invalid filter config: {e}")))
    }
}

/// Apply `configs` in order to `topics`.
///
/// A config that names an unknown topic or filter, or whose parameters do not validate, is
/// skipped and described in the returned error list; the remaining configs still apply.
pub fn apply_filters(
    mut topics: HashMap<String, Topic>,
    configs: &[FilterConfig],
) -> (HashMap<String, Topic>, Vec<String>) {
    let mut errors = Vec::new();

    for FilterConfig(topic, filter_name, params) in configs {
        let Some(name) = topic.name().filter(|n| topics.contains_key(*n)) else {
            errors.push(format!("Invalid Topic for DataMap: {topic}"));
            continue;
        };
        let kind = match filter_name.parse::<FilterKind>() {
            Ok(kind) => kind,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        let filter = match kind.configure(params) {
            Ok(filter) => filter,
            Err(e) => {
                errors.push(format!("Error configuring filter: {e}"));
                continue;
            }
        };

        if let Some(Topic { data_type, stream }) = topics.remove(name) {
            let stream = filter.wrap(stream);
            topics.insert(name.to_owned(), Topic { data_type, stream });
        }
    }

    (topics, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn topics() -> HashMap<String, Topic> {
        let t0 = Utc.with_ymd_and_hms(2012, 2, 1, 0, 0, 0).unwrap();
        let mut topics = HashMap::new();
        topics.insert(
            "oat".to_string(),
            Topic::new(DataType::Float, vec![Sample::new(t0, Value::Float(3.14159))]),
        );
        topics
    }

    #[test]
    fn filter_names_are_an_explicit_set() {
        assert_eq!("Fill".parse::<FilterKind>(), Ok(FilterKind::Fill));
        assert_eq!(
            "Smooth".parse::<FilterKind>(),
            Err("Invalid filter name: Smooth".to_string())
        );
    }

    #[test]
    fn topic_lists_use_their_first_element() {
        let configs = FilterConfig::list_from_value(&json!([[["oat", "other"], "RoundOff", {"places": 2}]])).unwrap();
        let (mut topics, errors) = apply_filters(topics(), &configs);
        assert!(errors.is_empty());
        let out: Vec<Sample> = topics.remove("oat").unwrap().stream.collect();
        assert_eq!(out[0].value, Value::Float(3.14));
    }

    #[test]
    fn errors_are_collected_per_config_without_aborting() {
        let configs = FilterConfig::list_from_value(&json!([
            ["missing", "RoundOff", {"places": 2}],
            ["oat", "Smooth", {}],
            ["oat", "LinearInterpolation", {"period_seconds": 0}],
            ["oat", "Fill", {"period": 300}],
            ["oat", "RoundOff", {"places": 1}]
        ]))
        .unwrap();
        let (mut topics, errors) = apply_filters(topics(), &configs);
        assert_eq!(errors.len(), 4);
        assert_eq!(errors[0], "Invalid Topic for DataMap: missing");
        assert_eq!(errors[1], "Invalid filter name: Smooth");
        assert!(errors[2].starts_with("Error configuring filter: period_seconds must be greater than 0"));
        assert!(errors[3].starts_with("Error configuring filter: "));

        let out: Vec<Sample> = topics.remove("oat").unwrap().stream.collect();
        assert_eq!(out[0].value, Value::Float(3.1));
    }

    #[test]
    fn malformed_config_lists_are_validation_errors() {
        let err = FilterConfig::list_from_str("{\"oat\": 1}").unwrap_err();
        assert!(err.get("config").is_some());
    }
}
