//! `openeis-ingest` ingests building energy sensor CSV files into typed per-sensor time series,
//! driven by a declarative [`datamap::DataMap`], and reconstructs time-aligned tables from them.
//!
//! The pipeline has three parts:
//!
//! - **Ingestion** ([`ingestion`]): a datamap binds file columns to typed sensors. Each file's
//!   header is checked against its declared signature, every row's timestamp is assembled from
//!   one or more columns, and every cell is parsed as its sensor's type. Malformed cells and
//!   timestamps become log entries; the run continues.
//! - **Filters** ([`processing`]): lazy per-sensor streams can be resampled (linear
//!   interpolation or fill) and rounded before they are merged.
//! - **Merge** ([`merge`]): per-sensor series are combined into one row per distinct
//!   timestamp, windowed by time or row offset, for download or [`preview`].
//!
//! Storage is a collaborator behind [`storage::SensorStore`]; [`storage::MemoryStore`] is the
//! in-process implementation.
//!
//! ## Sensor types
//!
//! - [`types::DataType::Boolean`]
//! - [`types::DataType::Integer`]
//! - [`types::DataType::Float`]
//! - [`types::DataType::String`]
//! - [`types::DataType::Datetime`]
//!
//! Empty cells are missing values: nothing is stored for them and the merge shows a null.
//!
//! ## Quick example: ingest and merge
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use openeis_ingest::datamap::DataMap;
//! use openeis_ingest::ingestion::{CoordinatorOptions, IngestionCoordinator};
//! use openeis_ingest::merge::{merge, DatasetSource, MergeOptions};
//! use openeis_ingest::storage::MemoryStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let map = DataMap::from_json_str(&std::fs::read_to_string("datamap.json")?)?;
//! let map_id = store.add_datamap("building", map);
//! let file_id = store.add_file("meter.csv", "meter.csv");
//!
//! let coordinator = IngestionCoordinator::new(store.clone(), CoordinatorOptions::default())?;
//! let ticket = coordinator.start_ingest(map_id, &[("0".to_string(), file_id)])?;
//! let summary = ticket.wait()?;
//!
//! let dataset = DatasetSource::for_ingest(store.clone(), summary.id)?;
//! for row in merge(&dataset, &MergeOptions::default())? {
//!     println!("{}", row.to_record().join(","));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`datamap`]: datamap documents and their validation
//! - [`ingestion`]: file parsing and the ingest coordinator
//! - [`processing`]: filter chains over sample streams
//! - [`merge`]: time-aligned merge and windowing
//! - [`preview`]: preview of a datamap over uploads without persisting
//! - [`storage`]: the storage collaborator and an in-memory implementation
//! - [`execution`]: worker pool, progress tracking and metrics
//! - [`config`]: environment settings
//! - [`error`]: error types used across the crate

pub mod config;
pub mod datamap;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod merge;
pub mod preview;
pub mod processing;
pub mod storage;
pub mod types;

pub use error::{IngestionError, IngestionResult, ValidationErrors};
