//! Datamap-driven ingestion of sensor CSV files.
//!
//! Most callers should use [`IngestionCoordinator`], which:
//!
//! - validates a datamap id and a file-key-to-upload mapping synchronously
//! - runs the ingest on a worker thread, persisting every value (and every problem) in one
//!   storage transaction
//! - reports progress while running and success/failure/alerts to an [`IngestionObserver`]
//!
//! The lower layers are usable on their own:
//! - [`file`]: per-file parsing ([`FileIngestor`]) and the timestamp preview
//! - [`parser`]: typed cell parsing
//! - [`timestamp`]: timestamp parsing and multi-column assembly
//! - [`delimiter`]: delimiter detection

pub mod coordinator;
pub mod delimiter;
pub mod file;
pub mod observability;
pub mod parser;
pub mod timestamp;

pub use coordinator::{
    CoordinatorOptions, IngestStatus, IngestSummary, IngestTicket, IngestionCoordinator,
};
pub use file::{ColumnSpec, FileIngestor, FilePlan, ParsedRow, TimestampPreview, preview_timestamps};
pub use observability::{
    CompositeObserver, FileObserver, IngestionContext, IngestionObserver, IngestionSeverity, IngestionStats,
    TracingObserver,
};
