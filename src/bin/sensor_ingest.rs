//! Command-line front end for the ingestion pipeline.
//!
//! ```bash
//! sensor_ingest ingest --datamap map.json --file 0=meter.csv --file 1=weather.csv > merged.csv
//! sensor_ingest preview --datamap map.json --file 0=meter.csv --rows 5
//! sensor_ingest timestamps weather.csv --column Date --column Time --rows 3
//! ```
//!
//! Everything lives in an in-memory store for the duration of the command.

use std::env;
use std::fs::File;
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use openeis_ingest::config::Settings;
use openeis_ingest::datamap::DataMap;
use openeis_ingest::ingestion::{
    CompositeObserver, CoordinatorOptions, FileObserver, IngestionCoordinator, IngestionObserver, TracingObserver,
    preview_timestamps,
};
use openeis_ingest::merge::{DatasetSource, FilteredSource, MergeOptions, SeriesSource, merge, write_csv};
use openeis_ingest::preview::{FileRefs, MapRef, PreviewRequest, preview};
use openeis_ingest::processing::FilterConfig;
use openeis_ingest::storage::{MemoryStore, SensorStore};
use openeis_ingest::types::FileId;

#[derive(Parser, Debug)]
#[command(name = "sensor_ingest", about = "Ingest sensor CSV files through a datamap", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest files and write the merged dataset as CSV
    Ingest {
        #[command(flatten)]
        input: DatamapInput,

        /// Download window start: a timestamp or a row offset
        #[arg(long, allow_hyphen_values = true)]
        start: Option<String>,

        /// Download window end: a timestamp or a count of rows dropped from the end
        #[arg(long, allow_hyphen_values = true)]
        end: Option<String>,

        /// Omit the header row
        #[arg(long)]
        no_header: bool,

        /// JSON file with a list of `[topic, filter, {params}]` entries
        #[arg(long)]
        filters: Option<PathBuf>,

        /// Write CSV here instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Also append ingest events to this file as JSON lines
        #[arg(long)]
        event_log: Option<PathBuf>,
    },

    /// Print the first rows of the merged dataset as JSON without storing anything
    Preview {
        #[command(flatten)]
        input: DatamapInput,

        /// Rows to show (defaults to OPENEIS_HEAD_ROWS_DEFAULT)
        #[arg(long)]
        rows: Option<usize>,
    },

    /// Print how the timestamps of a file parse
    Timestamps {
        /// CSV file
        path: PathBuf,

        /// Timestamp column index or header name; repeat to join several columns
        #[arg(long = "column")]
        columns: Vec<String>,

        /// strftime format; heuristic parsing when absent
        #[arg(long)]
        format: Option<String>,

        /// Rows to parse (defaults to OPENEIS_HEAD_ROWS_DEFAULT)
        #[arg(long)]
        rows: Option<usize>,
    },
}

#[derive(Args, Debug)]
struct DatamapInput {
    /// Datamap JSON document
    #[arg(long)]
    datamap: PathBuf,

    /// Datamap file key bound to a CSV path, as KEY=PATH
    #[arg(long = "file", value_parser = parse_binding, required = true)]
    files: Vec<(String, PathBuf)>,
}

fn parse_binding(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((key, path)) if !key.is_empty() && !path.is_empty() => Ok((key.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected KEY=PATH, got '{raw}'")),
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let settings = Settings::from_env().context("invalid settings")?;
    settings.log_settings();

    match cli.command {
        Command::Ingest {
            input,
            start,
            end,
            no_header,
            filters,
            output,
            event_log,
        } => {
            let mut options = MergeOptions::from_query(start.as_deref(), end.as_deref());
            options.include_header = !no_header;
            let observer = observer_for(event_log.as_deref());
            run_ingest(&settings, &input, &options, observer, filters.as_deref(), output.as_deref())
        }
        Command::Preview { input, rows } => run_preview(&settings, &input, rows),
        Command::Timestamps {
            path,
            columns,
            format,
            rows,
        } => {
            let parsed = preview_timestamps(
                &path,
                &columns,
                format.as_deref(),
                settings.head_rows(rows),
                settings.delimiter_sample_bytes,
            )
            .with_context(|| format!("failed to read timestamps from {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&parsed)?);
            Ok(())
        }
    }
}

/// Register the datamap and files in a fresh store.
fn load(store: &MemoryStore, input: &DatamapInput) -> Result<(u64, Vec<(String, FileId)>)> {
    let text = std::fs::read_to_string(&input.datamap)
        .with_context(|| format!("failed to read datamap {}", input.datamap.display()))?;
    let map = DataMap::from_json_str(&text).context("invalid datamap")?;
    let name = input
        .datamap
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "datamap".to_string());
    let map_id = store.add_datamap(name, map);

    let files = input
        .files
        .iter()
        .map(|(key, path)| {
            let name = path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| key.clone());
            (key.clone(), store.add_file(name, path.clone()))
        })
        .collect();
    Ok((map_id, files))
}

fn observer_for(event_log: Option<&Path>) -> Arc<dyn IngestionObserver> {
    match event_log {
        None => Arc::new(TracingObserver),
        Some(path) => {
            let members: Vec<Arc<dyn IngestionObserver>> =
                vec![Arc::new(TracingObserver), Arc::new(FileObserver::new(path))];
            Arc::new(CompositeObserver::new(members))
        }
    }
}

fn run_ingest(
    settings: &Settings,
    input: &DatamapInput,
    options: &MergeOptions,
    observer: Arc<dyn IngestionObserver>,
    filters: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (map_id, files) = load(&store, input)?;

    let coordinator = IngestionCoordinator::new(
        store.clone(),
        CoordinatorOptions {
            observer: Some(observer),
            ..CoordinatorOptions::from_settings(settings)
        },
    )?;
    let ticket = coordinator.start_ingest(map_id, &files)?;
    let summary = ticket.wait().context("ingest failed")?;

    for entry in store.logs(summary.id)? {
        tracing::warn!(
            file = %entry.file,
            row = ?entry.row,
            column = ?entry.column,
            level = ?entry.level,
            "{}",
            entry.message
        );
    }
    let status = serde_json::to_string(&coordinator.status(summary.id)?)?;
    tracing::info!(ingest = summary.id, %status, "{}", coordinator.metrics());

    let dataset = DatasetSource::for_ingest(store.clone(), summary.id)?;
    let source: Box<dyn SeriesSource + '_> = match filters {
        None => Box::new(dataset),
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read filters {}", path.display()))?;
            let configs = FilterConfig::list_from_str(&text)?;
            let (filtered, errors) = FilteredSource::new(dataset, configs);
            if !errors.is_empty() {
                bail!("filter configuration rejected: {}", errors.join("; "));
            }
            Box::new(filtered)
        }
    };

    let rows = merge(source.as_ref(), options)?;
    let written = match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
            write_csv(rows, BufWriter::new(file))?
        }
        None => write_csv(rows, io::stdout().lock())?,
    };
    source.check().context("merged dataset is incomplete")?;
    tracing::info!(rows = written, "merged dataset written");
    Ok(())
}

fn run_preview(settings: &Settings, input: &DatamapInput, rows: Option<usize>) -> Result<()> {
    let store = MemoryStore::new();
    let (map_id, files) = load(&store, input)?;
    let request = PreviewRequest {
        map: MapRef::Id(map_id),
        rows,
        files: FileRefs::Map(files.into_iter().collect()),
    };
    let result = preview(&store, settings, &request)?;

    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, &result)?;
    writeln!(out)?;
    Ok(())
}

/// Install the global tracing subscriber.
///
/// - `RUST_LOG` wins when set; otherwise `SENSOR_INGEST_LOG` picks the level (default `info`)
/// - `FORCE_COLOR=1|true|yes` / `0|false|no` overrides TTY detection on stderr
/// - `SENSOR_INGEST_SPAN_EVENTS=full` emits span enter/exit/close events
///
/// Logs go to stderr so merged CSV on stdout stays clean.
fn init_tracing() {
    let span_events = match env::var("SENSOR_INGEST_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        _ => FmtSpan::NONE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => io::stderr().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("SENSOR_INGEST_LOG").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(level)
    };

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
