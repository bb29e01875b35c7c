use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use openeis_ingest::datamap::DataMap;
use openeis_ingest::ingestion::{CoordinatorOptions, IngestionCoordinator};
use openeis_ingest::merge::{DatasetSource, MergeOptions, MergedRow, SeriesSource, WindowBound, merge, write_csv};
use openeis_ingest::storage::MemoryStore;
use openeis_ingest::types::{DataMapId, IngestId};

struct Ingested {
    store: Arc<MemoryStore>,
    map_id: DataMapId,
    meter_run: IngestId,
    weather_run: IngestId,
}

/// Two runs over one datamap: the meter file alone, then the weather file alone.
fn ingested() -> Ingested {
    let text = std::fs::read_to_string("tests/fixtures/mixed_datamap.json").unwrap();
    let store = Arc::new(MemoryStore::new());
    let map_id = store.add_datamap("mixed", DataMap::from_json_str(&text).unwrap());
    let meter = store.add_file("meter.csv", "tests/fixtures/meter.csv");
    let weather = store.add_file("weather.csv", "tests/fixtures/weather.csv");

    let c = IngestionCoordinator::new(store.clone(), CoordinatorOptions::default()).unwrap();
    let meter_run = c.start_ingest(map_id, &[("0".to_string(), meter)]).unwrap().wait().unwrap().id;
    let weather_run = c.start_ingest(map_id, &[("1".to_string(), weather)]).unwrap().wait().unwrap().id;
    Ingested {
        store,
        map_id,
        meter_run,
        weather_run,
    }
}

fn utc(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2012, 2, 1, h, m, 0).unwrap()
}

fn data_rows(source: &dyn SeriesSource, options: MergeOptions) -> Vec<MergedRow> {
    merge(source, &options)
        .unwrap()
        .filter(|r| matches!(r, MergedRow::Data { .. }))
        .collect()
}

fn first_time(rows: &[MergedRow]) -> Option<DateTime<Utc>> {
    rows.iter().find_map(|r| match r {
        MergedRow::Data { time, .. } => Some(*time),
        MergedRow::Header(_) => None,
    })
}

fn offsets(start: i64, end: i64) -> MergeOptions {
    MergeOptions {
        start: Some(WindowBound::Offset(start)),
        end: Some(WindowBound::Offset(end)),
        include_header: true,
    }
}

#[test]
fn zero_offsets_equal_the_full_merge() {
    let run = ingested();
    let all = DatasetSource::for_datamap(run.store.clone(), run.map_id).unwrap();
    let full: Vec<MergedRow> = merge(&all, &MergeOptions::default()).unwrap().collect();
    let zero: Vec<MergedRow> = merge(&all, &offsets(0, 0)).unwrap().collect();
    assert_eq!(full.len(), 21);
    assert_eq!(full, zero);
}

#[test]
fn repeated_merges_are_identical() {
    let run = ingested();
    let all = DatasetSource::for_datamap(run.store.clone(), run.map_id).unwrap();
    let mut first = Vec::new();
    let mut second = Vec::new();
    write_csv(merge(&all, &MergeOptions::default()).unwrap(), &mut first).unwrap();
    write_csv(merge(&all, &MergeOptions::default()).unwrap(), &mut second).unwrap();
    assert_eq!(first, second);

    let text = String::from_utf8(first).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "time,Test/WholeBuildingPower,Test/OutdoorAirTemperature");
    assert_eq!(lines[1], "2012-02-01T00:00:00+00:00,108.52,");
    assert_eq!(lines[2], "2012-02-01T00:30:00+00:00,,45.67");
}

#[test]
fn start_past_the_end_leaves_only_the_header() {
    let run = ingested();
    let all = DatasetSource::for_datamap(run.store.clone(), run.map_id).unwrap();
    for start in [20, 21, 1_000] {
        let rows: Vec<MergedRow> = merge(&all, &offsets(start, 0)).unwrap().collect();
        assert_eq!(rows.len(), 1, "start={start}");
        assert!(matches!(rows[0], MergedRow::Header(_)));
    }
}

#[test]
fn offsets_trim_both_ends() {
    let run = ingested();
    let all = DatasetSource::for_datamap(run.store.clone(), run.map_id).unwrap();
    let rows = data_rows(&all, offsets(5, 5));
    assert_eq!(rows.len(), 10);
    assert_eq!(first_time(&rows), Some(utc(2, 30)));
    assert!(data_rows(&all, offsets(15, 5)).is_empty());
    assert!(data_rows(&all, offsets(-1, 0)).is_empty());
}

#[test]
fn time_windows_include_start_and_exclude_end() {
    let run = ingested();
    let all = DatasetSource::for_datamap(run.store.clone(), run.map_id).unwrap();
    let options = MergeOptions::from_query(Some("2012-02-01 02:00:00+00:00"), Some("2012-02-01 04:00:00+00:00"));
    let rows = data_rows(&all, options);
    assert_eq!(rows.len(), 4);
    assert_eq!(first_time(&rows), Some(utc(2, 0)));
    assert!(matches!(rows[3], MergedRow::Data { time, .. } if time == utc(3, 30)));
}

#[test]
fn unparseable_bounds_are_ignored() {
    let run = ingested();
    let all = DatasetSource::for_datamap(run.store.clone(), run.map_id).unwrap();
    let rows = data_rows(&all, MergeOptions::from_query(Some("abc"), Some("")));
    assert_eq!(rows.len(), 20);
}

#[test]
fn disjoint_runs_add_up_to_their_union() {
    let run = ingested();
    let store = &run.store;
    let meter = DatasetSource::for_ingest(store.clone(), run.meter_run).unwrap();
    let weather = DatasetSource::for_ingest(store.clone(), run.weather_run).unwrap();
    let all = DatasetSource::for_datamap(store.clone(), run.map_id).unwrap();

    let a = data_rows(&meter, MergeOptions::default()).len();
    let b = data_rows(&weather, MergeOptions::default()).len();
    assert_eq!((a, b), (10, 10));
    assert_eq!(data_rows(&all, MergeOptions::default()).len(), a + b);
}

#[test]
fn headers_can_be_left_out() {
    let run = ingested();
    let all = DatasetSource::for_datamap(run.store.clone(), run.map_id).unwrap();
    let options = MergeOptions {
        include_header: false,
        ..MergeOptions::default()
    };
    let rows: Vec<MergedRow> = merge(&all, &options).unwrap().collect();
    assert_eq!(rows.len(), 20);
    assert!(matches!(rows[0], MergedRow::Data { .. }));
}
