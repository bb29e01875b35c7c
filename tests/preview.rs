use openeis_ingest::IngestionError;
use openeis_ingest::config::Settings;
use openeis_ingest::datamap::DataMap;
use openeis_ingest::preview::{PreviewRequest, preview};
use openeis_ingest::storage::MemoryStore;
use serde_json::{Value as Json, json};

struct Fixture {
    store: MemoryStore,
    map_doc: Json,
    map_id: u64,
    meter: u64,
    weather: u64,
}

fn fixture() -> Fixture {
    let text = std::fs::read_to_string("tests/fixtures/mixed_datamap.json").unwrap();
    let map_doc: Json = serde_json::from_str(&text).unwrap();
    let store = MemoryStore::new();
    let map_id = store.add_datamap("mixed", DataMap::from_value(&map_doc).unwrap());
    let meter = store.add_file("meter.csv", "tests/fixtures/meter.csv");
    let weather = store.add_file("weather.csv", "tests/fixtures/weather.csv");
    Fixture {
        store,
        map_doc,
        map_id,
        meter,
        weather,
    }
}

fn request(body: Json) -> PreviewRequest {
    serde_json::from_value(body).unwrap()
}

fn expected_rows() -> Json {
    json!([
        ["2012-02-01T00:00:00+00:00", 108.52, null],
        ["2012-02-01T00:30:00+00:00", null, 45.67],
        ["2012-02-01T01:00:00+00:00", 111.86, null],
        ["2012-02-01T01:30:00+00:00", null, 46.18],
        ["2012-02-01T02:00:00+00:00", 113.87, null],
        ["2012-02-01T02:30:00+00:00", null, 47.08],
        ["2012-02-01T03:00:00+00:00", 114.24, null],
        ["2012-02-01T03:30:00+00:00", null, 47.08],
        ["2012-02-01T04:00:00+00:00", 139.99, null],
        ["2012-02-01T04:30:00+00:00", null, 47.61],
        ["2012-02-01T05:00:00+00:00", 145.86, null],
        ["2012-02-01T05:30:00+00:00", null, 47.91],
        ["2012-02-01T06:00:00+00:00", 153.62, null],
        ["2012-02-01T06:30:00+00:00", null, 48.23],
        ["2012-02-01T07:00:00+00:00", 167.61, null],
        ["2012-02-01T07:30:00+00:00", null, 48.45],
        ["2012-02-01T08:00:00+00:00", 187.12, null],
        ["2012-02-01T08:30:00+00:00", null, 49.47],
        ["2012-02-01T09:00:00+00:00", 204.19, null],
        ["2012-02-01T09:30:00+00:00", null, 50.78]
    ])
}

#[test]
fn every_map_and_file_shape_gives_the_same_preview() {
    let fx = fixture();
    let settings = Settings::default();
    let expected = json!({
        "cols": ["time", "Test/WholeBuildingPower", "Test/OutdoorAirTemperature"],
        "rows": expected_rows(),
    });

    let bodies = [
        json!({"map": fx.map_id, "rows": 20, "files": [{"name": "0", "file": fx.meter}, {"name": "1", "file": fx.weather}]}),
        json!({"map": {"id": fx.map_id}, "rows": 20, "files": [{"name": "0", "file": fx.meter}, {"name": "1", "file": fx.weather}]}),
        json!({"map": fx.map_doc.clone(), "rows": 20, "files": [{"name": "0", "file": fx.meter}, {"name": "1", "file": fx.weather}]}),
        json!({"map": fx.map_doc.clone(), "rows": 20, "files": {"0": fx.meter, "1": fx.weather}}),
    ];
    for body in bodies {
        let result = preview(&fx.store, &settings, &request(body)).unwrap();
        assert_eq!(serde_json::to_value(&result).unwrap(), expected);
    }
}

#[test]
fn row_counts_follow_the_request_and_settings() {
    let fx = fixture();
    let settings = Settings {
        head_rows_default: 4,
        head_rows_max: 6,
        ..Settings::default()
    };
    let files = json!({"0": fx.meter, "1": fx.weather});
    let rows = expected_rows();

    let ten = preview(&fx.store, &settings, &request(json!({"map": fx.map_id, "rows": 10, "files": files}))).unwrap();
    assert_eq!(ten.rows.len(), 6);
    assert!(ten.extra_rows.is_empty());

    let default = preview(&fx.store, &settings, &request(json!({"map": fx.map_id, "files": files}))).unwrap();
    assert_eq!(default.rows.len(), 4);
    assert_eq!(json!(default.rows), json!(rows.as_array().unwrap()[..4]));

    let zero = preview(&fx.store, &settings, &request(json!({"map": fx.map_id, "rows": 0, "files": files}))).unwrap();
    assert!(zero.rows.is_empty());
    assert_eq!(json!(zero.extra_rows), json!(rows.as_array().unwrap()[..2]));

    let one = preview(&fx.store, &settings, &request(json!({"map": fx.map_id, "rows": 1, "files": files}))).unwrap();
    assert_eq!(json!(one.rows), json!(rows.as_array().unwrap()[..1]));
    assert_eq!(json!(one.extra_rows), json!(rows.as_array().unwrap()[1..2]));
}

#[test]
fn unknown_datamap_id_is_not_found() {
    let fx = fixture();
    let body = json!({"map": 2000, "files": {"0": fx.meter}});
    match preview(&fx.store, &Settings::default(), &request(body)) {
        Err(IngestionError::NotFound { kind, id }) => assert_eq!((kind, id), ("datamap", 2000)),
        other => panic!("expected not found, got {other:?}"),
    }
}

#[test]
fn invalid_inline_datamap_names_the_missing_property() {
    let fx = fixture();
    let body = json!({"map": {"extra": {"bad": "robot"}}, "files": {"0": fx.meter}});
    match preview(&fx.store, &Settings::default(), &request(body)) {
        Err(IngestionError::Validation(errors)) => assert_eq!(
            serde_json::to_value(&errors).unwrap(),
            json!({"map": ["'version' is a required property"]})
        ),
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test]
fn unknown_file_id_is_a_files_error() {
    let fx = fixture();
    let body = json!({"map": fx.map_id, "files": {"0": 2000, "1": fx.weather}});
    match preview(&fx.store, &Settings::default(), &request(body)) {
        Err(IngestionError::Validation(errors)) => {
            assert_eq!(errors.get("files"), Some(&["file '0': invalid file id 2000".to_string()][..]));
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test]
fn previews_only_include_sensors_of_bound_files() {
    let fx = fixture();
    let body = json!({"map": fx.map_id, "rows": 3, "files": {"1": fx.weather}});
    let result = preview(&fx.store, &Settings::default(), &request(body)).unwrap();
    assert_eq!(result.cols, vec!["time", "Test/OutdoorAirTemperature"]);
    assert_eq!(result.rows[0], vec![json!("2012-02-01T00:30:00+00:00"), json!(45.67)]);
}
