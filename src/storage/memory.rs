use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::datamap::DataMap;
use crate::types::{DataMapId, DataType, FileId, IngestId, Sample, SensorId, Value};

use super::{
    DataMapRecord, Sensor, SensorIngest, SensorIngestFile, SensorIngestLog, SensorStore,
    SeriesPage, SeriesPosition, StoreError, StoreTransaction, TypedSensorDatum, UploadedFile,
};

type Partition<T> = BTreeMap<(SensorId, DateTime<Utc>, IngestId), T>;

/// Value tables partitioned by sensor type.
#[derive(Debug, Default)]
struct Tables {
    boolean: Partition<bool>,
    integer: Partition<i64>,
    float: Partition<f64>,
    string: Partition<String>,
    datetime: Partition<DateTime<Utc>>,
}

impl Tables {
    fn insert(&mut self, datum: TypedSensorDatum) {
        let key = (datum.sensor, datum.time, datum.ingest);
        match datum.value {
            Value::Bool(v) => {
                self.boolean.insert(key, v);
            }
            Value::Integer(v) => {
                self.integer.insert(key, v);
            }
            Value::Float(v) => {
                self.float.insert(key, v);
            }
            Value::String(v) => {
                self.string.insert(key, v);
            }
            Value::DateTime(v) => {
                self.datetime.insert(key, v);
            }
            Value::Null => {}
        }
    }

    fn page(
        &self,
        sensor: &Sensor,
        ingests: &HashSet<IngestId>,
        after: Option<SeriesPosition>,
        limit: usize,
    ) -> SeriesPage {
        let id = sensor.id;
        match sensor.data_type {
            DataType::Boolean => scan(&self.boolean, id, ingests, after, limit, |v| Value::Bool(*v)),
            DataType::Integer => scan(&self.integer, id, ingests, after, limit, |v| Value::Integer(*v)),
            DataType::Float => scan(&self.float, id, ingests, after, limit, |v| Value::Float(*v)),
            DataType::String => scan(&self.string, id, ingests, after, limit, |v| Value::String(v.clone())),
            DataType::Datetime => scan(&self.datetime, id, ingests, after, limit, |v| Value::DateTime(*v)),
        }
    }
}

fn scan<T>(
    partition: &Partition<T>,
    sensor: SensorId,
    ingests: &HashSet<IngestId>,
    after: Option<SeriesPosition>,
    limit: usize,
    to_value: impl Fn(&T) -> Value,
) -> SeriesPage {
    let lower = match after {
        Some(pos) => Bound::Excluded((sensor, pos.time, pos.ingest)),
        None => Bound::Included((sensor, DateTime::<Utc>::MIN_UTC, 0)),
    };
    let upper = Bound::Included((sensor, DateTime::<Utc>::MAX_UTC, IngestId::MAX));
    let limit = limit.max(1);

    let mut page = SeriesPage::default();
    let mut last = None;
    for ((_, time, ingest), v) in partition.range((lower, upper)) {
        if !ingests.contains(ingest) {
            continue;
        }
        if page.samples.len() == limit {
            page.next = last;
            break;
        }
        page.samples.push(Sample::new(*time, to_value(v)));
        last = Some(SeriesPosition {
            time: *time,
            ingest: *ingest,
        });
    }
    page
}

#[derive(Debug, Default)]
struct State {
    datamaps: BTreeMap<DataMapId, DataMapRecord>,
    files: BTreeMap<FileId, UploadedFile>,
    sensors: BTreeMap<SensorId, Sensor>,
    ingests: BTreeMap<IngestId, SensorIngest>,
    logs: BTreeMap<IngestId, Vec<SensorIngestLog>>,
    tables: Tables,
}

impl State {
    fn sensor_named(&self, map_id: DataMapId, name: &str) -> Option<&Sensor> {
        self.sensors
            .values()
            .find(|s| s.map_id == map_id && s.name == name)
    }

    fn has_sensor(&self, map_id: DataMapId, name: &str) -> bool {
        self.sensor_named(map_id, name).is_some()
    }
}

/// In-process [`SensorStore`].
///
/// Committed data lives behind one `RwLock`; a transaction stages its writes privately and
/// applies them under a single write lock on commit.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<State>,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a datamap and return its id.
    pub fn add_datamap(&self, name: impl Into<String>, map: DataMap) -> DataMapId {
        let id = self.allocate_id();
        let record = DataMapRecord {
            id,
            name: name.into(),
            map,
        };
        self.write().datamaps.insert(id, record);
        id
    }

    /// Register an uploaded file and return its id.
    pub fn add_file(&self, name: impl Into<String>, path: impl Into<PathBuf>) -> FileId {
        let id = self.allocate_id();
        let file = UploadedFile {
            id,
            name: name.into(),
            path: path.into(),
        };
        self.write().files.insert(id, file);
        id
    }

    /// Declare a sensor ahead of any ingest run.
    pub fn add_sensor(
        &self,
        map_id: DataMapId,
        name: &str,
        data_type: DataType,
        unit: Option<&str>,
    ) -> Result<Sensor, StoreError> {
        let mut state = self.write();
        if !state.datamaps.contains_key(&map_id) {
            return Err(StoreError::Missing {
                kind: "datamap",
                id: map_id,
            });
        }
        if state.has_sensor(map_id, name) {
            return Err(StoreError::DuplicateSensor {
                map_id,
                name: name.to_owned(),
            });
        }
        let sensor = Sensor {
            id: self.allocate_id(),
            map_id,
            name: name.to_owned(),
            data_type,
            unit: unit.map(str::to_owned),
        };
        state.sensors.insert(sensor.id, sensor.clone());
        Ok(sensor)
    }
}

impl SensorStore for MemoryStore {
    fn datamap(&self, id: DataMapId) -> Result<Option<DataMapRecord>, StoreError> {
        Ok(self.read().datamaps.get(&id).cloned())
    }

    fn file(&self, id: FileId) -> Result<Option<UploadedFile>, StoreError> {
        Ok(self.read().files.get(&id).cloned())
    }

    fn sensors(&self, map_id: DataMapId) -> Result<Vec<Sensor>, StoreError> {
        Ok(self
            .read()
            .sensors
            .values()
            .filter(|s| s.map_id == map_id)
            .cloned()
            .collect())
    }

    fn create_ingest(
        &self,
        map_id: DataMapId,
        files: Vec<SensorIngestFile>,
    ) -> Result<SensorIngest, StoreError> {
        let mut state = self.write();
        if !state.datamaps.contains_key(&map_id) {
            return Err(StoreError::Missing {
                kind: "datamap",
                id: map_id,
            });
        }
        let ingest = SensorIngest {
            id: self.allocate_id(),
            map_id,
            start: Utc::now(),
            end: None,
            files,
            error: None,
        };
        state.ingests.insert(ingest.id, ingest.clone());
        Ok(ingest)
    }

    fn ingest(&self, id: IngestId) -> Result<Option<SensorIngest>, StoreError> {
        Ok(self.read().ingests.get(&id).cloned())
    }

    fn ingests(&self, map_id: DataMapId) -> Result<Vec<SensorIngest>, StoreError> {
        Ok(self
            .read()
            .ingests
            .values()
            .filter(|i| i.map_id == map_id)
            .cloned()
            .collect())
    }

    fn fail_ingest(&self, id: IngestId, message: &str) -> Result<(), StoreError> {
        let mut state = self.write();
        let record = state
            .ingests
            .get_mut(&id)
            .ok_or(StoreError::Missing { kind: "ingest", id })?;
        if record.is_complete() {
            return Err(StoreError::AlreadyComplete(id));
        }
        record.error = Some(message.to_owned());
        Ok(())
    }

    fn begin(&self, ingest: IngestId) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        match self.read().ingests.get(&ingest) {
            None => {
                return Err(StoreError::Missing {
                    kind: "ingest",
                    id: ingest,
                });
            }
            Some(record) if record.is_complete() => return Err(StoreError::AlreadyComplete(ingest)),
            Some(_) => {}
        }
        Ok(Box::new(MemoryTransaction {
            store: self,
            ingest,
            sensors: Vec::new(),
            data: Vec::new(),
            logs: Vec::new(),
        }))
    }

    fn series(&self, sensor: SensorId, ingests: &[IngestId]) -> Result<Vec<Sample>, StoreError> {
        let state = self.read();
        let record = state.sensors.get(&sensor).ok_or(StoreError::Missing {
            kind: "sensor",
            id: sensor,
        })?;
        let ingests: HashSet<IngestId> = ingests.iter().copied().collect();
        Ok(state.tables.page(record, &ingests, None, usize::MAX).samples)
    }

    fn series_page(
        &self,
        sensor: SensorId,
        ingests: &[IngestId],
        after: Option<SeriesPosition>,
        limit: usize,
    ) -> Result<SeriesPage, StoreError> {
        let state = self.read();
        let record = state.sensors.get(&sensor).ok_or(StoreError::Missing {
            kind: "sensor",
            id: sensor,
        })?;
        let ingests: HashSet<IngestId> = ingests.iter().copied().collect();
        Ok(state.tables.page(record, &ingests, after, limit))
    }

    fn logs(&self, ingest: IngestId) -> Result<Vec<SensorIngestLog>, StoreError> {
        Ok(self.read().logs.get(&ingest).cloned().unwrap_or_default())
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    ingest: IngestId,
    sensors: Vec<Sensor>,
    data: Vec<TypedSensorDatum>,
    logs: Vec<SensorIngestLog>,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn ensure_sensor(
        &mut self,
        map_id: DataMapId,
        name: &str,
        data_type: DataType,
        unit: Option<&str>,
    ) -> Result<Sensor, StoreError> {
        let known = self
            .sensors
            .iter()
            .find(|s| s.map_id == map_id && s.name == name)
            .cloned()
            .or_else(|| self.store.read().sensor_named(map_id, name).cloned());
        if let Some(sensor) = known {
            return same_type(sensor, data_type);
        }
        let sensor = Sensor {
            id: self.store.allocate_id(),
            map_id,
            name: name.to_owned(),
            data_type,
            unit: unit.map(str::to_owned),
        };
        self.sensors.push(sensor.clone());
        Ok(sensor)
    }

    fn insert_datum(
        &mut self,
        sensor: &Sensor,
        time: DateTime<Utc>,
        value: Value,
    ) -> Result<(), StoreError> {
        let found = match (&value, sensor.data_type) {
            (Value::Bool(_), DataType::Boolean)
            | (Value::Integer(_), DataType::Integer)
            | (Value::Float(_), DataType::Float)
            | (Value::String(_), DataType::String)
            | (Value::DateTime(_), DataType::Datetime) => None,
            (Value::Null, _) => Some("null"),
            (Value::Bool(_), _) => Some("boolean"),
            (Value::Integer(_), _) => Some("integer"),
            (Value::Float(_), _) => Some("float"),
            (Value::String(_), _) => Some("string"),
            (Value::DateTime(_), _) => Some("datetime"),
        };
        if let Some(found) = found {
            return Err(StoreError::TypeMismatch {
                sensor: sensor.id,
                expected: sensor.data_type,
                found,
            });
        }
        self.data.push(TypedSensorDatum {
            sensor: sensor.id,
            ingest: self.ingest,
            time,
            value,
        });
        Ok(())
    }

    fn insert_log(&mut self, log: SensorIngestLog) -> Result<(), StoreError> {
        self.logs.push(log);
        Ok(())
    }

    fn commit(self: Box<Self>, end: DateTime<Utc>) -> Result<(), StoreError> {
        let MemoryTransaction {
            store,
            ingest,
            sensors,
            data,
            logs,
        } = *self;
        let mut guard = store.write();
        let state = &mut *guard;
        match state.ingests.get(&ingest) {
            None => {
                return Err(StoreError::Missing {
                    kind: "ingest",
                    id: ingest,
                });
            }
            Some(record) if record.is_complete() => return Err(StoreError::AlreadyComplete(ingest)),
            Some(_) => {}
        }

        // Sensors another run committed since they were staged here take over their staged ids.
        let mut adopted: HashMap<SensorId, SensorId> = HashMap::new();
        let mut fresh = Vec::with_capacity(sensors.len());
        for sensor in sensors {
            match state.sensor_named(sensor.map_id, &sensor.name) {
                Some(committed) => {
                    let committed = same_type(committed.clone(), sensor.data_type)?;
                    adopted.insert(sensor.id, committed.id);
                }
                None => fresh.push(sensor),
            }
        }

        if let Some(record) = state.ingests.get_mut(&ingest) {
            record.end = Some(end);
        }
        for sensor in fresh {
            state.sensors.insert(sensor.id, sensor);
        }
        for mut datum in data {
            if let Some(&id) = adopted.get(&datum.sensor) {
                datum.sensor = id;
            }
            state.tables.insert(datum);
        }
        state.logs.entry(ingest).or_default().extend(logs);
        Ok(())
    }
}

fn same_type(sensor: Sensor, requested: DataType) -> Result<Sensor, StoreError> {
    if sensor.data_type == requested {
        return Ok(sensor);
    }
    Err(StoreError::SensorTypeConflict {
        map_id: sensor.map_id,
        name: sensor.name,
        stored: sensor.data_type,
        requested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn map() -> DataMap {
        DataMap::from_value(&serde_json::json!({
            "version": 1,
            "sensors": {"kw": {"type": "float", "column": 1, "file": "0"}},
            "files": {"0": {"signature": {"headers": ["Date", "kW"]}, "timestamp": {"columns": [0]}}}
        }))
        .unwrap()
    }

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 2, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let map_id = store.add_datamap("m", map());
        let ingest = store.create_ingest(map_id, Vec::new()).unwrap();
        {
            let mut tx = store.begin(ingest.id).unwrap();
            let s = tx.ensure_sensor(map_id, "kw", DataType::Float, None).unwrap();
            tx.insert_datum(&s, t(0), Value::Float(1.0)).unwrap();
        }
        assert!(store.sensors(map_id).unwrap().is_empty());
        assert!(store.ingest(ingest.id).unwrap().unwrap().end.is_none());
    }

    #[test]
    fn commit_publishes_data_and_sets_end() {
        let store = MemoryStore::new();
        let map_id = store.add_datamap("m", map());
        let ingest = store.create_ingest(map_id, Vec::new()).unwrap();
        let mut tx = store.begin(ingest.id).unwrap();
        let s = tx.ensure_sensor(map_id, "kw", DataType::Float, Some("kilowatt")).unwrap();
        tx.insert_datum(&s, t(1), Value::Float(2.0)).unwrap();
        tx.insert_datum(&s, t(0), Value::Float(1.0)).unwrap();
        tx.commit(t(5)).unwrap();

        let sensors = store.sensors(map_id).unwrap();
        assert_eq!(sensors.len(), 1);
        let series = store.series(sensors[0].id, &[ingest.id]).unwrap();
        assert_eq!(
            series,
            vec![Sample::new(t(0), Value::Float(1.0)), Sample::new(t(1), Value::Float(2.0))]
        );
        assert_eq!(store.ingest(ingest.id).unwrap().unwrap().end, Some(t(5)));
        assert!(matches!(store.begin(ingest.id), Err(StoreError::AlreadyComplete(_))));
    }

    #[test]
    fn values_must_match_the_sensor_type() {
        let store = MemoryStore::new();
        let map_id = store.add_datamap("m", map());
        let sensor = store.add_sensor(map_id, "kw", DataType::Float, None).unwrap();
        let ingest = store.create_ingest(map_id, Vec::new()).unwrap();
        let mut tx = store.begin(ingest.id).unwrap();
        let err = tx.insert_datum(&sensor, t(0), Value::Integer(3)).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { found: "integer", .. }));
    }

    #[test]
    fn duplicate_timestamps_across_ingests_are_ordered_by_ingest() {
        let store = MemoryStore::new();
        let map_id = store.add_datamap("m", map());
        let sensor = store.add_sensor(map_id, "kw", DataType::Float, None).unwrap();
        let mut ids = Vec::new();
        for v in [1.0, 2.0] {
            let ingest = store.create_ingest(map_id, Vec::new()).unwrap();
            let mut tx = store.begin(ingest.id).unwrap();
            tx.insert_datum(&sensor, t(0), Value::Float(v)).unwrap();
            tx.commit(t(1)).unwrap();
            ids.push(ingest.id);
        }
        let series = store.series(sensor.id, &ids).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].value, Value::Float(1.0));
        assert_eq!(series[1].value, Value::Float(2.0));
        assert_eq!(store.series(sensor.id, &ids[..1]).unwrap().len(), 1);
    }

    #[test]
    fn overlapping_transactions_share_one_sensor() {
        let store = MemoryStore::new();
        let map_id = store.add_datamap("m", map());
        let a = store.create_ingest(map_id, Vec::new()).unwrap();
        let b = store.create_ingest(map_id, Vec::new()).unwrap();

        let mut tx_a = store.begin(a.id).unwrap();
        let mut tx_b = store.begin(b.id).unwrap();
        let sa = tx_a.ensure_sensor(map_id, "kw", DataType::Float, None).unwrap();
        let sb = tx_b.ensure_sensor(map_id, "kw", DataType::Float, None).unwrap();
        assert_ne!(sa.id, sb.id);
        tx_a.insert_datum(&sa, t(0), Value::Float(1.0)).unwrap();
        tx_b.insert_datum(&sb, t(1), Value::Float(2.0)).unwrap();
        tx_b.commit(t(2)).unwrap();
        tx_a.commit(t(3)).unwrap();

        let sensors = store.sensors(map_id).unwrap();
        assert_eq!(sensors.len(), 1);
        let series = store.series(sensors[0].id, &[a.id, b.id]).unwrap();
        assert_eq!(
            series,
            vec![Sample::new(t(0), Value::Float(1.0)), Sample::new(t(1), Value::Float(2.0))]
        );
    }

    #[test]
    fn ensure_sensor_reuses_committed_sensors_and_checks_their_type() {
        let store = MemoryStore::new();
        let map_id = store.add_datamap("m", map());
        let declared = store.add_sensor(map_id, "kw", DataType::Float, None).unwrap();
        let ingest = store.create_ingest(map_id, Vec::new()).unwrap();
        let mut tx = store.begin(ingest.id).unwrap();
        assert_eq!(tx.ensure_sensor(map_id, "kw", DataType::Float, None).unwrap(), declared);
        let err = tx.ensure_sensor(map_id, "kw", DataType::Integer, None).unwrap_err();
        assert!(matches!(
            err,
            StoreError::SensorTypeConflict {
                stored: DataType::Float,
                requested: DataType::Integer,
                ..
            }
        ));
    }

    #[test]
    fn pages_resume_after_the_last_key() {
        let store = MemoryStore::new();
        let map_id = store.add_datamap("m", map());
        let sensor = store.add_sensor(map_id, "kw", DataType::Float, None).unwrap();
        let ingest = store.create_ingest(map_id, Vec::new()).unwrap();
        let mut tx = store.begin(ingest.id).unwrap();
        for h in 0..5 {
            tx.insert_datum(&sensor, t(h), Value::Float(f64::from(h))).unwrap();
        }
        tx.commit(t(6)).unwrap();

        let mut after = None;
        let mut pages = Vec::new();
        loop {
            let page = store.series_page(sensor.id, &[ingest.id], after, 2).unwrap();
            pages.push(page.samples.len());
            match page.next {
                Some(next) => after = Some(next),
                None => break,
            }
        }
        assert_eq!(pages, vec![2, 2, 1]);
        assert!(store.series_page(sensor.id, &[999], None, 2).unwrap().samples.is_empty());
    }

    #[test]
    fn failed_runs_keep_their_error() {
        let store = MemoryStore::new();
        let map_id = store.add_datamap("m", map());
        let ingest = store.create_ingest(map_id, Vec::new()).unwrap();
        store.fail_ingest(ingest.id, "disk full").unwrap();
        let record = store.ingest(ingest.id).unwrap().unwrap();
        assert!(record.is_failed());
        assert!(!record.is_complete());
        assert_eq!(record.error.as_deref(), Some("disk full"));
    }
}
