//! Output Sinks
//!
//! Where a client's per-window output table goes. The sink is chosen once
//! from config (`output_type`) and owned by the client runtime.
//!
//! # Destinations
//!
//! - `redis`: `LPUSH outputs|<YYYY-MM-DD_HH:MM>|<client> <json records>`
//! - `parquet`: append to `<output_dir>/outputs_<client>_<region>.parquet`
//! - `json`: `<output_dir>/outputs_<YYYYMMDDTHHMM>_<client>.json`
//!
//! Unknown output types fall back to `json`.

use crate::dispatch::error::TransportError;
use crate::dispatch::table::{Table, Value, TEMPORAL_COLUMNS};
use crate::dispatch::window::{COMPACT_FORMAT, KEY_FORMAT};
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use redis::{Commands, Connection};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Destination for client output tables.
pub trait OutputSink: Send {
    /// Persist or publish `table` produced by `client` for the window
    /// starting at `window_start`.
    fn push(
        &mut self,
        window_start: NaiveDateTime,
        client: &str,
        table: &Table,
    ) -> Result<(), TransportError>;

    fn name(&self) -> &str;
}

/// Redis list key for one window's output.
pub fn output_key(window_start: NaiveDateTime, client: &str) -> String {
    format!("outputs|{}|{}", window_start.format(KEY_FORMAT), client)
}

// =============================================================================
// REDIS
// =============================================================================

/// LPUSHes JSON records under [`output_key`]. Connects lazily and reconnects
/// after a failed command.
pub struct RedisSink {
    client: redis::Client,
    conn: Option<Connection>,
}

impl RedisSink {
    pub fn new(redis_url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, conn: None })
    }

    fn connection(&mut self) -> Result<&mut Connection, TransportError> {
        if self.conn.is_none() {
            let conn = self.client.get_connection()?;
            debug!("Redis sink connected");
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "redis connection unavailable",
                ))
            })
    }
}

impl OutputSink for RedisSink {
    fn push(
        &mut self,
        window_start: NaiveDateTime,
        client: &str,
        table: &Table,
    ) -> Result<(), TransportError> {
        let key = output_key(window_start, client);
        let payload = serde_json::to_string(&table.to_records())?;
        let result: Result<(), redis::RedisError> = self.connection()?.lpush(&key, payload);
        if let Err(e) = result {
            self.conn = None;
            return Err(e.into());
        }
        info!(key = %key, rows = table.len(), "Pushed output to Redis");
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }
}

// =============================================================================
// JSON
// =============================================================================

/// One JSON file of row records per window and client.
pub struct JsonSink {
    output_dir: PathBuf,
}

impl JsonSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn path_for(&self, window_start: NaiveDateTime, client: &str) -> PathBuf {
        self.output_dir.join(format!(
            "outputs_{}_{}.json",
            window_start.format(COMPACT_FORMAT),
            client
        ))
    }
}

impl OutputSink for JsonSink {
    fn push(
        &mut self,
        window_start: NaiveDateTime,
        client: &str,
        table: &Table,
    ) -> Result<(), TransportError> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.path_for(window_start, client);
        let body = serde_json::to_vec_pretty(&table.to_records())?;
        fs::write(&path, body)?;
        info!(path = %path.display(), rows = table.len(), "Saved output to JSON");
        Ok(())
    }

    fn name(&self) -> &str {
        "json"
    }
}

// =============================================================================
// PARQUET
// =============================================================================

/// Appends every window's output for one client and region to a single
/// parquet file. The file is rewritten through a uniquely named temp file
/// and renamed into place, so readers never observe a partial write.
///
/// Sinks in one process share a [`ParquetStore`], which serializes appends
/// per target file. Parallel replay builds one sink per job, all aimed at the
/// same file.
pub struct ParquetSink {
    output_dir: PathBuf,
    region: String,
    store: ParquetStore,
}

impl ParquetSink {
    pub fn new(output_dir: impl Into<PathBuf>, region: impl Into<String>) -> Self {
        Self::with_store(output_dir, region, ParquetStore::global())
    }

    pub fn with_store(
        output_dir: impl Into<PathBuf>,
        region: impl Into<String>,
        store: ParquetStore,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            region: region.into(),
            store,
        }
    }

    pub fn path_for(&self, client: &str) -> PathBuf {
        self.output_dir
            .join(format!("outputs_{}_{}.parquet", client, self.region))
    }
}

impl OutputSink for ParquetSink {
    fn push(
        &mut self,
        _window_start: NaiveDateTime,
        client: &str,
        table: &Table,
    ) -> Result<(), TransportError> {
        if table.columns().is_empty() {
            debug!(client, "Empty output, nothing to append");
            return Ok(());
        }
        fs::create_dir_all(&self.output_dir)?;
        let path = self.path_for(client);
        let total_rows = self.store.append(&path, table)?;
        info!(
            path = %path.display(),
            rows = table.len(),
            total_rows,
            "Appended output to parquet"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "parquet"
    }
}

type FileSlot = Arc<Mutex<Option<Table>>>;

/// Append state for every parquet file this process writes. Each file has
/// its own lock and keeps its combined rows in memory after the first
/// append, so later appends skip re-reading and decoding the file.
#[derive(Clone, Default)]
pub struct ParquetStore {
    files: Arc<Mutex<HashMap<PathBuf, FileSlot>>>,
}

impl ParquetStore {
    /// Process-wide store used by [`ParquetSink::new`].
    pub fn global() -> Self {
        static GLOBAL: OnceLock<ParquetStore> = OnceLock::new();
        GLOBAL.get_or_init(ParquetStore::default).clone()
    }

    fn slot(&self, path: &Path) -> FileSlot {
        self.files
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Append `table` to the file at `path`, holding that file's lock for the
    /// whole read-append-write. Returns the file's total row count.
    pub fn append(&self, path: &Path, table: &Table) -> Result<usize, TransportError> {
        let slot = self.slot(path);
        let mut cached = slot.lock();

        // removed behind our back: start over
        if !path.exists() {
            *cached = None;
        }
        let mut combined = match cached.take() {
            Some(rows) => rows,
            None if path.exists() => read_parquet(path)?,
            None => Table::default(),
        };
        combined.append(table.clone());

        // on failure the slot stays empty and the next append re-reads disk
        write_parquet(path, &combined)?;
        let total = combined.len();
        *cached = Some(combined);
        Ok(total)
    }
}

/// Arrow type for a column: all-bool, all-int, numeric, else string.
fn column_type(table: &Table, idx: usize) -> DataType {
    let mut ty: Option<DataType> = None;
    for row in table.rows() {
        let cell = match &row[idx] {
            Value::Null => continue,
            Value::Bool(_) => DataType::Boolean,
            Value::Int(_) => DataType::Int64,
            Value::Float(_) => DataType::Float64,
            _ => return DataType::Utf8,
        };
        ty = Some(match (ty, cell) {
            (None, c) => c,
            (Some(a), b) if a == b => a,
            (Some(DataType::Int64), DataType::Float64) | (Some(DataType::Float64), DataType::Int64) => {
                DataType::Float64
            }
            _ => return DataType::Utf8,
        });
    }
    ty.unwrap_or(DataType::Utf8)
}

/// Convert a table to a single record batch. Temporal cells are stored as
/// ISO-8601 strings.
pub fn table_to_batch(table: &Table) -> Result<RecordBatch, TransportError> {
    let mut fields = Vec::with_capacity(table.columns().len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.columns().len());

    for (idx, name) in table.columns().iter().enumerate() {
        let ty = column_type(table, idx);
        let cells = table.rows().iter().map(|r| &r[idx]);
        let array: ArrayRef = match ty {
            DataType::Boolean => Arc::new(BooleanArray::from(
                cells.map(Value::as_bool).collect::<Vec<_>>(),
            )),
            DataType::Int64 => Arc::new(Int64Array::from(
                cells.map(Value::as_i64).collect::<Vec<_>>(),
            )),
            DataType::Float64 => Arc::new(Float64Array::from(
                cells.map(Value::as_f64).collect::<Vec<_>>(),
            )),
            _ => Arc::new(StringArray::from(
                cells
                    .map(|v| if v.is_null() { None } else { Some(v.to_string()) })
                    .collect::<Vec<Option<String>>>(),
            )),
        };
        fields.push(Field::new(name.as_str(), ty, true));
        arrays.push(array);
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

/// Read every batch of a parquet file back into one table.
pub fn read_parquet(path: &Path) -> Result<Table, TransportError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = builder.build()?;

    let mut table = Table::default();
    for batch in reader {
        let batch = batch?;
        table.append(batch_to_table(&batch));
    }
    Ok(table)
}

fn batch_to_table(batch: &RecordBatch) -> Table {
    let schema = batch.schema();
    let names: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
    let mut table = Table::new(names.clone());

    for row in 0..batch.num_rows() {
        let values = names
            .iter()
            .enumerate()
            .map(|(col, name)| cell_at(batch.column(col), row, name))
            .collect();
        table.push_row(values);
    }
    table
}

fn cell_at(array: &ArrayRef, row: usize, column: &str) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    let any = array.as_any();
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        Value::Int(a.value(row))
    } else if let Some(a) = any.downcast_ref::<Float64Array>() {
        Value::Float(a.value(row))
    } else if let Some(a) = any.downcast_ref::<BooleanArray>() {
        Value::Bool(a.value(row))
    } else if let Some(a) = any.downcast_ref::<StringArray>() {
        let raw = a.value(row);
        if TEMPORAL_COLUMNS.contains(&column) {
            Value::temporal(column, raw)
        } else {
            Value::Str(raw.to_string())
        }
    } else {
        warn!(column, data_type = ?array.data_type(), "Unsupported parquet column type, reading as null");
        Value::Null
    }
}

/// Write `table` to `path` atomically (temp file + rename). The temp name is
/// unique per call.
pub fn write_parquet(path: &Path, table: &Table) -> Result<(), TransportError> {
    let batch = table_to_batch(table)?;
    let tmp_path = path.with_extension(format!("parquet.{}.tmp", Uuid::new_v4().simple()));
    let result = write_batch(&tmp_path, &batch)
        .and_then(|()| fs::rename(&tmp_path, path).map_err(TransportError::from));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<(), TransportError> {
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

// =============================================================================
// MEMORY
// =============================================================================

/// One captured push.
#[derive(Debug, Clone)]
pub struct PushedOutput {
    pub window_start: NaiveDateTime,
    pub client: String,
    pub table: Table,
}

/// Keeps every push in a shared buffer. Clones share the buffer, so a test
/// or an in-process consumer can hold one handle while a runtime owns another.
#[derive(Clone, Default)]
pub struct MemorySink {
    pushed: Arc<Mutex<Vec<PushedOutput>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<PushedOutput> {
        self.pushed.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.pushed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pushed.lock().is_empty()
    }
}

impl OutputSink for MemorySink {
    fn push(
        &mut self,
        window_start: NaiveDateTime,
        client: &str,
        table: &Table,
    ) -> Result<(), TransportError> {
        self.pushed.lock().push(PushedOutput {
            window_start,
            client: client.to_string(),
            table: table.clone(),
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// Output destinations selectable from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Redis,
    Parquet,
    Json,
}

impl OutputType {
    /// Case-insensitive; anything unrecognized falls back to `Json`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "redis" => Self::Redis,
            "parquet" => Self::Parquet,
            "json" => Self::Json,
            other => {
                warn!(output_type = other, "Unknown output type, falling back to json");
                Self::Json
            }
        }
    }
}

/// Build the sink for a runtime.
pub fn make_sink(
    output_type: OutputType,
    redis_url: &str,
    output_dir: &Path,
    region: &str,
) -> Result<Box<dyn OutputSink>, TransportError> {
    Ok(match output_type {
        OutputType::Redis => Box::new(RedisSink::new(redis_url)?),
        OutputType::Parquet => Box::new(ParquetSink::new(output_dir, region)),
        OutputType::Json => Box::new(JsonSink::new(output_dir)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 10, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn signals(rows: &[(&str, i64, f64)]) -> Table {
        let mut t = Table::new(["datetime", "instrument_id", "value1", "signal"]);
        for (id, v, s) in rows {
            t.push_row(vec![
                Value::Timestamp(start()),
                Value::from(*id),
                Value::Int(*v),
                Value::Float(*s),
            ]);
        }
        t
    }

    #[test]
    fn test_output_key_format() {
        assert_eq!(output_key(start(), "signal_scaler"), "outputs|2023-10-02_09:30|signal_scaler");
    }

    #[test]
    fn test_json_sink_writes_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonSink::new(dir.path());
        sink.push(start(), "c1", &signals(&[("AAA", 1, 2.0)])).unwrap();

        let path = dir.path().join("outputs_20231002T0930_c1.json");
        let body: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(body[0]["instrument_id"], "AAA");
        assert_eq!(body[0]["datetime"], "2023-10-02T09:30:00");
    }

    #[test]
    fn test_parquet_sink_appends_across_windows() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ParquetSink::new(dir.path(), "US");
        sink.push(start(), "c1", &signals(&[("AAA", 1, 2.0), ("BBB", 3, 6.0)]))
            .unwrap();
        sink.push(start(), "c1", &signals(&[("CCC", 10, 20.0)])).unwrap();

        let path = dir.path().join("outputs_c1_US.parquet");
        let table = read_parquet(&path).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.value(2, "instrument_id").unwrap().as_str(), Some("CCC"));
        assert_eq!(table.value(1, "signal").unwrap().as_f64(), Some(6.0));
        assert_eq!(table.value(0, "datetime").unwrap().as_timestamp(), Some(start()));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1, "temp file left behind");
    }

    #[test]
    fn test_parquet_sinks_on_many_threads_keep_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::default();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let dir = dir.path().to_path_buf();
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        // fresh sink per push, as parallel replay does per job
                        let mut sink = ParquetSink::with_store(&dir, "US", store.clone());
                        let id = format!("T{}-{}", t, i);
                        sink.push(start(), "c1", &signals(&[(id.as_str(), i, 1.0)]))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let table = read_parquet(&dir.path().join("outputs_c1_US.parquet")).unwrap();
        assert_eq!(table.len(), 80);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_parquet_store_restarts_when_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ParquetSink::with_store(dir.path(), "US", ParquetStore::default());
        sink.push(start(), "c1", &signals(&[("AAA", 1, 2.0)])).unwrap();
        fs::remove_file(sink.path_for("c1")).unwrap();

        sink.push(start(), "c1", &signals(&[("BBB", 2, 4.0)])).unwrap();
        let table = read_parquet(&sink.path_for("c1")).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.value(0, "instrument_id").unwrap().as_str(), Some("BBB"));
    }

    #[test]
    fn test_parquet_append_widens_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ParquetSink::new(dir.path(), "EU");
        sink.push(start(), "c2", &signals(&[("AAA", 1, 2.0)])).unwrap();

        let mut extra = signals(&[("BBB", 2, 4.0)]);
        extra.set_column("above_threshold", vec![Value::Bool(true)]);
        sink.push(start(), "c2", &extra).unwrap();

        let table = read_parquet(&sink.path_for("c2")).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.value(0, "above_threshold"), Some(&Value::Null));
        assert_eq!(table.value(1, "above_threshold"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_memory_sink_clones_share_buffer() {
        let sink = MemorySink::new();
        let mut handle: Box<dyn OutputSink> = Box::new(sink.clone());
        handle.push(start(), "c1", &signals(&[])).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.outputs()[0].client, "c1");
    }

    #[test]
    fn test_output_type_fallback() {
        assert_eq!(OutputType::parse_lenient("Parquet"), OutputType::Parquet);
        assert_eq!(OutputType::parse_lenient("csv"), OutputType::Json);
    }
}
