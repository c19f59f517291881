//! Window Data Sources
//!
//! A [`DataSource`] turns a [`Window`] into a [`DataSet`]. Each named source
//! is loaded independently; a source that fails is logged and left out of
//! the dataset so the window still runs with partial data.

use crate::dispatch::error::LoadError;
use crate::dispatch::table::{DataSet, Table, Value, TEMPORAL_COLUMNS, TIMESTAMP_COLUMN};
use crate::dispatch::window::Window;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Loads the named tables for one window.
pub trait DataSource: Send {
    /// Source names this loader produces, in load order.
    fn sources(&self) -> &[String];

    /// Load one source for `window`.
    fn load_source(&mut self, source: &str, window: &Window) -> Result<Table, LoadError>;

    /// Loader identifier for logging/diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }

    /// Load every source, omitting those that fail.
    fn load(&mut self, window: &Window) -> DataSet {
        let mut data = DataSet::new();
        for source in self.sources().to_vec() {
            match self.load_source(&source, window) {
                Ok(table) => {
                    debug!(loader = self.name(), source = %source, window = %window, rows = table.len(), "Loaded source");
                    data.insert(source, table);
                }
                Err(e) => {
                    warn!(loader = self.name(), window = %window, error = %e, "Source omitted from window");
                }
            }
        }
        data
    }
}

// =============================================================================
// CSV (HISTORICAL)
// =============================================================================

/// Historical flat files at `<historical_dir>/<region>/<source>.csv`.
///
/// Each file is read once and cached; windows are cut from the cached frame
/// on the `datetime` column with an exclusive end.
pub struct CsvDataSource {
    root: PathBuf,
    sources: Vec<String>,
    cache: HashMap<String, Table>,
}

impl CsvDataSource {
    pub fn new(historical_dir: impl AsRef<Path>, region: &str, sources: Vec<String>) -> Self {
        Self {
            root: historical_dir.as_ref().join(region),
            sources,
            cache: HashMap::new(),
        }
    }

    pub fn path_for(&self, source: &str) -> PathBuf {
        self.root.join(format!("{}.csv", source))
    }

    fn frame(&mut self, source: &str) -> Result<&Table, LoadError> {
        if !self.cache.contains_key(source) {
            let path = self.path_for(source);
            let table = read_csv(&path).map_err(|reason| LoadError::new(source, reason))?;
            if !table.has_column(TIMESTAMP_COLUMN) {
                return Err(LoadError::new(
                    source,
                    format!("{} has no '{}' column", path.display(), TIMESTAMP_COLUMN),
                ));
            }
            info!(source, path = %path.display(), rows = table.len(), "Cached historical source");
            self.cache.insert(source.to_string(), table);
        }
        self.cache
            .get(source)
            .ok_or_else(|| LoadError::new(source, "cache miss after insert"))
    }
}

impl DataSource for CsvDataSource {
    fn sources(&self) -> &[String] {
        &self.sources
    }

    fn load_source(&mut self, source: &str, window: &Window) -> Result<Table, LoadError> {
        let frame = self.frame(source)?;
        Ok(frame.slice_window(TIMESTAMP_COLUMN, window))
    }

    fn name(&self) -> &str {
        "csv"
    }
}

/// Read a CSV file into a table, typing temporal columns by name.
pub fn read_csv(path: &Path) -> Result<Table, String> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| format!("bad header in {}: {}", path.display(), e))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let temporal: Vec<bool> = headers
        .iter()
        .map(|h| TEMPORAL_COLUMNS.contains(&h.as_str()))
        .collect();

    let mut table = Table::new(headers.clone());
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("{} row {}: {}", path.display(), line + 1, e))?;
        let row = record
            .iter()
            .zip(headers.iter().zip(&temporal))
            .map(|(raw, (column, &is_temporal))| {
                if is_temporal {
                    Value::temporal(column, raw)
                } else {
                    Value::infer(raw)
                }
            })
            .collect();
        table.push_row(row);
    }
    Ok(table)
}

// =============================================================================
// SYNTHETIC (LIVE PLACEHOLDER)
// =============================================================================

/// Fixed three-instrument frame stamped at the window start. Stands in for a
/// real-time vendor feed during live smoke runs.
pub struct SyntheticSource {
    sources: Vec<String>,
}

const SYNTHETIC_ROWS: [(&str, i64, i64, i64); 3] = [
    ("instrid1", 1, 2, 3),
    ("instrid2", 3, 3, 2),
    ("instrid3", 10, 22, 33),
];

impl SyntheticSource {
    pub fn new(sources: Vec<String>) -> Self {
        Self { sources }
    }
}

impl DataSource for SyntheticSource {
    fn sources(&self) -> &[String] {
        &self.sources
    }

    fn load_source(&mut self, _source: &str, window: &Window) -> Result<Table, LoadError> {
        let mut table = Table::new([
            "datetime",
            "date",
            "time",
            "instrument_id",
            "value1",
            "value2",
            "value3",
        ]);
        for (instrument, v1, v2, v3) in SYNTHETIC_ROWS {
            table.push_row(vec![
                Value::Timestamp(window.start),
                Value::Date(window.date()),
                Value::Time(window.time()),
                Value::from(instrument),
                Value::Int(v1),
                Value::Int(v2),
                Value::Int(v3),
            ]);
        }
        Ok(table)
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

// =============================================================================
// MEMORY
// =============================================================================

/// Preloaded tables sliced per window. Sources registered with
/// [`MemorySource::failing`] always return a `LoadError`.
#[derive(Default, Clone)]
pub struct MemorySource {
    names: Vec<String>,
    tables: DataSet,
    failures: HashMap<String, String>,
}

impl MemorySource {
    pub fn new(tables: DataSet) -> Self {
        Self {
            names: tables.keys().cloned().collect(),
            tables,
            failures: HashMap::new(),
        }
    }

    pub fn failing(mut self, source: impl Into<String>, reason: impl Into<String>) -> Self {
        let source = source.into();
        if !self.names.contains(&source) {
            self.names.push(source.clone());
        }
        self.failures.insert(source, reason.into());
        self
    }
}

impl DataSource for MemorySource {
    fn sources(&self) -> &[String] {
        &self.names
    }

    fn load_source(&mut self, source: &str, window: &Window) -> Result<Table, LoadError> {
        if let Some(reason) = self.failures.get(source) {
            return Err(LoadError::new(source, reason.clone()));
        }
        let table = self
            .tables
            .get(source)
            .ok_or_else(|| LoadError::new(source, "no such table"))?;
        if table.has_column(TIMESTAMP_COLUMN) {
            Ok(table.slice_window(TIMESTAMP_COLUMN, window))
        } else {
            Ok(table.clone())
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Write;

    fn window(day: u32, h0: u32, h1: u32) -> Window {
        let date = NaiveDate::from_ymd_opt(2023, 10, day).unwrap();
        Window::from_boundary(
            date.and_hms_opt(h0, 0, 0).unwrap(),
            date.and_hms_opt(h1, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn write_market_data(dir: &Path) {
        let region_dir = dir.join("US");
        std::fs::create_dir_all(&region_dir).unwrap();
        let mut f = std::fs::File::create(region_dir.join("market_data.csv")).unwrap();
        writeln!(f, "datetime,date,time,instrument_id,value1,value2,value3").unwrap();
        writeln!(f, "2023-10-02 09:30:00,2023-10-02,09:30:00,AAA,1,2,3").unwrap();
        writeln!(f, "2023-10-02 10:00:00,2023-10-02,10:00:00,BBB,4.5,5,6").unwrap();
        writeln!(f, "2023-10-02 10:30:00,2023-10-02,10:30:00,CCC,7,8,9").unwrap();
    }

    #[test]
    fn test_csv_source_masks_with_exclusive_end() {
        let dir = tempfile::tempdir().unwrap();
        write_market_data(dir.path());
        let mut source = CsvDataSource::new(dir.path(), "US", vec!["market_data".to_string()]);

        // [09:00, 10:00) excludes the 10:00 row
        let data = source.load(&window(2, 9, 10));
        let table = &data["market_data"];
        assert_eq!(table.len(), 1);
        assert_eq!(table.value(0, "instrument_id").unwrap().as_str(), Some("AAA"));
        assert!(matches!(table.value(0, "date"), Some(Value::Date(_))));
        assert!(matches!(table.value(0, "datetime"), Some(Value::Timestamp(_))));

        let data = source.load(&window(2, 10, 11));
        assert_eq!(data["market_data"].len(), 2);
        assert_eq!(data["market_data"].value(0, "value1").unwrap().as_f64(), Some(4.5));
    }

    #[test]
    fn test_csv_source_omits_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        write_market_data(dir.path());
        let mut source = CsvDataSource::new(
            dir.path(),
            "US",
            vec!["market_data".to_string(), "fundamentals".to_string()],
        );

        let data = source.load(&window(2, 9, 11));
        assert!(data.contains_key("market_data"));
        assert!(!data.contains_key("fundamentals"));
    }

    #[test]
    fn test_synthetic_source_stamps_window_start() {
        let mut source = SyntheticSource::new(vec!["market_data".to_string()]);
        let w = window(3, 14, 15);
        let data = source.load(&w);
        let table = &data["market_data"];

        assert_eq!(table.len(), 3);
        assert_eq!(table.value(2, "value3").unwrap().as_i64(), Some(33));
        assert_eq!(table.value(0, "datetime").unwrap().as_timestamp(), Some(w.start));
    }

    #[test]
    fn test_memory_source_failure_is_omitted() {
        let mut tables = DataSet::new();
        tables.insert("static".to_string(), Table::new(["k"]));
        let mut source = MemorySource::new(tables).failing("market_data", "vendor down");

        let data = source.load(&window(2, 9, 10));
        assert_eq!(data.keys().collect::<Vec<_>>(), vec!["static"]);
    }
}
