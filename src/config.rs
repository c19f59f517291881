//! Dispatch configuration
//!
//! One TOML file describes a run: region, frequency, calendar, historical
//! range, data sources, client and output destination. A handful of
//! operational keys can be overridden from the environment (`.env` files are
//! honored by the binary).

use crate::dispatch::calendar::{calendar_from_name, CalendarProvider, ContinuousCalendar};
use crate::dispatch::client::ClientParams;
use crate::dispatch::error::ConfigError;
use crate::dispatch::periods::{check_coverage, Frequency, PeriodRequest};
use crate::dispatch::replay::ExecutionMode;
use crate::dispatch::sink::OutputType;
use crate::dispatch::table::{parse_datetime, parse_time};
use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Source that must always be configured.
pub const MARKET_DATA: &str = "market_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Live,
    #[serde(alias = "historical")]
    Replay,
}

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_mode")]
    pub mode: RunMode,

    #[serde(default)]
    pub region: String,

    /// `day`, `minute`, `N min` or `month`
    #[serde(default = "default_frequency")]
    pub frequency: String,

    /// `NYSE`, `weekdays` or `24/7`. Unset means every day is valid.
    #[serde(default)]
    pub calendar: Option<String>,

    /// Extra closed days for the `weekdays` calendar.
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,

    #[serde(default)]
    pub historical_range: Option<HistoricalRange>,

    #[serde(default = "default_datasources")]
    pub datasources: Vec<String>,

    #[serde(default = "default_historical_dir")]
    pub historical_dir: PathBuf,

    /// `redis`, `parquet` or `json`
    #[serde(default = "default_output_type")]
    pub output_type: String,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Parallel replay pool size
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_window_timeout_secs")]
    pub window_timeout_secs: u64,

    #[serde(default)]
    pub parallel: bool,

    #[serde(default)]
    pub client_name: Option<String>,

    /// Copied into every client context
    #[serde(default)]
    pub custom_client_info: ClientParams,

    #[serde(default)]
    pub redis: RedisConfig,
}

/// Replay range. Dates accept `YYYY-MM-DD` or `YYYY-MM-DD[T ]HH:MM[:SS]`,
/// session times `HH:MM[:SS]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalRange {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub open_time: Option<String>,
    #[serde(default)]
    pub close_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
        }
    }
}

fn default_mode() -> RunMode {
    RunMode::Replay
}
fn default_frequency() -> String {
    "day".to_string()
}
fn default_datasources() -> Vec<String> {
    vec![MARKET_DATA.to_string()]
}
fn default_historical_dir() -> PathBuf {
    PathBuf::from("./data/historical")
}
fn default_output_type() -> String {
    "parquet".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./outputs")
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("./archive")
}
fn default_workers() -> usize {
    4
}
fn default_window_timeout_secs() -> u64 {
    600
}
fn default_redis_host() -> String {
    "localhost".to_string()
}
fn default_redis_port() -> u16 {
    6379
}

impl DispatchConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    /// Apply `WINDOWCAST_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("WINDOWCAST_REDIS_HOST") {
            self.redis.host = host;
        }
        if let Some(dir) = lookup("WINDOWCAST_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("WINDOWCAST_WORKERS") {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.workers = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid WINDOWCAST_WORKERS"),
            }
        }
    }

    /// Check every key the selected mode needs. Runs before any window.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.trim().is_empty() {
            return Err(ConfigError::Missing("region".to_string()));
        }
        if !self.datasources.iter().any(|s| s == MARKET_DATA) {
            return Err(ConfigError::invalid(
                "datasources",
                format!("must include '{}'", MARKET_DATA),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.window_timeout_secs == 0 {
            return Err(ConfigError::invalid("window_timeout_secs", "must be at least 1"));
        }
        self.frequency()?;
        let calendar = self.calendar()?;
        if self.mode == RunMode::Replay {
            check_coverage(&self.period_request()?, calendar.as_ref())?;
        }
        Ok(())
    }

    pub fn frequency(&self) -> Result<Frequency, ConfigError> {
        self.frequency.parse()
    }

    /// Calendar for period generation. Unset means every day is valid.
    pub fn calendar(&self) -> Result<Box<dyn CalendarProvider>, ConfigError> {
        match &self.calendar {
            Some(name) => calendar_from_name(name, &self.holidays),
            None => Ok(Box::new(ContinuousCalendar)),
        }
    }

    /// Client registry name; required for replay and listening.
    pub fn client_name(&self) -> Result<&str, ConfigError> {
        self.client_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing("client_name".to_string()))
    }

    /// Build the replay period request from `historical_range`.
    pub fn period_request(&self) -> Result<PeriodRequest, ConfigError> {
        let range = self
            .historical_range
            .as_ref()
            .ok_or_else(|| ConfigError::Missing("historical_range".to_string()))?;
        let start = parse_range_instant("historical_range.start", &range.start)?;
        let end = parse_range_instant("historical_range.end", &range.end)?;
        if start > end {
            return Err(ConfigError::invalid(
                "historical_range",
                format!("start {} is after end {}", range.start, range.end),
            ));
        }

        let frequency = self.frequency()?;
        let mut request = PeriodRequest::new(start, end, frequency);
        request.open_time = parse_session_time("historical_range.open_time", &range.open_time)?;
        request.close_time = parse_session_time("historical_range.close_time", &range.close_time)?;

        if frequency.is_intraday() {
            match (request.open_time, request.close_time) {
                (None, _) => return Err(ConfigError::Missing("historical_range.open_time".to_string())),
                (_, None) => return Err(ConfigError::Missing("historical_range.close_time".to_string())),
                (Some(open), Some(close)) if open >= close => {
                    return Err(ConfigError::invalid(
                        "historical_range",
                        "open_time must be before close_time",
                    ))
                }
                _ => {}
            }
        }
        Ok(request)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.parallel {
            ExecutionMode::Parallel {
                workers: self.workers.max(1),
            }
        } else {
            ExecutionMode::Sequential
        }
    }

    pub fn window_timeout(&self) -> Duration {
        Duration::from_secs(self.window_timeout_secs)
    }

    pub fn output_type(&self) -> OutputType {
        OutputType::parse_lenient(&self.output_type)
    }

    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis.host, self.redis.port, self.redis.db
        )
    }
}

fn parse_range_instant(key: &str, raw: &str) -> Result<NaiveDateTime, ConfigError> {
    parse_datetime(raw).ok_or_else(|| ConfigError::invalid(key, format!("unparseable date '{}'", raw)))
}

fn parse_session_time(key: &str, raw: &Option<String>) -> Result<Option<NaiveTime>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(s) => parse_time(s)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(key, format!("unparseable time '{}'", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mode = "replay"
region = "US"
frequency = "15 min"
calendar = "weekdays"
holidays = ["2023-10-09"]
datasources = ["market_data", "fundamentals"]
output_type = "json"
parallel = true
workers = 8
client_name = "signal_scaler"

[historical_range]
start = "2023-10-02"
end = "2023-10-06"
open_time = "09:30"
close_time = "16:00"

[custom_client_info]
custom_strategy_param = 1.5
desk = "eq"

[redis]
host = "cache.internal"
"#;

    #[test]
    fn test_parse_sample() {
        let config = DispatchConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.frequency().unwrap(), Frequency::Minutes(15));
        assert_eq!(config.execution_mode(), ExecutionMode::Parallel { workers: 8 });
        assert_eq!(config.output_type(), OutputType::Json);
        assert_eq!(config.redis_url(), "redis://cache.internal:6379/0");
        assert_eq!(config.client_name().unwrap(), "signal_scaler");
        assert_eq!(config.custom_client_info["desk"], "eq");

        let request = config.period_request().unwrap();
        assert_eq!(request.open_time, NaiveTime::from_hms_opt(9, 30, 0));
        assert_eq!(config.calendar().unwrap().name(), "weekdays");
    }

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::from_toml("region = \"EU\"\nmode = \"live\"").unwrap();
        config.validate().unwrap();
        assert_eq!(config.frequency, "day");
        assert_eq!(config.datasources, vec!["market_data"]);
        assert_eq!(config.output_type(), OutputType::Parquet);
        assert_eq!(config.execution_mode(), ExecutionMode::Sequential);
        assert_eq!(config.window_timeout(), Duration::from_secs(600));
        assert!(config.client_name().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_keys() {
        let config = DispatchConfig::from_toml("mode = \"live\"").unwrap();
        assert_eq!(config.validate(), Err(ConfigError::Missing("region".to_string())));

        let config = DispatchConfig::from_toml("region = \"US\"").unwrap();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Missing("historical_range".to_string()))
        );

        let config =
            DispatchConfig::from_toml("region = \"US\"\nmode = \"live\"\ndatasources = [\"news\"]").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_intraday_range_requires_session() {
        let mut config = DispatchConfig::from_toml(SAMPLE).unwrap();
        if let Some(range) = config.historical_range.as_mut() {
            range.close_time = None;
        }
        assert_eq!(
            config.validate(),
            Err(ConfigError::Missing("historical_range.close_time".to_string()))
        );
    }

    #[test]
    fn test_range_outside_exchange_calendar_is_rejected() {
        let config = DispatchConfig::from_toml(
            "region = \"US\"\ncalendar = \"NYSE\"\n[historical_range]\nstart = \"2019-10-01\"\nend = \"2019-10-04\"",
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "historical_range"
        ));

        let mut covered = config.clone();
        if let Some(range) = covered.historical_range.as_mut() {
            range.start = "2023-10-02".to_string();
            range.end = "2023-10-06".to_string();
        }
        covered.validate().unwrap();
    }

    #[test]
    fn test_historical_is_replay() {
        let config = DispatchConfig::from_toml("region = \"US\"\nmode = \"historical\"").unwrap();
        assert_eq!(config.mode, RunMode::Replay);
    }

    #[test]
    fn test_unknown_frequency_is_rejected() {
        let config =
            DispatchConfig::from_toml("region = \"US\"\nmode = \"live\"\nfrequency = \"fortnight\"").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "frequency"
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = DispatchConfig::from_toml(SAMPLE).unwrap();
        config.apply_overrides(|key| match key {
            "WINDOWCAST_REDIS_HOST" => Some("10.0.0.5".to_string()),
            "WINDOWCAST_WORKERS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.redis.host, "10.0.0.5");
        assert_eq!(config.workers, 8);
    }
}
