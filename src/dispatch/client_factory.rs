//! Client Factory
//!
//! Maps client names to [`Client`] implementations. Clients are selected by
//! explicit name from config; there is no module discovery.
//!
//! # Supported Clients
//!
//! - `noop` - Produces no rows, used for smoke tests of the pipeline
//! - `signal_scaler` - `signal = value1 * custom_strategy_param`
//! - `threshold_signal` - `signal = value2 + value3`, flagged against
//!   `custom_threshold`

use crate::dispatch::client::{Client, ClientContext};
use crate::dispatch::error::ClientError;
use crate::dispatch::table::{DataSet, Table, Value};
use std::collections::HashMap;
use tracing::{debug, info};

/// Registry of available clients with their descriptions.
pub fn available_clients() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();
    map.insert("noop", "No-op client that emits an empty table (smoke test)");
    map.insert("signal_scaler", "Scales value1 by custom_strategy_param (default 2.0)");
    map.insert(
        "threshold_signal",
        "Sums value2 and value3 and flags rows above custom_threshold (default 50)",
    );
    map
}

/// Create a client by name (case-insensitive, `-` and `_` interchangeable).
pub fn make_client(name: &str) -> Result<Box<dyn Client>, ClientError> {
    let normalized = name.trim().to_lowercase().replace('-', "_");

    match normalized.as_str() {
        "noop" | "no_op" => Ok(Box::new(NoopClient)),
        "signal_scaler" | "scaler" | "client1" => Ok(Box::new(SignalScalerClient::new())),
        "threshold_signal" | "threshold" | "client2" => Ok(Box::new(ThresholdSignalClient::new())),
        _ => {
            let mut available: Vec<String> =
                available_clients().keys().map(|k| k.to_string()).collect();
            available.sort();
            Err(ClientError::Unknown {
                name: name.to_string(),
                available,
            })
        }
    }
}

// =============================================================================
// NO-OP CLIENT
// =============================================================================

/// Emits an empty table for every window.
pub struct NoopClient;

impl Client for NoopClient {
    fn name(&self) -> &str {
        "noop"
    }

    fn generate(&mut self, _ctx: &ClientContext, _data: &DataSet) -> anyhow::Result<Table> {
        Ok(Table::default())
    }
}

// =============================================================================
// SIGNAL SCALER
// =============================================================================

pub const STRATEGY_PARAM: &str = "custom_strategy_param";

/// Copies every table carrying `value1` and adds
/// `signal = value1 * custom_strategy_param`.
pub struct SignalScalerClient {
    name: String,
}

impl SignalScalerClient {
    pub fn new() -> Self {
        Self {
            name: "signal_scaler".to_string(),
        }
    }
}

impl Default for SignalScalerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Client for SignalScalerClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, ctx: &mut ClientContext) -> anyhow::Result<()> {
        ctx.set_default_param(STRATEGY_PARAM, 2.0);
        info!(client = %self.name, param = ?ctx.param(STRATEGY_PARAM), "Initialized signal scaler");
        Ok(())
    }

    fn generate(&mut self, ctx: &ClientContext, data: &DataSet) -> anyhow::Result<Table> {
        let factor = ctx.param_f64_or(STRATEGY_PARAM, 1.0);
        debug!(client = %self.name, date = ?ctx.current_date(), sources = data.len(), "Generating signals");

        let mut signals = Table::default();
        for table in data.values() {
            let Some(value1) = table.column("value1") else {
                continue;
            };
            let scaled: Vec<Value> = value1
                .map(|v| v.as_f64().map(|x| Value::Float(x * factor)).unwrap_or(Value::Null))
                .collect();
            let mut out = table.clone();
            out.set_column("signal", scaled);
            signals.append(out);
        }
        Ok(signals)
    }
}

// =============================================================================
// THRESHOLD SIGNAL
// =============================================================================

pub const THRESHOLD_PARAM: &str = "custom_threshold";

/// Copies every table carrying `value2` and `value3`, adds
/// `signal = value2 + value3` and `above_threshold = signal > custom_threshold`.
pub struct ThresholdSignalClient {
    name: String,
}

impl ThresholdSignalClient {
    pub fn new() -> Self {
        Self {
            name: "threshold_signal".to_string(),
        }
    }
}

impl Default for ThresholdSignalClient {
    fn default() -> Self {
        Self::new()
    }
}

fn add(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Value::Int(x.saturating_add(*y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Value::Float(x + y),
            _ => Value::Null,
        },
    }
}

impl Client for ThresholdSignalClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, ctx: &mut ClientContext) -> anyhow::Result<()> {
        ctx.set_default_param(THRESHOLD_PARAM, 50);
        info!(client = %self.name, param = ?ctx.param(THRESHOLD_PARAM), "Initialized threshold signal");
        Ok(())
    }

    fn generate(&mut self, ctx: &ClientContext, data: &DataSet) -> anyhow::Result<Table> {
        let threshold = ctx.param_f64_or(THRESHOLD_PARAM, 0.0);
        debug!(client = %self.name, time = ?ctx.current_time(), sources = data.len(), "Generating signals");

        let mut signals = Table::default();
        for table in data.values() {
            let (Some(v2), Some(v3)) = (table.column("value2"), table.column("value3")) else {
                continue;
            };
            let signal: Vec<Value> = v2.zip(v3).map(|(a, b)| add(a, b)).collect();
            let above: Vec<Value> = signal
                .iter()
                .map(|s| s.as_f64().map(|x| Value::Bool(x > threshold)).unwrap_or(Value::Null))
                .collect();
            let mut out = table.clone();
            out.set_column("signal", signal);
            out.set_column("above_threshold", above);
            signals.append(out);
        }
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::client::ClientParams;
    use crate::dispatch::data_source::{DataSource, SyntheticSource};
    use crate::dispatch::window::Window;
    use chrono::NaiveDate;

    fn live_data() -> DataSet {
        let start = NaiveDate::from_ymd_opt(2023, 10, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let window = Window::from_boundary(start, start + chrono::Duration::minutes(1)).unwrap();
        SyntheticSource::new(vec!["market_data".to_string()]).load(&window)
    }

    fn initialized(client: &mut dyn Client, params: ClientParams) -> ClientContext {
        let mut ctx = ClientContext::new(params);
        client.initialize(&mut ctx).unwrap();
        ctx
    }

    #[test]
    fn test_make_client_by_name_and_alias() {
        assert_eq!(make_client("signal_scaler").unwrap().name(), "signal_scaler");
        assert_eq!(make_client("Threshold-Signal").unwrap().name(), "threshold_signal");
        assert_eq!(make_client("NOOP").unwrap().name(), "noop");
    }

    #[test]
    fn test_make_client_unknown_lists_available() {
        let err = make_client("alpha_v9").err().unwrap();
        match &err {
            ClientError::Unknown { available, .. } => {
                assert_eq!(available.len(), available_clients().len());
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().contains("signal_scaler"));
    }

    #[test]
    fn test_signal_scaler_uses_default_param() {
        let mut client = SignalScalerClient::new();
        let ctx = initialized(&mut client, ClientParams::new());
        let out = client.generate(&ctx, &live_data()).unwrap();

        let signal: Vec<f64> = out.column("signal").unwrap().filter_map(Value::as_f64).collect();
        assert_eq!(signal, vec![2.0, 6.0, 20.0]);
    }

    #[test]
    fn test_signal_scaler_param_from_config() {
        let mut client = SignalScalerClient::new();
        let mut params = ClientParams::new();
        params.insert(STRATEGY_PARAM.to_string(), serde_json::json!("0.5"));
        let ctx = initialized(&mut client, params);
        let out = client.generate(&ctx, &live_data()).unwrap();

        assert_eq!(out.value(2, "signal").unwrap().as_f64(), Some(5.0));
    }

    #[test]
    fn test_threshold_signal_flags_rows() {
        let mut client = ThresholdSignalClient::new();
        let ctx = initialized(&mut client, ClientParams::new());
        let out = client.generate(&ctx, &live_data()).unwrap();

        let signal: Vec<i64> = out.column("signal").unwrap().filter_map(Value::as_i64).collect();
        assert_eq!(signal, vec![5, 5, 55]);
        let above: Vec<bool> = out
            .column("above_threshold")
            .unwrap()
            .filter_map(Value::as_bool)
            .collect();
        assert_eq!(above, vec![false, false, true]);
    }

    #[test]
    fn test_clients_skip_tables_without_inputs() {
        let mut data = DataSet::new();
        data.insert("reference".to_string(), Table::new(["instrument_id"]));

        let mut scaler = SignalScalerClient::new();
        let ctx = initialized(&mut scaler, ClientParams::new());
        assert!(scaler.generate(&ctx, &data).unwrap().is_empty());

        let mut threshold = ThresholdSignalClient::new();
        let ctx = initialized(&mut threshold, ClientParams::new());
        assert!(threshold.generate(&ctx, &data).unwrap().is_empty());
    }
}
