//! Client Runtime
//!
//! A [`Client`] is one pluggable computation: given a window's [`DataSet`] it
//! returns an output [`Table`]. The [`ClientRuntime`] owns a client together
//! with its [`ClientContext`] and [`OutputSink`] and is the single entry point
//! both drivers use:
//!
//! ```text
//! replay worker ─┐
//!                ├─► ClientRuntime::process_window(window, data)
//! live listener ─┘        │
//!                         ├─ context.apply_window(window, data)
//!                         ├─ client.generate(&context, data)
//!                         └─ sink.push(window.start, client, table)
//! ```
//!
//! # Context Lifecycle
//!
//! Parameters (`custom_client_info` from config, plus anything the client
//! sets in `initialize`) persist for the runtime's lifetime. Date, time and
//! market data are replaced on every window, and only through
//! `apply_window`, immediately before `generate`.

use crate::dispatch::error::{ClientError, WindowError};
use crate::dispatch::sink::OutputSink;
use crate::dispatch::table::{DataSet, Table};
use crate::dispatch::window::Window;
use chrono::{NaiveDate, NaiveTime};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Free-form client parameters (`custom_client_info`).
pub type ClientParams = BTreeMap<String, Json>;

// =============================================================================
// CLIENT
// =============================================================================

/// The capability interface every client implements.
pub trait Client: Send {
    /// Registry name, used in output keys and file names.
    fn name(&self) -> &str;

    /// One-time setup. May add parameters to the context.
    fn initialize(&mut self, _ctx: &mut ClientContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Compute the output table for the current window.
    fn generate(&mut self, ctx: &ClientContext, data: &DataSet) -> anyhow::Result<Table>;
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Per-runtime state visible to a client.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    current_window: Option<Window>,
    current_market_data: DataSet,
    params: ClientParams,
}

impl ClientContext {
    pub fn new(params: ClientParams) -> Self {
        Self {
            current_window: None,
            current_market_data: DataSet::new(),
            params,
        }
    }

    /// Date of the in-flight window's start.
    pub fn current_date(&self) -> Option<NaiveDate> {
        self.current_window.map(|w| w.date())
    }

    /// Time of day of the in-flight window's start.
    pub fn current_time(&self) -> Option<NaiveTime> {
        self.current_window.map(|w| w.time())
    }

    pub fn current_window(&self) -> Option<Window> {
        self.current_window
    }

    pub fn market_data(&self) -> &DataSet {
        &self.current_market_data
    }

    pub fn params(&self) -> &ClientParams {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Json> {
        self.params.get(key)
    }

    /// Numeric parameter, accepting JSON numbers and numeric strings.
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        match self.params.get(key)? {
            Json::Number(n) => n.as_f64(),
            Json::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn param_f64_or(&self, key: &str, default: f64) -> f64 {
        self.param_f64(key).unwrap_or(default)
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<Json>) {
        self.params.insert(key.into(), value.into());
    }

    /// Set `key` only if config did not already provide it.
    pub fn set_default_param(&mut self, key: impl Into<String>, value: impl Into<Json>) {
        self.params.entry(key.into()).or_insert_with(|| value.into());
    }

    pub(crate) fn apply_window(&mut self, window: &Window, data: DataSet) {
        self.current_window = Some(*window);
        self.current_market_data = data;
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Uninitialized,
    Ready,
}

/// Owns one client, its context and its sink.
pub struct ClientRuntime {
    client: Box<dyn Client>,
    context: ClientContext,
    sink: Box<dyn OutputSink>,
    state: RuntimeState,
}

impl ClientRuntime {
    pub fn new(client: Box<dyn Client>, sink: Box<dyn OutputSink>, params: ClientParams) -> Self {
        Self {
            client,
            context: ClientContext::new(params),
            sink,
            state: RuntimeState::Uninitialized,
        }
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    /// Run the client's init hook. Subsequent calls are no-ops.
    pub fn initialize(&mut self) -> Result<(), ClientError> {
        if self.state == RuntimeState::Ready {
            return Ok(());
        }
        self.client
            .initialize(&mut self.context)
            .map_err(|e| ClientError::Initialize {
                client: self.client.name().to_string(),
                reason: format!("{:#}", e),
            })?;
        self.state = RuntimeState::Ready;
        info!(
            client = self.client.name(),
            sink = self.sink.name(),
            params = ?self.context.params(),
            "Client initialized"
        );
        Ok(())
    }

    /// Apply `window` to the context, generate, and push the output.
    /// Returns the number of rows pushed.
    pub fn process_window(&mut self, window: &Window, data: DataSet) -> Result<usize, WindowError> {
        if self.state != RuntimeState::Ready {
            return Err(ClientError::NotInitialized(self.client.name().to_string()).into());
        }

        self.context.apply_window(window, data);
        let output = self
            .client
            .generate(&self.context, self.context.market_data())
            .map_err(|e| ClientError::Generate {
                client: self.client.name().to_string(),
                reason: format!("{:#}", e),
            })?;

        let rows = output.len();
        self.sink.push(window.start, self.client.name(), &output)?;
        debug!(client = self.client.name(), window = %window, rows, "Window processed");
        Ok(rows)
    }
}
