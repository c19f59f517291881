//! Dispatch Error Taxonomy
//!
//! Run-scoped errors (`ConfigError`) may stop the process before any window
//! runs. Everything else is window-scoped and stops at the orchestrator or
//! listener boundary.

use std::fmt;

// =============================================================================
// CONFIG
// =============================================================================

/// Missing or invalid configuration. Fatal, raised before any window runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing(String),
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "missing config key: {}", key),
            Self::Invalid { key, reason } => write!(f, "invalid config key {}: {}", key, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// LOAD
// =============================================================================

/// A single data source failed for one window. The source is left out of
/// that window's dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub source: String,
    pub reason: String,
}

impl LoadError {
    pub fn new(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to load {}: {}", self.source, self.reason)
    }
}

impl std::error::Error for LoadError {}

// =============================================================================
// CLIENT
// =============================================================================

/// Failures raised by or around a client computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Unknown { name: String, available: Vec<String> },
    Initialize { client: String, reason: String },
    Generate { client: String, reason: String },
    NotInitialized(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown { name, available } => write!(
                f,
                "unknown client '{}'. Available clients: {}",
                name,
                available.join(", ")
            ),
            Self::Initialize { client, reason } => {
                write!(f, "client {} failed to initialize: {}", client, reason)
            }
            Self::Generate { client, reason } => {
                write!(f, "client {} generate failed: {}", client, reason)
            }
            Self::NotInitialized(client) => write!(f, "client {} is not initialized", client),
        }
    }
}

impl std::error::Error for ClientError {}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Publish, push or archive failure. Logged, never retried automatically.
#[derive(Debug)]
pub enum TransportError {
    Redis(redis::RedisError),
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Parquet(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redis(e) => write!(f, "Redis error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::Parquet(e) => write!(f, "Parquet error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<redis::RedisError> for TransportError {
    fn from(e: redis::RedisError) -> Self {
        Self::Redis(e)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

impl From<parquet::errors::ParquetError> for TransportError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Self::Parquet(e.to_string())
    }
}

impl From<arrow::error::ArrowError> for TransportError {
    fn from(e: arrow::error::ArrowError) -> Self {
        Self::Parquet(e.to_string())
    }
}

// =============================================================================
// PARSE
// =============================================================================

/// An incoming live message could not be decoded. The message is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Topic(String),
    Timestamp(String),
    Payload(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(t) => write!(f, "malformed topic: {}", t),
            Self::Timestamp(t) => write!(f, "unparseable window timestamp: {}", t),
            Self::Payload(e) => write!(f, "malformed payload: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

// =============================================================================
// WINDOW
// =============================================================================

/// Anything that fails a single window. Recorded in the job result.
#[derive(Debug)]
pub enum WindowError {
    Client(ClientError),
    Transport(TransportError),
    Worker(String),
    Panicked(String),
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(e) => write!(f, "{}", e),
            Self::Transport(e) => write!(f, "{}", e),
            Self::Worker(e) => write!(f, "worker setup failed: {}", e),
            Self::Panicked(msg) => write!(f, "window panicked: {}", msg),
        }
    }
}

impl std::error::Error for WindowError {}

impl From<ClientError> for WindowError {
    fn from(e: ClientError) -> Self {
        Self::Client(e)
    }
}

impl From<TransportError> for WindowError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Render a panic payload captured by `catch_unwind` or a join error.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
