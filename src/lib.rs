//! Windowcast Library
//!
//! Calendar-aware window generation, replay and live dispatch of market data
//! to pluggable clients. The binary in `main.rs` is a thin CLI over this.

pub mod config;
pub mod dispatch;
pub mod logging;
pub mod runner;

pub use config::DispatchConfig;
