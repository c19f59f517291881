//! Window Dispatch Engine
//!
//! Slices time into calendar-aware windows and drives each one through
//! data load → client computation → output push, either live or in replay.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────────────────────┐
//!                │   CalendarProvider + PeriodRequest   │
//!                │  (valid days, session, frequency)    │
//!                └──────────────────┬───────────────────┘
//!                                   │ generate_periods / live_window
//!                 ┌─────────────────┴─────────────────┐
//!                 ▼                                   ▼
//! ┌───────────────────────────┐        ┌───────────────────────────┐
//! │    ReplayOrchestrator     │        │       LiveScheduler       │
//! │ sequential | parallel(N)  │        │  tick channel → load      │
//! │ per-window timeout        │        └─────────────┬─────────────┘
//! └─────────────┬─────────────┘                      │
//!               │ WorkerFactory                      ▼
//!               │ (DataSource + ClientRuntime)   ┌──────────────────┐
//!               │                                │ BroadcastChannel │
//!               │                                │ topic + archive  │
//!               │                                └────────┬─────────┘
//!               │                                         │ pub/sub
//!               │                                         ▼
//!               │                                ┌──────────────────┐
//!               │                                │  LiveListener    │
//!               │                                └────────┬─────────┘
//!               ▼                                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            ClientRuntime::process_window(window, data)          │
//! │   apply_window → Client::generate → OutputSink::push            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Window Semantics
//!
//! - **Closed at microsecond resolution**: `end` is the last instant in the
//!   window; rows are matched with `start <= ts < end + 1µs`
//! - **Calendar-aware**: no window is produced for a day the calendar rejects
//! - **Isolated**: a failing window never stops the run

pub mod broadcast;
pub mod calendar;
pub mod client;
pub mod client_factory;
pub mod data_source;
pub mod error;
pub mod listener;
pub mod live;
pub mod periods;
pub mod replay;
pub mod sink;
pub mod table;
pub mod window;

// Re-exports for convenience
pub use broadcast::{
    parse_topic, topic_for, topic_pattern, BroadcastChannel, BusMessage, MemoryBus, Publisher,
    RedisPublisher,
};
pub use calendar::{
    calendar_from_name, CalendarProvider, ContinuousCalendar, ExchangeCalendar, FixedCalendar,
    WeekdayCalendar,
};
pub use client::{Client, ClientContext, ClientParams, ClientRuntime, RuntimeState};
pub use client_factory::{available_clients, make_client};
pub use data_source::{CsvDataSource, DataSource, MemorySource, SyntheticSource};
pub use error::{ClientError, ConfigError, LoadError, ParseError, TransportError, WindowError};
pub use listener::{ListenOutcome, LiveListener};
pub use live::{ClockTicks, LiveScheduler};
pub use periods::{check_coverage, generate_periods, live_window, Frequency, PeriodRequest};
pub use replay::{
    ExecutionMode, JobResult, JobStatus, ReplayOrchestrator, RunSummary, Worker, WorkerFactory,
};
pub use sink::{
    make_sink, JsonSink, MemorySink, OutputSink, OutputType, ParquetSink, ParquetStore, RedisSink,
};
pub use table::{DataSet, Table, Value};
pub use window::Window;
