//! Replay Orchestrator
//!
//! Drives a historical window sequence through load → generate → push, one
//! job per window, and reports a [`RunSummary`].
//!
//! # Execution Modes
//!
//! - `Sequential`: one blocking task, one worker reused across windows in
//!   ascending order. A panicking window is caught, recorded, and the worker
//!   is rebuilt before the next window.
//! - `Parallel { workers }`: at most `workers` jobs in flight, each building
//!   its own data source and runtime on the blocking pool, each bounded by
//!   the per-window timeout. A timed-out job gives its slot back immediately;
//!   the stuck blocking call is left to finish on its own.
//!
//! `workers` bounds jobs in flight, not threads. Each timed-out window keeps
//! its blocking thread until the call returns, so `k` stuck windows can hold
//! up to `workers + k` threads of tokio's blocking pool at once. Size the
//! timeout so stuck calls are rare, or the pool will grow past `workers`.
//!
//! Failures never abort a run. Every window ends up in exactly one of
//! `succeeded` or `failed`, both in chronological order.

use crate::dispatch::client::ClientRuntime;
use crate::dispatch::data_source::DataSource;
use crate::dispatch::error::{panic_message, WindowError};
use crate::dispatch::window::Window;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Default per-window timeout.
pub const DEFAULT_WINDOW_TIMEOUT: Duration = Duration::from_secs(600);

/// Default parallel pool size.
pub const DEFAULT_WORKERS: usize = 4;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Parallel { workers: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Success,
    Failed,
    TimedOut,
}

/// Outcome of one window job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub window: Window,
    pub status: JobStatus,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl JobResult {
    fn from_outcome(job_id: Uuid, window: Window, started: Instant, outcome: Result<usize, WindowError>) -> Self {
        match outcome {
            Ok(_) => Self {
                job_id,
                window,
                status: JobStatus::Success,
                error: None,
                elapsed: started.elapsed(),
            },
            Err(e) => Self {
                job_id,
                window,
                status: JobStatus::Failed,
                error: Some(e.to_string()),
                elapsed: started.elapsed(),
            },
        }
    }
}

/// Aggregate report for one replay run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total: usize,
    pub succeeded: Vec<Window>,
    /// Failed and timed-out windows.
    pub failed: Vec<Window>,
    pub jobs: Vec<JobResult>,
}

impl RunSummary {
    /// Build from job results in any order.
    pub fn from_jobs(run_id: Uuid, mut jobs: Vec<JobResult>) -> Self {
        jobs.sort_by_key(|j| j.window);
        let succeeded = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Success)
            .map(|j| j.window)
            .collect();
        let failed = jobs
            .iter()
            .filter(|j| j.status != JobStatus::Success)
            .map(|j| j.window)
            .collect();
        Self {
            run_id,
            total: jobs.len(),
            succeeded,
            failed,
            jobs,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn timed_out(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::TimedOut)
            .count()
    }

    /// Human-readable run outcome for `client`.
    pub fn message(&self, client: &str) -> String {
        if self.is_success() {
            format!(
                "Replay completed successfully for client {}. All {} windows successful.",
                client, self.total
            )
        } else {
            let failed: Vec<String> = self.failed.iter().map(|w| w.to_string()).collect();
            format!(
                "Replay completed for client {}. {}/{} windows successful. Failed windows: {}",
                client,
                self.succeeded.len(),
                self.total,
                failed.join(", ")
            )
        }
    }
}

// =============================================================================
// WORKERS
// =============================================================================

/// A data source and client runtime pair able to run windows.
pub struct Worker {
    pub source: Box<dyn DataSource>,
    pub runtime: ClientRuntime,
}

impl Worker {
    pub fn new(source: Box<dyn DataSource>, runtime: ClientRuntime) -> Self {
        Self { source, runtime }
    }

    /// Load, generate and push one window.
    pub fn run_window(&mut self, window: &Window) -> Result<usize, WindowError> {
        self.runtime.initialize()?;
        let data = self.source.load(window);
        self.runtime.process_window(window, data)
    }
}

/// Builds fresh workers. Shared across parallel jobs, so it must only hold
/// read-only configuration.
pub trait WorkerFactory: Send + Sync + 'static {
    fn build_worker(&self) -> Result<Worker, WindowError>;

    /// Client name for summaries and logs.
    fn client_name(&self) -> &str;
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

pub struct ReplayOrchestrator {
    factory: Arc<dyn WorkerFactory>,
    mode: ExecutionMode,
    window_timeout: Duration,
}

impl ReplayOrchestrator {
    pub fn new(factory: Arc<dyn WorkerFactory>, mode: ExecutionMode) -> Self {
        Self {
            factory,
            mode,
            window_timeout: DEFAULT_WINDOW_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.window_timeout = timeout;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Run every window and return the summary. Never fails as a whole.
    pub async fn run(&self, windows: Vec<Window>) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("replay_run", run_id = %run_id);

        async {
            info!(
                client = self.factory.client_name(),
                windows = windows.len(),
                mode = ?self.mode,
                "Starting replay"
            );

            let jobs = match self.mode {
                ExecutionMode::Sequential => self.run_sequential(windows).await,
                ExecutionMode::Parallel { workers } => self.run_parallel(windows, workers).await,
            };

            let summary = RunSummary::from_jobs(run_id, jobs);
            let message = summary.message(self.factory.client_name());
            if summary.is_success() {
                info!(total = summary.total, "{}", message);
            } else {
                warn!(
                    total = summary.total,
                    failed = summary.failed.len(),
                    timed_out = summary.timed_out(),
                    "{}",
                    message
                );
            }
            summary
        }
        .instrument(span)
        .await
    }

    async fn run_sequential(&self, windows: Vec<Window>) -> Vec<JobResult> {
        let factory = self.factory.clone();
        let span = tracing::Span::current();
        let fallback = windows.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            run_sequential_blocking(factory.as_ref(), &windows)
        });

        match handle.await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Sequential replay task died");
                let reason = if e.is_panic() {
                    WindowError::Panicked(panic_message(e.into_panic().as_ref()))
                } else {
                    WindowError::Worker(e.to_string())
                };
                fallback
                    .into_iter()
                    .map(|w| failed_job(w, reason.to_string()))
                    .collect()
            }
        }
    }

    async fn run_parallel(&self, windows: Vec<Window>, workers: usize) -> Vec<JobResult> {
        let pool = Arc::new(Semaphore::new(workers.max(1)));
        let timeout = self.window_timeout;
        let mut set = JoinSet::new();

        for (index, window) in windows.iter().copied().enumerate() {
            let pool = pool.clone();
            let factory = self.factory.clone();
            let job_id = Uuid::new_v4();
            let span = info_span!("window_job", job_id = %job_id, window = %window);

            set.spawn(
                async move {
                    let Ok(_permit) = pool.acquire_owned().await else {
                        return (index, failed_job(window, "worker pool closed".to_string()));
                    };
                    let started = Instant::now();
                    let blocking_span = tracing::Span::current();
                    let handle = tokio::task::spawn_blocking(move || {
                        let _enter = blocking_span.enter();
                        run_fresh_worker(factory.as_ref(), &window)
                    });

                    let job = match tokio::time::timeout(timeout, handle).await {
                        Ok(Ok(outcome)) => JobResult::from_outcome(job_id, window, started, outcome),
                        Ok(Err(join_err)) => {
                            let reason = if join_err.is_panic() {
                                WindowError::Panicked(panic_message(join_err.into_panic().as_ref()))
                            } else {
                                WindowError::Worker(join_err.to_string())
                            };
                            JobResult::from_outcome(job_id, window, started, Err(reason))
                        }
                        Err(_) => JobResult {
                            job_id,
                            window,
                            status: JobStatus::TimedOut,
                            error: Some(format!("timed out after {:?}", timeout)),
                            elapsed: started.elapsed(),
                        },
                    };
                    log_job(&job);
                    (index, job)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<JobResult>> = vec![None; windows.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, job)) => slots[index] = Some(job),
                Err(e) => error!(error = %e, "Replay job task died"),
            }
        }

        slots
            .into_iter()
            .zip(windows)
            .map(|(slot, window)| {
                slot.unwrap_or_else(|| failed_job(window, "job aborted before reporting".to_string()))
            })
            .collect()
    }
}

fn failed_job(window: Window, reason: String) -> JobResult {
    JobResult {
        job_id: Uuid::new_v4(),
        window,
        status: JobStatus::Failed,
        error: Some(reason),
        elapsed: Duration::ZERO,
    }
}

fn log_job(job: &JobResult) {
    match job.status {
        JobStatus::Success => info!(elapsed_ms = job.elapsed.as_millis() as u64, "Window succeeded"),
        JobStatus::Failed => error!(
            elapsed_ms = job.elapsed.as_millis() as u64,
            error = job.error.as_deref().unwrap_or(""),
            "Window failed"
        ),
        JobStatus::TimedOut => error!(
            elapsed_ms = job.elapsed.as_millis() as u64,
            "Window timed out"
        ),
    }
}

fn run_fresh_worker(factory: &dyn WorkerFactory, window: &Window) -> Result<usize, WindowError> {
    let mut worker = factory.build_worker()?;
    worker.run_window(window)
}

fn run_sequential_blocking(factory: &dyn WorkerFactory, windows: &[Window]) -> Vec<JobResult> {
    let mut worker: Option<Worker> = None;
    let mut jobs = Vec::with_capacity(windows.len());

    for window in windows {
        let job_id = Uuid::new_v4();
        let span = info_span!("window_job", job_id = %job_id, window = %window);
        let _enter = span.enter();
        let started = Instant::now();

        if worker.is_none() {
            match factory.build_worker() {
                Ok(w) => worker = Some(w),
                Err(e) => {
                    let job = JobResult::from_outcome(job_id, *window, started, Err(e));
                    log_job(&job);
                    jobs.push(job);
                    continue;
                }
            }
        }
        let Some(current) = worker.as_mut() else {
            continue;
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| current.run_window(window))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                // Rebuild after a panic, the old runtime may be half-updated.
                worker = None;
                Err(WindowError::Panicked(panic_message(payload.as_ref())))
            }
        };
        let job = JobResult::from_outcome(job_id, *window, started, outcome);
        log_job(&job);
        jobs.push(job);
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::client::{Client, ClientContext, ClientParams};
    use crate::dispatch::data_source::MemorySource;
    use crate::dispatch::sink::MemorySink;
    use crate::dispatch::table::{DataSet, Table, Value};
    use chrono::{Datelike, NaiveDate};

    /// Fails on the 3rd of the month, panics on the 4th, hangs on the 5th.
    struct Moody {
        hang: Duration,
    }

    impl Client for Moody {
        fn name(&self) -> &str {
            "moody"
        }

        fn generate(&mut self, ctx: &ClientContext, _data: &DataSet) -> anyhow::Result<Table> {
            let day = ctx.current_date().map(|d| d.day()).unwrap_or(0);
            match day {
                3 => anyhow::bail!("bad day"),
                4 => panic!("client exploded"),
                5 => std::thread::sleep(self.hang),
                _ => {}
            }
            let mut t = Table::new(["day"]);
            t.push_row(vec![Value::Int(day as i64)]);
            Ok(t)
        }
    }

    struct MoodyFactory {
        sink: MemorySink,
        hang: Duration,
    }

    impl WorkerFactory for MoodyFactory {
        fn build_worker(&self) -> Result<Worker, WindowError> {
            let runtime = ClientRuntime::new(
                Box::new(Moody { hang: self.hang }),
                Box::new(self.sink.clone()),
                ClientParams::new(),
            );
            Ok(Worker::new(Box::new(MemorySource::new(DataSet::new())), runtime))
        }

        fn client_name(&self) -> &str {
            "moody"
        }
    }

    fn day_window(day: u32) -> Window {
        let date = NaiveDate::from_ymd_opt(2023, 10, day).unwrap();
        Window::from_boundary(
            date.and_hms_opt(0, 0, 0).unwrap(),
            date.succ_opt().unwrap().and_hms_opt(0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn orchestrator(mode: ExecutionMode, sink: &MemorySink, hang: Duration) -> ReplayOrchestrator {
        let factory = Arc::new(MoodyFactory {
            sink: sink.clone(),
            hang,
        });
        ReplayOrchestrator::new(factory, mode).with_timeout(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_sequential_isolates_errors_and_panics() {
        let sink = MemorySink::new();
        let windows: Vec<Window> = [2, 3, 4, 6].into_iter().map(day_window).collect();
        let summary = orchestrator(ExecutionMode::Sequential, &sink, Duration::ZERO)
            .run(windows)
            .await;

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, vec![day_window(2), day_window(6)]);
        assert_eq!(summary.failed, vec![day_window(3), day_window(4)]);
        assert!(summary.jobs[2].error.as_deref().unwrap().contains("client exploded"));
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_matches_sequential_without_timeouts() {
        let windows: Vec<Window> = [2, 3, 4, 6, 9, 10].into_iter().map(day_window).collect();

        let seq_sink = MemorySink::new();
        let seq = orchestrator(ExecutionMode::Sequential, &seq_sink, Duration::ZERO)
            .run(windows.clone())
            .await;
        let par_sink = MemorySink::new();
        let par = orchestrator(ExecutionMode::Parallel { workers: 3 }, &par_sink, Duration::ZERO)
            .run(windows)
            .await;

        assert_eq!(seq.succeeded, par.succeeded);
        assert_eq!(seq.failed, par.failed);
        assert_eq!(par_sink.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_timeout_does_not_block_other_windows() {
        let sink = MemorySink::new();
        let windows: Vec<Window> = [5, 2, 6].into_iter().map(day_window).collect();
        let summary = orchestrator(ExecutionMode::Parallel { workers: 1 }, &sink, Duration::from_secs(2))
            .run(windows)
            .await;

        assert_eq!(summary.succeeded, vec![day_window(2), day_window(6)]);
        assert_eq!(summary.failed, vec![day_window(5)]);
        assert_eq!(summary.timed_out(), 1);
        // chronological regardless of submission order
        assert_eq!(summary.jobs[0].window, day_window(2));
        assert_eq!(summary.jobs[1].status, JobStatus::TimedOut);
    }

    #[test]
    fn test_summary_message() {
        let run_id = Uuid::new_v4();
        let ok = RunSummary::from_jobs(
            run_id,
            vec![JobResult::from_outcome(Uuid::new_v4(), day_window(2), Instant::now(), Ok(1))],
        );
        assert_eq!(
            ok.message("c1"),
            "Replay completed successfully for client c1. All 1 windows successful."
        );

        let mixed = RunSummary::from_jobs(
            run_id,
            vec![
                failed_job(day_window(3), "boom".to_string()),
                JobResult::from_outcome(Uuid::new_v4(), day_window(2), Instant::now(), Ok(1)),
            ],
        );
        let msg = mixed.message("c1");
        assert!(msg.starts_with("Replay completed for client c1. 1/2 windows successful."));
        assert!(msg.contains(&day_window(3).to_string()));
    }

    #[tokio::test]
    async fn test_empty_run() {
        let sink = MemorySink::new();
        let summary = orchestrator(ExecutionMode::Parallel { workers: 4 }, &sink, Duration::ZERO)
            .run(Vec::new())
            .await;
        assert_eq!(summary.total, 0);
        assert!(summary.is_success());
    }
}
