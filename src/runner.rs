//! Run wiring
//!
//! Turns a validated [`DispatchConfig`] into the live publisher loop, the
//! listener or a replay run.

use crate::config::DispatchConfig;
use crate::dispatch::{
    generate_periods, make_client, make_sink, BroadcastChannel, ClientRuntime, ClockTicks,
    CsvDataSource, DataSource, LiveListener, LiveScheduler, RedisPublisher, ReplayOrchestrator,
    RunSummary, SyntheticSource, Window, WindowError, Worker, WorkerFactory,
};
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

/// Builds replay workers from configuration: a CSV source over the
/// historical directory and a runtime around the configured client.
pub struct ConfigWorkerFactory {
    config: DispatchConfig,
    client_name: String,
}

impl ConfigWorkerFactory {
    pub fn new(config: DispatchConfig) -> anyhow::Result<Self> {
        let client_name = config.client_name()?.to_string();
        // fail fast on unknown clients rather than once per window
        make_client(&client_name)?;
        Ok(Self {
            config,
            client_name,
        })
    }

    fn build_runtime(&self) -> Result<ClientRuntime, WindowError> {
        let client = make_client(&self.client_name)?;
        let sink = make_sink(
            self.config.output_type(),
            &self.config.redis_url(),
            &self.config.output_dir,
            &self.config.region,
        )?;
        Ok(ClientRuntime::new(
            client,
            sink,
            self.config.custom_client_info.clone(),
        ))
    }
}

impl WorkerFactory for ConfigWorkerFactory {
    fn build_worker(&self) -> Result<Worker, WindowError> {
        let source = CsvDataSource::new(
            &self.config.historical_dir,
            &self.config.region,
            self.config.datasources.clone(),
        );
        Ok(Worker::new(Box::new(source), self.build_runtime()?))
    }

    fn client_name(&self) -> &str {
        &self.client_name
    }
}

/// Windows a replay of `config` would process.
pub fn replay_windows(config: &DispatchConfig) -> anyhow::Result<Vec<Window>> {
    let request = config.period_request()?;
    let calendar = config.calendar()?;
    let windows = generate_periods(&request, calendar.as_ref())?;
    info!(
        calendar = calendar.name(),
        frequency = %request.frequency,
        windows = windows.len(),
        "Generated replay periods"
    );
    Ok(windows)
}

/// Replay the configured historical range.
pub async fn run_replay(config: DispatchConfig) -> anyhow::Result<RunSummary> {
    config.validate()?;
    let windows = replay_windows(&config)?;
    let mode = config.execution_mode();
    let timeout = config.window_timeout();
    let factory = Arc::new(ConfigWorkerFactory::new(config)?);
    let orchestrator = ReplayOrchestrator::new(factory, mode).with_timeout(timeout);
    Ok(orchestrator.run(windows).await)
}

/// Publish synthetic windows on every wall-clock boundary. Runs until the
/// tick thread stops.
pub async fn run_live(config: DispatchConfig) -> anyhow::Result<usize> {
    config.validate()?;
    let frequency = config.frequency()?;
    let publisher = RedisPublisher::new(&config.redis_url())
        .with_context(|| format!("connecting publisher to {}", config.redis_url()))?;
    let channel =
        BroadcastChannel::new(config.region.clone(), Box::new(publisher)).with_archive(&config.archive_dir);
    let source: Box<dyn DataSource> = Box::new(SyntheticSource::new(config.datasources.clone()));
    let ticks = ClockTicks::spawn(frequency).context("spawning clock thread")?;

    let mut scheduler = LiveScheduler::new(frequency, source, channel);
    let published = tokio::task::spawn_blocking(move || scheduler.run(ticks))
        .await
        .context("live scheduler thread")?;
    Ok(published)
}

/// Subscribe to the region's broadcast topics and run the configured client
/// on each window.
pub async fn run_listener(config: DispatchConfig) -> anyhow::Result<()> {
    config.validate()?;
    let frequency = config.frequency()?;
    let client = make_client(config.client_name()?)?;
    let sink = make_sink(
        config.output_type(),
        &config.redis_url(),
        &config.output_dir,
        &config.region,
    )?;
    let mut runtime = ClientRuntime::new(client, sink, config.custom_client_info.clone());
    runtime.initialize()?;

    let listener = LiveListener::new(config.region.clone(), frequency);
    let redis_url = config.redis_url();
    tokio::task::spawn_blocking(move || listener.listen_redis(&mut runtime, &redis_url))
        .await
        .context("listener thread")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_unknown_client() {
        let config = DispatchConfig::from_toml(
            "region = \"US\"\nclient_name = \"nope\"\n[historical_range]\nstart = \"2023-10-02\"\nend = \"2023-10-03\"",
        )
        .unwrap();
        assert!(ConfigWorkerFactory::new(config).is_err());
    }

    #[test]
    fn test_replay_windows_use_calendar() {
        let config = DispatchConfig::from_toml(
            "region = \"US\"\ncalendar = \"weekdays\"\n[historical_range]\nstart = \"2023-10-06\"\nend = \"2023-10-09\"",
        )
        .unwrap();
        let windows = replay_windows(&config).unwrap();
        // Fri and Mon, weekend skipped
        assert_eq!(windows.len(), 2);
    }
}
