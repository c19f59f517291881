//! Live Scheduler
//!
//! Publishes the current window's data once per tick. Ticks come from an
//! explicit channel so the loop can be driven by the wall clock in
//! production ([`ClockTicks`]) or by hand in tests.
//!
//! A tick at time `t` publishes `live_window(t, frequency)`: the window that
//! contains `t`, aligned to the frequency. Late ticks are not backfilled.

use crate::dispatch::broadcast::BroadcastChannel;
use crate::dispatch::data_source::DataSource;
use crate::dispatch::error::TransportError;
use crate::dispatch::periods::{live_window, Frequency};
use chrono::NaiveDateTime;
use crossbeam::channel::{bounded, Receiver};
use std::thread;
use tracing::{debug, error, info, info_span, warn};

/// Load → publish loop for the live path.
pub struct LiveScheduler {
    frequency: Frequency,
    source: Box<dyn DataSource>,
    channel: BroadcastChannel,
}

impl LiveScheduler {
    pub fn new(frequency: Frequency, source: Box<dyn DataSource>, channel: BroadcastChannel) -> Self {
        Self {
            frequency,
            source,
            channel,
        }
    }

    /// Handle a single tick. Returns the topic published, or `None` when no
    /// window could be built for `now`.
    pub fn run_tick(&mut self, now: NaiveDateTime) -> Result<Option<String>, TransportError> {
        let Some(window) = live_window(now, self.frequency) else {
            warn!(now = %now, frequency = %self.frequency, "No live window for tick");
            return Ok(None);
        };
        let data = self.source.load(&window);
        let topic = self.channel.publish(&window, &data)?;
        Ok(Some(topic))
    }

    /// Consume ticks until the channel closes. Returns the number of
    /// windows published.
    pub fn run(&mut self, ticks: Receiver<NaiveDateTime>) -> usize {
        info!(
            frequency = %self.frequency,
            region = self.channel.region(),
            source = self.source.name(),
            "Live scheduler running"
        );
        let mut published = 0;
        for now in ticks {
            let span = info_span!("live_tick", tick = %now, topic = tracing::field::Empty);
            let _enter = span.enter();
            match self.run_tick(now) {
                Ok(Some(topic)) => {
                    span.record("topic", topic.as_str());
                    published += 1;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "Live tick failed"),
            }
        }
        info!(published, "Tick source closed, live scheduler stopped");
        published
    }
}

/// Wall-clock tick source.
pub struct ClockTicks;

impl ClockTicks {
    /// Spawn a thread that sleeps until each aligned boundary (next minute
    /// slot, midnight or first of month) and sends it. The thread exits when
    /// the receiver is dropped.
    pub fn spawn(frequency: Frequency) -> std::io::Result<Receiver<NaiveDateTime>> {
        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name("live-clock".to_string())
            .spawn(move || loop {
                let now = chrono::Local::now().naive_local();
                let boundary = frequency.next_boundary(now);
                let wait = (boundary - now).to_std().unwrap_or_default();
                debug!(next = %boundary, wait_ms = wait.as_millis() as u64, "Sleeping until next boundary");
                thread::sleep(wait);
                if tx.send(boundary).is_err() {
                    break;
                }
            })?;
        Ok(rx)
    }
}
