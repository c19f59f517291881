//! Live Listener
//!
//! The subscriber half of the live path. Each broadcast message is decoded
//! back into a window and a [`DataSet`] and handed to
//! [`ClientRuntime::process_window`], the same entry point replay uses.
//! Messages are handled one at a time in arrival order.
//!
//! Undecodable topics or payloads are logged and dropped; a failing window
//! is logged and the listener moves on to the next message.

use crate::dispatch::broadcast::{parse_topic, topic_pattern, BusMessage};
use crate::dispatch::client::ClientRuntime;
use crate::dispatch::error::{ParseError, TransportError, WindowError};
use crate::dispatch::periods::{live_window, Frequency};
use crate::dispatch::table::{decode_dataset, DataSet};
use crate::dispatch::window::Window;
use crossbeam::channel::Receiver;
use tracing::{error, info, info_span, warn};

/// What happened to one incoming message.
#[derive(Debug)]
pub enum ListenOutcome {
    Processed { window: Window, rows: usize },
    Dropped(ParseError),
    Failed { window: Window, error: WindowError },
}

impl ListenOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Processed { .. })
    }
}

/// Decodes broadcast messages for one region and drives a runtime.
pub struct LiveListener {
    region: String,
    frequency: Frequency,
}

impl LiveListener {
    pub fn new(region: impl Into<String>, frequency: Frequency) -> Self {
        Self {
            region: region.into(),
            frequency,
        }
    }

    pub fn pattern(&self) -> String {
        topic_pattern(&self.region)
    }

    fn decode(&self, topic: &str, payload: &str) -> Result<(Window, DataSet), ParseError> {
        let (region, start) = parse_topic(topic)?;
        if region != self.region {
            return Err(ParseError::Topic(format!(
                "{} (expected region {})",
                topic, self.region
            )));
        }
        let window = live_window(start, self.frequency)
            .ok_or_else(|| ParseError::Timestamp(start.to_string()))?;
        let data = decode_dataset(payload)?;
        Ok((window, data))
    }

    /// Handle one message. Never panics on bad input.
    pub fn handle_message(
        &self,
        runtime: &mut ClientRuntime,
        topic: &str,
        payload: &str,
    ) -> ListenOutcome {
        let span = info_span!("live_message", topic = %topic);
        let _enter = span.enter();

        let (window, data) = match self.decode(topic, payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable message");
                return ListenOutcome::Dropped(e);
            }
        };

        match runtime.process_window(&window, data) {
            Ok(rows) => {
                info!(client = runtime.client_name(), window = %window, rows, "Processed live window");
                ListenOutcome::Processed { window, rows }
            }
            Err(e) => {
                error!(client = runtime.client_name(), window = %window, error = %e, "Live window failed");
                ListenOutcome::Failed { window, error: e }
            }
        }
    }

    /// Consume an in-process bus subscription until it closes. Returns the
    /// number of windows processed successfully.
    pub fn listen_bus(&self, runtime: &mut ClientRuntime, messages: Receiver<BusMessage>) -> usize {
        info!(client = runtime.client_name(), region = %self.region, "Listening on memory bus");
        let mut processed = 0;
        for message in messages {
            if self
                .handle_message(runtime, &message.topic, &message.payload)
                .is_processed()
            {
                processed += 1;
            }
        }
        processed
    }

    /// Pattern-subscribe on Redis and process messages until the connection
    /// fails.
    pub fn listen_redis(
        &self,
        runtime: &mut ClientRuntime,
        redis_url: &str,
    ) -> Result<(), TransportError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_connection()?;
        let mut pubsub = conn.as_pubsub();
        let pattern = self.pattern();
        pubsub.psubscribe(&pattern)?;
        info!(
            client = runtime.client_name(),
            pattern = %pattern,
            "Listening to Redis"
        );

        loop {
            let msg = pubsub.get_message()?;
            let topic = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Dropping non-text payload");
                    continue;
                }
            };
            self.handle_message(runtime, &topic, &payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::broadcast::{BroadcastChannel, MemoryBus};
    use crate::dispatch::client::ClientParams;
    use crate::dispatch::client_factory::make_client;
    use crate::dispatch::data_source::{DataSource, SyntheticSource};
    use crate::dispatch::sink::MemorySink;
    use chrono::NaiveDate;

    fn runtime(sink: &MemorySink) -> ClientRuntime {
        let mut rt = ClientRuntime::new(
            make_client("threshold_signal").unwrap(),
            Box::new(sink.clone()),
            ClientParams::new(),
        );
        rt.initialize().unwrap();
        rt
    }

    fn minute_window(h: u32, m: u32) -> Window {
        let start = NaiveDate::from_ymd_opt(2023, 10, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap();
        live_window(start, Frequency::Minutes(1)).unwrap()
    }

    #[test]
    fn test_broadcast_to_listener_roundtrip() {
        let bus = MemoryBus::new();
        let listener = LiveListener::new("US", Frequency::Minutes(1));
        let rx = bus.psubscribe(listener.pattern());

        let mut channel = BroadcastChannel::new("US", Box::new(bus.clone()));
        let mut source = SyntheticSource::new(vec!["market_data".to_string()]);
        for m in [30, 31] {
            let w = minute_window(9, m);
            channel.publish(&w, &source.load(&w)).unwrap();
        }
        drop(channel);
        drop(bus);

        let sink = MemorySink::new();
        let mut rt = runtime(&sink);
        assert_eq!(listener.listen_bus(&mut rt, rx), 2);

        let outputs = sink.outputs();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].window_start, minute_window(9, 31).start);
        assert_eq!(outputs[0].table.len(), 3);
        assert_eq!(
            rt.context().current_window(),
            Some(minute_window(9, 31))
        );
    }

    #[test]
    fn test_bad_messages_are_dropped() {
        let sink = MemorySink::new();
        let mut rt = runtime(&sink);
        let listener = LiveListener::new("US", Frequency::Minutes(1));

        let outcome = listener.handle_message(&mut rt, "data|region|US|period|notatime", "{}");
        assert!(matches!(outcome, ListenOutcome::Dropped(ParseError::Timestamp(_))));

        let outcome = listener.handle_message(&mut rt, "data|region|US|period|20231002T0930", "[1,2");
        assert!(matches!(outcome, ListenOutcome::Dropped(ParseError::Payload(_))));

        let outcome = listener.handle_message(&mut rt, "data|region|EU|period|20231002T0930", "{}");
        assert!(matches!(outcome, ListenOutcome::Dropped(ParseError::Topic(_))));

        // still serving
        let outcome = listener.handle_message(&mut rt, "data|region|US|period|20231002T0930", "{}");
        assert!(outcome.is_processed());
        assert_eq!(sink.len(), 1);
    }
}
