//! Window Broadcast
//!
//! The live path publishes each window's [`DataSet`] on a topic derived from
//! region and window start:
//!
//! ```text
//! data|region|<region>|period|<YYYYMMDDThhmm>
//! ```
//!
//! The payload is a JSON object `{source: [row records...]}`. Subscribers
//! match with the pattern `data|region|<region>|period|*`. With an archive
//! directory configured, the identical payload is also written to
//! `<archive_dir>/region_<region>_period_<YYYYMMDDThhmm>.json`.

use crate::dispatch::error::{ParseError, TransportError};
use crate::dispatch::table::{encode_dataset, DataSet};
use crate::dispatch::window::{parse_compact_stamp, Window, COMPACT_FORMAT};
use chrono::NaiveDateTime;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use redis::{Commands, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const TOPIC_PREFIX: &str = "data|region|";
const PERIOD_SEGMENT: &str = "|period|";

/// Topic for a region and window start.
pub fn topic_for(region: &str, start: NaiveDateTime) -> String {
    format!(
        "{}{}{}{}",
        TOPIC_PREFIX,
        region,
        PERIOD_SEGMENT,
        start.format(COMPACT_FORMAT)
    )
}

/// Pattern matching every window topic of a region.
pub fn topic_pattern(region: &str) -> String {
    format!("{}{}{}*", TOPIC_PREFIX, region, PERIOD_SEGMENT)
}

/// Split a topic into `(region, window start)`.
pub fn parse_topic(topic: &str) -> Result<(String, NaiveDateTime), ParseError> {
    let rest = topic
        .strip_prefix(TOPIC_PREFIX)
        .ok_or_else(|| ParseError::Topic(topic.to_string()))?;
    let (region, stamp) = rest
        .rsplit_once(PERIOD_SEGMENT)
        .ok_or_else(|| ParseError::Topic(topic.to_string()))?;
    if region.is_empty() {
        return Err(ParseError::Topic(topic.to_string()));
    }
    let start = parse_compact_stamp(stamp).ok_or_else(|| ParseError::Timestamp(stamp.to_string()))?;
    Ok((region.to_string(), start))
}

pub fn archive_path(archive_dir: &Path, region: &str, start: NaiveDateTime) -> PathBuf {
    archive_dir.join(format!(
        "region_{}_period_{}.json",
        region,
        start.format(COMPACT_FORMAT)
    ))
}

// =============================================================================
// PUBLISHERS
// =============================================================================

/// Pub/sub transport for window payloads.
pub trait Publisher: Send {
    /// Publish once. Returns the number of subscribers that received it.
    fn publish(&mut self, topic: &str, payload: &str) -> Result<usize, TransportError>;

    fn name(&self) -> &str;
}

/// Redis `PUBLISH`.
pub struct RedisPublisher {
    client: redis::Client,
    conn: Option<Connection>,
}

impl RedisPublisher {
    pub fn new(redis_url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            conn: None,
        })
    }
}

impl Publisher for RedisPublisher {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<usize, TransportError> {
        if self.conn.is_none() {
            self.conn = Some(self.client.get_connection()?);
            debug!("Redis publisher connected");
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };
        match conn.publish::<_, _, usize>(topic, payload) {
            Ok(receivers) => Ok(receivers),
            Err(e) => {
                self.conn = None;
                Err(e.into())
            }
        }
    }

    fn name(&self) -> &str {
        "redis"
    }
}

/// One message seen on the in-memory bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<(String, Sender<BusMessage>)>,
    /// `None` unless recording was asked for.
    history: Option<Vec<BusMessage>>,
}

/// In-process pub/sub with the same pattern rules as the Redis path
/// (a trailing `*` matches any suffix). Clones share the bus.
///
/// Meant for tests and single-process wiring. Nothing is retained after
/// delivery unless the bus was built with [`MemoryBus::recording`], which
/// keeps every message for the life of the bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that also keeps every published message for [`history`].
    ///
    /// [`history`]: MemoryBus::history
    pub fn recording() -> Self {
        let bus = Self::default();
        bus.state.lock().history = Some(Vec::new());
        bus
    }

    /// Subscribe to topics matching `pattern`. Dropping the receiver
    /// unsubscribes on the next publish.
    pub fn psubscribe(&self, pattern: impl Into<String>) -> Receiver<BusMessage> {
        let (tx, rx) = unbounded();
        self.state.lock().subscribers.push((pattern.into(), tx));
        rx
    }

    /// Every message published so far, in order. Always empty on a bus that
    /// is not recording.
    pub fn history(&self) -> Vec<BusMessage> {
        self.state.lock().history.clone().unwrap_or_default()
    }
}

fn pattern_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

impl Publisher for MemoryBus {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<usize, TransportError> {
        let message = BusMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        let mut state = self.state.lock();
        let mut delivered = 0;
        state.subscribers.retain(|(pattern, tx)| {
            if !pattern_matches(pattern, topic) {
                return true;
            }
            match tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        if let Some(history) = state.history.as_mut() {
            history.push(message);
        }
        Ok(delivered)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

/// Publishes window datasets for one region.
pub struct BroadcastChannel {
    region: String,
    publisher: Box<dyn Publisher>,
    archive_dir: Option<PathBuf>,
}

impl BroadcastChannel {
    pub fn new(region: impl Into<String>, publisher: Box<dyn Publisher>) -> Self {
        Self {
            region: region.into(),
            publisher,
            archive_dir: None,
        }
    }

    /// Also write every payload under `dir`.
    pub fn with_archive(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Publish `data` for `window` and archive it if enabled. Returns the
    /// topic used.
    pub fn publish(&mut self, window: &Window, data: &DataSet) -> Result<String, TransportError> {
        let topic = topic_for(&self.region, window.start);
        let payload = serde_json::to_string(&encode_dataset(data))?;

        let receivers = self.publisher.publish(&topic, &payload)?;
        info!(
            topic = %topic,
            region = %self.region,
            sources = data.len(),
            receivers,
            "Broadcast window data"
        );

        if let Some(dir) = &self.archive_dir {
            fs::create_dir_all(dir)?;
            let path = archive_path(dir, &self.region, window.start);
            fs::write(&path, payload.as_bytes())?;
            info!(path = %path.display(), "Archived live data");
        }
        Ok(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::data_source::{DataSource, SyntheticSource};
    use crate::dispatch::table::decode_dataset;
    use chrono::NaiveDate;

    fn window() -> Window {
        let start = NaiveDate::from_ymd_opt(2023, 10, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        Window::from_boundary(start, start + chrono::Duration::minutes(1)).unwrap()
    }

    #[test]
    fn test_topic_roundtrip() {
        let topic = topic_for("US", window().start);
        assert_eq!(topic, "data|region|US|period|20231002T0930");
        assert_eq!(parse_topic(&topic).unwrap(), ("US".to_string(), window().start));
        assert!(pattern_matches(&topic_pattern("US"), &topic));
        assert!(!pattern_matches(&topic_pattern("EU"), &topic));
    }

    #[test]
    fn test_parse_topic_rejects_garbage() {
        assert!(matches!(parse_topic("prices|US"), Err(ParseError::Topic(_))));
        assert!(matches!(
            parse_topic("data|region|US|period|yesterday"),
            Err(ParseError::Timestamp(_))
        ));
    }

    #[test]
    fn test_publish_delivers_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MemoryBus::new();
        let rx = bus.psubscribe(topic_pattern("US"));
        let other = bus.psubscribe(topic_pattern("EU"));

        let mut channel =
            BroadcastChannel::new("US", Box::new(bus.clone())).with_archive(dir.path().join("archive"));
        let data = SyntheticSource::new(vec!["market_data".to_string()]).load(&window());
        let topic = channel.publish(&window(), &data).unwrap();

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.topic, topic);
        assert!(other.try_recv().is_err());

        let decoded = decode_dataset(&msg.payload).unwrap();
        assert_eq!(decoded.keys().collect::<Vec<_>>(), vec!["market_data"]);
        assert_eq!(decoded["market_data"].len(), 3);

        let archived =
            fs::read_to_string(dir.path().join("archive/region_US_period_20231002T0930.json"))
                .unwrap();
        assert_eq!(archived, msg.payload);
    }

    #[test]
    fn test_duplicate_publish_is_legal() {
        let bus = MemoryBus::recording();
        let mut channel = BroadcastChannel::new("US", Box::new(bus.clone()));
        channel.publish(&window(), &DataSet::new()).unwrap();
        channel.publish(&window(), &DataSet::new()).unwrap();
        assert_eq!(bus.history().len(), 2);
        assert_eq!(bus.history()[0], bus.history()[1]);
    }

    #[test]
    fn test_plain_bus_keeps_no_history() {
        let bus = MemoryBus::new();
        let rx = bus.psubscribe("data|region|US|period|*");
        let mut channel = BroadcastChannel::new("US", Box::new(bus.clone()));
        channel.publish(&window(), &DataSet::new()).unwrap();
        assert_eq!(rx.try_iter().count(), 1);
        assert!(bus.history().is_empty());
    }
}
