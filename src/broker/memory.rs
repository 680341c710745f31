//! In-memory broker for testing and single-process use
//!
//! Keys expire against the configured `Clock`, so lease behaviour can be
//! tested without sleeping. Accepted publishes are kept in a bounded log
//! that tests can inspect, and faults can be injected per channel. A
//! `detached` broker keeps no log at all.

use super::{Broker, BrokerMessage, BrokerSubscription};
use crate::clock::{Clock, SystemClock};
use crate::error::{BeaconError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Capacity of the in-process broadcast bus
const BUS_CAPACITY: usize = 1024;

/// Publishes retained for inspection, oldest dropped first
pub const PUBLISH_LOG_CAPACITY: usize = 4096;

#[derive(Debug)]
struct Entry<T> {
    value: T,
    expires_at: Option<u64>,
}

impl<T> Entry<T> {
    fn live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, Entry<String>>,
    sets: HashMap<String, Entry<HashSet<String>>>,
    published: VecDeque<BrokerMessage>,
    failing_channels: HashSet<String>,
    unavailable: bool,
}

impl MemoryState {
    fn purge(&mut self, now: u64) {
        self.values.retain(|_, e| e.live(now));
        self.sets.retain(|_, e| e.live(now) && !e.value.is_empty());
    }
}

/// In-memory broker
pub struct MemoryBroker {
    clock: Arc<dyn Clock>,
    log_capacity: usize,
    state: Mutex<MemoryState>,
    bus: broadcast::Sender<BrokerMessage>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryBroker {
    /// Create a broker whose key expiry follows `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            clock,
            log_capacity: PUBLISH_LOG_CAPACITY,
            state: Mutex::new(MemoryState::default()),
            bus,
        }
    }

    /// Long-running broker for a process with no Redis: system clock, and
    /// nothing retained after delivery
    pub fn detached() -> Self {
        Self::new(Arc::new(SystemClock)).with_log_capacity(0)
    }

    /// Keep at most `capacity` publishes in the log (0 disables it)
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Make every subsequent publish to `channel` fail
    pub fn fail_channel(&self, channel: impl Into<String>) {
        self.lock().failing_channels.insert(channel.into());
    }

    /// Simulate the whole broker going down (or coming back)
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Logged publishes, oldest first
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.lock().published.iter().cloned().collect()
    }

    /// Accepted publishes on one channel, oldest first
    pub fn published_on(&self, channel: &str) -> Vec<BrokerMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    /// Forget the publish log
    pub fn clear_published(&self) {
        self.lock().published.clear();
    }

    /// Remaining time-to-live of a key, if it exists and expires
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let state = self.lock();
        let expires_at = state
            .values
            .get(key)
            .filter(|e| e.live(now))
            .and_then(|e| e.expires_at)
            .or_else(|| {
                state
                    .sets
                    .get(key)
                    .filter(|e| e.live(now))
                    .and_then(|e| e.expires_at)
            })?;
        Some(Duration::from_millis(expires_at.saturating_sub(now)))
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        if state.unavailable {
            return Err(BeaconError::Connection("memory broker unavailable".to_string()));
        }
        state.purge(now);
        Ok(state)
    }

    fn expiry(&self, ttl: Duration) -> Option<u64> {
        Some(self.clock.now_millis() + ttl.as_millis() as u64)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let message = BrokerMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        {
            let mut state = self.live_state()?;
            if state.failing_channels.contains(channel) {
                return Err(BeaconError::Publish {
                    channel: channel.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            if self.log_capacity > 0 {
                if state.published.len() >= self.log_capacity {
                    state.published.pop_front();
                }
                state.published.push_back(message.clone());
            }
        }

        // No receivers is not an error for pub/sub
        let _ = self.bus.send(message);
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn BrokerSubscription>> {
        drop(self.live_state()?);
        Ok(Box::new(MemorySubscription {
            channels: channels.iter().cloned().collect(),
            stream: BroadcastStream::new(self.bus.subscribe()),
        }))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl);
        let mut state = self.live_state()?;
        state.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.live_state()?;
        Ok(state.values.get(key).map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut state = self.live_state()?;
        state.values.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.live_state()?;
        state
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: HashSet::new(),
                expires_at: None,
            })
            .value
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.live_state()?;
        if let Some(entry) = state.sets.get_mut(key) {
            entry.value.remove(member);
            if entry.value.is_empty() {
                state.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let state = self.live_state()?;
        let mut members: Vec<String> = state
            .sets
            .get(key)
            .map(|e| e.value.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl);
        let mut state = self.live_state()?;
        if let Some(entry) = state.values.get_mut(key) {
            entry.expires_at = expires_at;
        }
        if let Some(entry) = state.sets.get_mut(key) {
            entry.expires_at = expires_at;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription over the in-process bus, filtered to its channels
pub struct MemorySubscription {
    channels: HashSet<String>,
    stream: BroadcastStream<BrokerMessage>,
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<BrokerMessage>> {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(message) if self.channels.contains(&message.channel) => {
                    return Ok(Some(message));
                }
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Memory subscription lagged, messages dropped");
                }
            }
        }
        Ok(None)
    }
}
