//! Broker trait: the narrow pub/sub + key/value surface the core depends on
//!
//! Every backend (Redis, in-memory) implements `Broker`. Delivery is
//! at-most-once with no ordering or durability guarantee; callers treat every
//! operation as best-effort and decide their own fail-open policy.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod redis;

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Core trait for broker backends
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to a channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a set of channels
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn BrokerSubscription>>;

    /// `SET key value EX ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `DEL key`
    async fn del(&self, key: &str) -> Result<()>;

    /// `SADD key member`
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// `SREM key member`
    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    /// `SMEMBERS key`
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// `EXPIRE key ttl`
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Backend name (e.g., "redis", "memory")
    fn name(&self) -> &str;

    /// Health check: returns true if the broker answers commands
    ///
    /// Default implementation issues a `GET` on a sentinel key.
    async fn health(&self) -> Result<bool> {
        self.get("__a3s_beacon_health__").await.map(|_| true)
    }
}

/// Async subscription handle for receiving channel messages
#[async_trait]
pub trait BrokerSubscription: Send {
    /// Receive the next message; `None` once the subscription is closed
    async fn next(&mut self) -> Result<Option<BrokerMessage>>;
}
