//! Redis broker
//!
//! Implements `Broker` on top of the `redis` crate. Commands share one
//! auto-reconnecting `ConnectionManager`; each subscription opens its own
//! pub/sub connection.

mod config;
mod subscriber;

pub use config::RedisConfig;
pub use subscriber::RedisSubscription;

use crate::broker::{Broker, BrokerSubscription};
use crate::error::{BeaconError, Result};
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

/// Redis-backed broker
pub struct RedisBroker {
    client: ::redis::Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to Redis
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.url.as_str())
            .map_err(|e| BeaconError::Config(format!("invalid redis url: {}", e)))?;

        let conn = tokio::time::timeout(config.connect_timeout(), client.get_connection_manager())
            .await
            .map_err(|_| {
                BeaconError::Connection(format!(
                    "timed out after {}s connecting to redis",
                    config.connect_timeout_secs
                ))
            })?
            .map_err(|e| BeaconError::Connection(e.to_string()))?;

        tracing::info!("Connected to Redis");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.conn()
            .publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| BeaconError::Publish {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn BrokerSubscription>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            BeaconError::Subscribe {
                channel: channels.join(","),
                reason: e.to_string(),
            }
        })?;

        for channel in channels {
            pubsub
                .subscribe(channel.as_str())
                .await
                .map_err(|e| BeaconError::Subscribe {
                    channel: channel.clone(),
                    reason: e.to_string(),
                })?;
        }

        tracing::debug!(channels = ?channels, "Redis subscription established");
        Ok(Box::new(RedisSubscription::new(
            pubsub.into_on_message().boxed(),
        )))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.conn()
            .set_ex::<_, _, ()>(key, value, ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get::<_, Option<String>>(key).await?)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.conn().del::<_, ()>(key).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.conn().sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.conn().srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.conn().smembers::<_, Vec<String>>(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.conn()
            .expire::<_, ()>(key, ttl_secs(ttl) as i64)
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }
}
