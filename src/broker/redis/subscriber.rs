//! Redis pub/sub subscription

use crate::broker::{BrokerMessage, BrokerSubscription};
use crate::error::{BeaconError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Subscription backed by a dedicated Redis pub/sub connection
pub struct RedisSubscription {
    messages: BoxStream<'static, ::redis::Msg>,
}

impl RedisSubscription {
    pub(super) fn new(messages: BoxStream<'static, ::redis::Msg>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl BrokerSubscription for RedisSubscription {
    async fn next(&mut self) -> Result<Option<BrokerMessage>> {
        let Some(msg) = self.messages.next().await else {
            return Ok(None);
        };

        let channel = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload().map_err(|e| BeaconError::Subscribe {
            channel: channel.clone(),
            reason: format!("non-text payload: {}", e),
        })?;

        Ok(Some(BrokerMessage { channel, payload }))
    }
}
