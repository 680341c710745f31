//! Event fanout: one logical event, several channels and payload shapes
//!
//! `EventFanout::publish` attempts the primary channel, the generic event-store
//! channel, and (for translated kinds) the legacy channel. Each write is
//! isolated: a failure on one never prevents or fails the others, and nothing
//! is surfaced to the caller beyond the returned `FanoutReceipt`.

use crate::broker::Broker;
use crate::clock::Clock;
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::types::{project_name, EventKind, NotificationKind, NotificationStyle};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Per-channel outcome of one fanout publish
#[derive(Debug)]
pub struct FanoutReceipt {
    pub primary: Result<()>,
    pub event_store: Result<()>,
    /// `None` when the kind has no legacy translation
    pub legacy: Option<Result<()>>,
}

impl FanoutReceipt {
    /// Whether every attempted channel accepted the write
    pub fn is_complete(&self) -> bool {
        self.primary.is_ok()
            && self.event_store.is_ok()
            && self.legacy.as_ref().map_or(true, |r| r.is_ok())
    }
}

/// A human-facing alert
#[derive(Debug, Clone)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub style: NotificationStyle,
}

impl Notification {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
        style: NotificationStyle,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind,
            style,
        }
    }
}

/// Multi-channel publisher over a `Broker`
pub struct EventFanout {
    broker: Arc<dyn Broker>,
    channels: ChannelConfig,
    source: String,
    clock: Arc<dyn Clock>,
}

impl EventFanout {
    pub fn new(
        broker: Arc<dyn Broker>,
        channels: ChannelConfig,
        source: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            channels,
            source: source.into(),
            clock,
        }
    }

    pub fn channels(&self) -> &ChannelConfig {
        &self.channels
    }

    /// Publish one event to every destination it maps to
    pub async fn publish(&self, kind: EventKind, workspace_path: &str, data: Value) -> FanoutReceipt {
        let timestamp = self.clock.now_millis();

        let primary_payload = primary_payload(kind, timestamp, workspace_path, &data);
        let primary = self.send(&self.channels.primary, &primary_payload).await;

        let store_payload = event_store_payload(
            kind,
            timestamp,
            &self.channels.primary,
            workspace_path,
            &data,
        );
        let event_store = self.send(&self.channels.event_store, &store_payload).await;

        let legacy = match kind.legacy_name() {
            Some(name) => {
                let payload =
                    legacy_payload(name, timestamp, &self.source, workspace_path, &data);
                Some(self.send(&self.channels.legacy, &payload).await)
            }
            None => None,
        };

        tracing::debug!(
            event_type = %kind,
            path = %workspace_path,
            primary_ok = primary.is_ok(),
            event_store_ok = event_store.is_ok(),
            legacy_ok = ?legacy.as_ref().map(|r| r.is_ok()),
            "Event fanned out"
        );

        FanoutReceipt {
            primary,
            event_store,
            legacy,
        }
    }

    /// Publish a human-facing notification on the notifications channel
    pub async fn publish_notification(
        &self,
        notification: &Notification,
        workspace_path: &str,
    ) -> Result<()> {
        let payload = json!({
            "title": notification.title,
            "message": notification.message,
            "kind": notification.kind,
            "style": notification.style,
            "workspacePath": workspace_path,
            "projectName": project_name(workspace_path),
            "timestamp": self.clock.now_millis(),
        });
        self.send(&self.channels.notifications, &payload).await
    }

    async fn send(&self, channel: &str, payload: &Value) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        let result = self.broker.publish(channel, &body).await;
        if let Err(e) = &result {
            tracing::warn!(channel = %channel, error = %e, "Publish failed, continuing");
        }
        result
    }
}

/// `{type, timestamp, path}` merged with the fields of `data`
///
/// Unlike an object spread, a data field named `type`, `timestamp` or `path`
/// never replaces the envelope value.
fn primary_payload(kind: EventKind, timestamp: u64, path: &str, data: &Value) -> Value {
    let mut payload = Map::new();
    payload.insert("type".to_string(), json!(kind.as_str()));
    payload.insert("timestamp".to_string(), json!(timestamp));
    payload.insert("path".to_string(), json!(path));
    match data {
        Value::Object(fields) => {
            for (key, value) in fields {
                // Envelope fields win over same-named data fields
                payload.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Value::Null => {}
        other => {
            payload.insert("data".to_string(), other.clone());
        }
    }
    Value::Object(payload)
}

/// `{timestamp, channel, event_type, workspace_path, data}` with `data` as an opaque JSON string
fn event_store_payload(
    kind: EventKind,
    timestamp: u64,
    channel: &str,
    path: &str,
    data: &Value,
) -> Value {
    json!({
        "timestamp": timestamp,
        "channel": channel,
        "event_type": kind.as_str(),
        "workspace_path": path,
        "data": data.to_string(),
    })
}

/// Legacy consumers expect `event`/`cwd`/`session_id` and a `source` tag
fn legacy_payload(name: &str, timestamp: u64, source: &str, path: &str, data: &Value) -> Value {
    json!({
        "event": name,
        "timestamp": timestamp,
        "source": source,
        "cwd": path,
        "project": project_name(path),
        "session_id": data.get("sessionId").cloned().unwrap_or(Value::Null),
        "data": data,
    })
}
