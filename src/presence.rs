//! Presence registry: leased self-registration of running instances
//!
//! An instance writes `<prefix>:api:<base64(workspace)>:<pid>` with a short
//! TTL and re-writes it on a fixed cadence. Nothing ever has to clean up after
//! a crashed instance: its record simply stops being renewed and expires.
//! The per-workspace index set only lists candidates; a listed pid whose
//! record is gone is treated as not present.

use crate::broker::Broker;
use crate::config::LeaseConfig;
use crate::error::Result;
use crate::types::InstanceRecord;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Base64 form of a workspace path, as used in keys and channel names
pub fn encode_workspace(workspace_path: &str) -> String {
    BASE64.encode(workspace_path.as_bytes())
}

/// Leased registry of instance records
pub struct PresenceRegistry {
    broker: Arc<dyn Broker>,
    key_prefix: String,
    lease: LeaseConfig,
}

impl PresenceRegistry {
    pub fn new(broker: Arc<dyn Broker>, key_prefix: impl Into<String>, lease: LeaseConfig) -> Self {
        Self {
            broker,
            key_prefix: key_prefix.into(),
            lease,
        }
    }

    pub fn lease(&self) -> &LeaseConfig {
        &self.lease
    }

    /// `<prefix>:api:<base64(workspace)>:<pid>`
    pub fn instance_key(&self, workspace_path: &str, pid: u32) -> String {
        format!(
            "{}:api:{}:{}",
            self.key_prefix,
            encode_workspace(workspace_path),
            pid
        )
    }

    /// `<prefix>:instances:<base64(workspace)>`
    pub fn index_key(&self, workspace_path: &str) -> String {
        format!(
            "{}:instances:{}",
            self.key_prefix,
            encode_workspace(workspace_path)
        )
    }

    /// Write the instance record and add it to the workspace index
    pub async fn register(&self, record: &InstanceRecord) -> Result<()> {
        self.write_record(record).await?;

        let index = self.index_key(&record.workspace_path);
        self.broker
            .sadd(&index, &record.process_id.to_string())
            .await?;
        self.broker.expire(&index, self.lease.index_ttl()).await?;

        tracing::info!(
            workspace = %record.workspace_path,
            pid = record.process_id,
            port = record.port,
            "Instance registered"
        );
        Ok(())
    }

    /// Renew the lease on an instance record
    pub async fn refresh(&self, record: &InstanceRecord) -> Result<()> {
        self.write_record(record).await?;
        // Re-adding heals an index that expired or was trimmed under us
        let index = self.index_key(&record.workspace_path);
        self.broker
            .sadd(&index, &record.process_id.to_string())
            .await?;
        self.broker.expire(&index, self.lease.index_ttl()).await
    }

    /// Delete the instance record, then drop it from the index
    pub async fn unregister(&self, workspace_path: &str, pid: u32) -> Result<()> {
        self.broker
            .del(&self.instance_key(workspace_path, pid))
            .await?;
        self.broker
            .srem(&self.index_key(workspace_path), &pid.to_string())
            .await?;

        tracing::info!(workspace = %workspace_path, pid, "Instance unregistered");
        Ok(())
    }

    /// Fetch one instance record, if its lease is still live
    pub async fn get(&self, workspace_path: &str, pid: u32) -> Result<Option<InstanceRecord>> {
        let raw = self
            .broker
            .get(&self.instance_key(workspace_path, pid))
            .await?;
        Ok(raw.and_then(|json| match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!(pid, error = %e, "Ignoring unreadable instance record");
                None
            }
        }))
    }

    /// All live instances of a workspace
    ///
    /// Index entries whose record has expired are skipped.
    pub async fn instances(&self, workspace_path: &str) -> Result<Vec<InstanceRecord>> {
        let members = self.broker.smembers(&self.index_key(workspace_path)).await?;

        let mut records = Vec::with_capacity(members.len());
        for member in members {
            let Ok(pid) = member.parse::<u32>() else {
                continue;
            };
            if let Some(record) = self.get(workspace_path, pid).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Renew `record` every `lease.refresh_secs` until the handle is cancelled
    pub fn spawn_refresh(self: &Arc<Self>, record: InstanceRecord) -> LeaseHandle {
        let registry = Arc::clone(self);
        let period = self.lease.refresh();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = registry.refresh(&record).await {
                    tracing::warn!(
                        pid = record.process_id,
                        error = %e,
                        "Lease refresh failed, will retry next tick"
                    );
                }
            }
        });

        LeaseHandle { task: Some(task) }
    }

    async fn write_record(&self, record: &InstanceRecord) -> Result<()> {
        let key = self.instance_key(&record.workspace_path, record.process_id);
        let json = serde_json::to_string(record)?;
        self.broker.set_ex(&key, &json, self.lease.ttl()).await
    }
}

/// Handle to a running lease refresh task
pub struct LeaseHandle {
    task: Option<JoinHandle<()>>,
}

impl LeaseHandle {
    /// Stop refreshing and wait for the task to wind down
    pub async fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
