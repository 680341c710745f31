//! Session directory: which sessions are active, across all instances
//!
//! Each instance keeps one `<prefix>:session:<id>` entry per live session and
//! lists the id in the workspace index `<prefix>:sessions:<base64(workspace)>`,
//! so the max-concurrent-sessions rule can count active sessions in a
//! workspace with one `SMEMBERS` instead of scanning the keyspace. Entries are
//! leased like presence records; an indexed id whose entry has expired is
//! skipped and dropped from the index.

use crate::broker::Broker;
use crate::error::Result;
use crate::presence::encode_workspace;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Occupancy of a session as seen by other instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionActivity {
    Active,
    Idle,
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    pub workspace_path: String,
    pub pid: u32,
    pub status: SessionActivity,
    pub updated_at: u64,
}

/// Broker-backed directory of session entries
pub struct SessionDirectory {
    broker: Arc<dyn Broker>,
    key_prefix: String,
    ttl: Duration,
}

impl SessionDirectory {
    pub fn new(broker: Arc<dyn Broker>, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            broker,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    /// `<prefix>:session:<id>`
    pub fn entry_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.key_prefix, session_id)
    }

    /// `<prefix>:sessions:<base64(workspace)>`
    pub fn index_key(&self, workspace_path: &str) -> String {
        format!(
            "{}:sessions:{}",
            self.key_prefix,
            encode_workspace(workspace_path)
        )
    }

    /// Create or overwrite an entry and index it, renewing both leases
    pub async fn upsert(&self, entry: &SessionEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        self.broker
            .set_ex(&self.entry_key(&entry.session_id), &json, self.ttl)
            .await?;

        let index = self.index_key(&entry.workspace_path);
        self.broker.sadd(&index, &entry.session_id).await?;
        self.broker.expire(&index, self.ttl).await
    }

    pub async fn remove(&self, workspace_path: &str, session_id: &str) -> Result<()> {
        self.broker.del(&self.entry_key(session_id)).await?;
        self.broker
            .srem(&self.index_key(workspace_path), session_id)
            .await
    }

    /// Every readable entry indexed under `workspace_path`
    pub async fn list(&self, workspace_path: &str) -> Result<Vec<SessionEntry>> {
        let index = self.index_key(workspace_path);
        let ids = self.broker.smembers(&index).await?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let key = self.entry_key(&id);
            let Some(json) = self.broker.get(&key).await? else {
                // Lease lapsed without a clean removal
                self.broker.srem(&index, &id).await?;
                continue;
            };
            match serde_json::from_str::<SessionEntry>(&json) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::debug!(key = %key, error = %e, "Skipping unreadable session entry"),
            }
        }
        Ok(entries)
    }

    /// Active sessions in `workspace_path`, excluding `except_session`
    pub async fn count_active(
        &self,
        workspace_path: &str,
        except_session: Option<&str>,
    ) -> Result<usize> {
        let entries = self.list(workspace_path).await?;
        Ok(entries
            .iter()
            .filter(|e| e.workspace_path == workspace_path)
            .filter(|e| e.status == SessionActivity::Active)
            .filter(|e| Some(e.session_id.as_str()) != except_session)
            .count())
    }
}
