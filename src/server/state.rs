use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::types::{HealthReport, StatusSnapshot};

/// Provider of the authoritative in-memory status
pub trait StatusSource: Send + Sync {
    fn status_snapshot(&self) -> Result<StatusSnapshot>;
}

/// Shared application state accessible to all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn StatusSource>,
    pub workspace_path: Arc<str>,
    pub pid: u32,
    pub port: u16,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(source: Arc<dyn StatusSource>, workspace_path: &str, pid: u32, port: u16) -> Self {
        Self {
            source,
            workspace_path: Arc::from(workspace_path),
            pid,
            port,
            started_at: Instant::now(),
        }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            ok: true,
            workspace_path: self.workspace_path.to_string(),
            pid: self.pid,
            port: self.port,
            uptime: self.started_at.elapsed().as_secs(),
        }
    }
}
