//! Workspace inspection for safety checks
//!
//! Supplies the branch and dirty state the safety rules evaluate. Inspection
//! failures mean "unknown": no branch, clean tree.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Source of version-control facts about a workspace
#[async_trait]
pub trait WorkspaceInspector: Send + Sync {
    /// Currently checked-out branch, if known
    async fn branch(&self, workspace_path: &str) -> Option<String>;

    /// Whether the working tree has uncommitted changes
    async fn is_dirty(&self, workspace_path: &str) -> bool;
}

/// Inspector that asks the `git` CLI
#[derive(Debug, Default, Clone, Copy)]
pub struct GitInspector;

impl GitInspector {
    async fn git(workspace_path: &str, args: &[&str]) -> Option<String> {
        if !Path::new(workspace_path).is_dir() {
            return None;
        }
        let output = Command::new("git")
            .args(args)
            .current_dir(workspace_path)
            .output()
            .await
            .map_err(|e| tracing::debug!(error = %e, "git unavailable"))
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl WorkspaceInspector for GitInspector {
    async fn branch(&self, workspace_path: &str) -> Option<String> {
        Self::git(workspace_path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .filter(|b| !b.is_empty() && b != "HEAD")
    }

    async fn is_dirty(&self, workspace_path: &str) -> bool {
        Self::git(workspace_path, &["status", "--porcelain"])
            .await
            .is_some_and(|out| !out.is_empty())
    }
}

/// Inspector returning fixed answers
#[derive(Debug, Default, Clone)]
pub struct StaticInspector {
    pub branch: Option<String>,
    pub dirty: bool,
}

impl StaticInspector {
    pub fn new(branch: Option<&str>, dirty: bool) -> Self {
        Self {
            branch: branch.map(str::to_string),
            dirty,
        }
    }
}

#[async_trait]
impl WorkspaceInspector for StaticInspector {
    async fn branch(&self, _workspace_path: &str) -> Option<String> {
        self.branch.clone()
    }

    async fn is_dirty(&self, _workspace_path: &str) -> bool {
        self.dirty
    }
}
