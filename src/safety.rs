//! Safety rule engine: veto risky tool calls before they run
//!
//! Rules are evaluated in registration order, independently of each other.
//! A failing `Block` rule makes the call disallowed; a failing `Warning` rule
//! is reported but never blocks. A rule that cannot be evaluated (broker
//! outage, etc.) counts as a pass.

use crate::config::SafetyConfig;
use crate::error::Result;
use crate::fanout::{EventFanout, Notification};
use crate::sessions::SessionDirectory;
use crate::types::{EventKind, NotificationKind, NotificationStyle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Tools that modify the workspace
const MUTATING_TOOLS: &[&str] = &["write", "edit", "bash"];

/// How a failing rule is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Block,
}

/// Everything a rule may look at
#[derive(Debug, Clone, Default)]
pub struct SafetyContext {
    pub workspace_path: String,
    pub session_id: Option<String>,
    pub tool: String,
    pub command: Option<String>,
    pub branch: Option<String>,
    pub has_uncommitted_changes: bool,
}

impl SafetyContext {
    pub fn is_mutating(&self) -> bool {
        MUTATING_TOOLS
            .iter()
            .any(|t| self.tool.eq_ignore_ascii_case(t))
    }
}

/// Outcome of one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleVerdict {
    Pass,
    Fail(String),
}

/// A single independent, stateless check
#[async_trait]
pub trait SafetyRule: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    fn severity(&self) -> Severity;

    async fn check(&self, ctx: &SafetyContext) -> Result<RuleVerdict>;
}

/// A failed rule, as reported to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyFinding {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
}

/// Aggregate result of `check_safety`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyReport {
    pub allowed: bool,
    pub warnings: Vec<SafetyFinding>,
    pub blocked: Vec<SafetyFinding>,
}

impl SafetyReport {
    pub fn allow_all() -> Self {
        Self {
            allowed: true,
            warnings: Vec::new(),
            blocked: Vec::new(),
        }
    }
}

/// Ordered rule list plus optional event emission
pub struct SafetyEngine {
    rules: Vec<Box<dyn SafetyRule>>,
    fanout: Option<Arc<EventFanout>>,
}

impl SafetyEngine {
    /// An engine with no rules
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fanout: None,
        }
    }

    /// The standard rule set, in evaluation order
    pub fn with_default_rules(config: &SafetyConfig, sessions: Arc<SessionDirectory>) -> Self {
        let mut engine = Self::new();
        engine.add_rule(ProtectedBranchRule::new(config.protected_branches.clone()));
        engine.add_rule(UncommittedChangesRule::new(config.require_clean_branch));
        engine.add_rule(DestructiveCommandRule::new(config.dangerous_commands.clone()));
        engine.add_rule(MaxConcurrentSessionsRule::new(
            config.max_concurrent_sessions,
            sessions,
        ));
        engine
    }

    /// Broadcast findings through `fanout`
    pub fn with_fanout(mut self, fanout: Arc<EventFanout>) -> Self {
        self.fanout = Some(fanout);
        self
    }

    pub fn add_rule(&mut self, rule: impl SafetyRule + 'static) {
        self.rules.push(Box::new(rule));
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Evaluate every rule against `ctx`
    pub async fn check_safety(&self, ctx: &SafetyContext) -> SafetyReport {
        let mut report = SafetyReport::allow_all();

        for rule in &self.rules {
            let message = match rule.check(ctx).await {
                Ok(RuleVerdict::Pass) => continue,
                Ok(RuleVerdict::Fail(message)) => message,
                Err(e) => {
                    tracing::warn!(
                        rule = %rule.id(),
                        error = %e,
                        "Safety rule could not be evaluated, treating as pass"
                    );
                    continue;
                }
            };

            let finding = SafetyFinding {
                rule_id: rule.id().to_string(),
                severity: rule.severity(),
                message,
            };
            self.emit(ctx, &finding).await;

            match finding.severity {
                Severity::Block => report.blocked.push(finding),
                Severity::Warning => report.warnings.push(finding),
            }
        }

        report.allowed = report.blocked.is_empty();
        if !report.allowed {
            tracing::info!(
                tool = %ctx.tool,
                blocked = report.blocked.len(),
                "Tool call blocked by safety rules"
            );
        }
        report
    }

    async fn emit(&self, ctx: &SafetyContext, finding: &SafetyFinding) {
        let Some(fanout) = &self.fanout else {
            return;
        };

        let data = json!({
            "sessionId": ctx.session_id,
            "ruleId": finding.rule_id,
            "severity": finding.severity,
            "message": finding.message,
            "tool": ctx.tool,
        });

        match finding.severity {
            Severity::Block => {
                fanout
                    .publish(EventKind::SafetyBlocked, &ctx.workspace_path, data)
                    .await;
                let notification = Notification::new(
                    "Action blocked",
                    finding.message.clone(),
                    NotificationKind::Safety,
                    NotificationStyle::Error,
                );
                if let Err(e) = fanout
                    .publish_notification(&notification, &ctx.workspace_path)
                    .await
                {
                    tracing::debug!(error = %e, rule = %finding.rule_id, "Safety notification dropped");
                }
            }
            Severity::Warning => {
                fanout
                    .publish(EventKind::SafetyWarning, &ctx.workspace_path, data)
                    .await;
            }
        }
    }
}

impl Default for SafetyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks mutating tools on protected branches
pub struct ProtectedBranchRule {
    branches: Vec<String>,
}

impl ProtectedBranchRule {
    pub fn new(branches: Vec<String>) -> Self {
        Self { branches }
    }
}

#[async_trait]
impl SafetyRule for ProtectedBranchRule {
    fn id(&self) -> &str {
        "protected-branch"
    }

    fn description(&self) -> &str {
        "Prevent write/edit/bash on protected branches"
    }

    fn severity(&self) -> Severity {
        Severity::Block
    }

    async fn check(&self, ctx: &SafetyContext) -> Result<RuleVerdict> {
        let Some(branch) = ctx.branch.as_deref() else {
            return Ok(RuleVerdict::Pass);
        };
        if ctx.is_mutating() && self.branches.iter().any(|b| b == branch) {
            return Ok(RuleVerdict::Fail(format!(
                "'{}' is not allowed on protected branch '{}'",
                ctx.tool, branch
            )));
        }
        Ok(RuleVerdict::Pass)
    }
}

/// Blocks any tool on a dirty tree when a clean branch is required
pub struct UncommittedChangesRule {
    require_clean: bool,
}

impl UncommittedChangesRule {
    pub fn new(require_clean: bool) -> Self {
        Self { require_clean }
    }
}

#[async_trait]
impl SafetyRule for UncommittedChangesRule {
    fn id(&self) -> &str {
        "uncommitted-changes"
    }

    fn description(&self) -> &str {
        "Require a clean working tree before any tool runs"
    }

    fn severity(&self) -> Severity {
        Severity::Block
    }

    async fn check(&self, ctx: &SafetyContext) -> Result<RuleVerdict> {
        if self.require_clean && ctx.has_uncommitted_changes {
            return Ok(RuleVerdict::Fail(
                "workspace has uncommitted changes".to_string(),
            ));
        }
        Ok(RuleVerdict::Pass)
    }
}

/// Blocks bash commands containing a dangerous substring
///
/// Plain substring match: `echo "sudo rm"` is blocked just like `sudo rm x`.
pub struct DestructiveCommandRule {
    patterns: Vec<String>,
}

impl DestructiveCommandRule {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

#[async_trait]
impl SafetyRule for DestructiveCommandRule {
    fn id(&self) -> &str {
        "destructive-command"
    }

    fn description(&self) -> &str {
        "Block shell commands containing known destructive fragments"
    }

    fn severity(&self) -> Severity {
        Severity::Block
    }

    async fn check(&self, ctx: &SafetyContext) -> Result<RuleVerdict> {
        if !ctx.tool.eq_ignore_ascii_case("bash") {
            return Ok(RuleVerdict::Pass);
        }
        let Some(command) = ctx.command.as_deref() else {
            return Ok(RuleVerdict::Pass);
        };
        match self.patterns.iter().find(|p| command.contains(p.as_str())) {
            Some(pattern) => Ok(RuleVerdict::Fail(format!(
                "command contains destructive fragment '{}'",
                pattern
            ))),
            None => Ok(RuleVerdict::Pass),
        }
    }
}

/// Warns when too many sessions are active in one workspace
pub struct MaxConcurrentSessionsRule {
    max: usize,
    sessions: Arc<SessionDirectory>,
}

impl MaxConcurrentSessionsRule {
    pub fn new(max: usize, sessions: Arc<SessionDirectory>) -> Self {
        Self { max, sessions }
    }
}

#[async_trait]
impl SafetyRule for MaxConcurrentSessionsRule {
    fn id(&self) -> &str {
        "max-concurrent-sessions"
    }

    fn description(&self) -> &str {
        "Limit concurrently active sessions per workspace"
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    async fn check(&self, ctx: &SafetyContext) -> Result<RuleVerdict> {
        if self.max == 0 {
            return Ok(RuleVerdict::Pass);
        }
        let others = match self
            .sessions
            .count_active(&ctx.workspace_path, ctx.session_id.as_deref())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::debug!(error = %e, "Session directory unavailable, skipping concurrency check");
                return Ok(RuleVerdict::Pass);
            }
        };
        if others >= self.max {
            return Ok(RuleVerdict::Fail(format!(
                "{} other sessions already active in this workspace (max {})",
                others, self.max
            )));
        }
        Ok(RuleVerdict::Pass)
    }
}
