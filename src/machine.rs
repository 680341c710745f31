//! Session status state machine
//!
//! Consumes host signals, owns the canonical `SessionStatus` and
//! `SessionMetrics`, and drives every outward effect:
//!
//! - one `status.changed` broadcast per transition, published before the
//!   signal handler returns
//! - the detailed `session.idle` event, held back by the idle debounce and
//!   dropped entirely if work resumes inside the window
//! - a heartbeat that re-publishes the current snapshot on a fixed cadence
//! - safety checks ahead of tool execution
//!
//! State changes are computed under a short-lived lock as a list of
//! `Effect`s; the effects run after the lock is released, so no lock is ever
//! held across a broker call.

use crate::coordinator::CoordinatorContext;
use crate::debounce::IdleDebounce;
use crate::error::{BeaconError, Result};
use crate::fanout::Notification;
use crate::inspect::WorkspaceInspector;
use crate::safety::{SafetyContext, SafetyEngine, SafetyReport};
use crate::server::StatusSource;
use crate::sessions::{SessionActivity, SessionEntry};
use crate::signal::{HostSignal, ToolCall, Transition};
use crate::types::{
    EventKind, NotificationKind, NotificationStyle, SessionMetrics, SessionStatus, StatusSnapshot,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;

/// Status and metrics of the current session; created and dropped together
#[derive(Debug)]
struct ActiveSession {
    id: String,
    status: SessionStatus,
    metrics: SessionMetrics,
    work_started_at: Option<u64>,
}

impl ActiveSession {
    fn new(id: String) -> Self {
        Self {
            id,
            status: SessionStatus::Idle,
            metrics: SessionMetrics::default(),
            work_started_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct MachineState {
    session: Option<ActiveSession>,
    debounce: IdleDebounce,
    last_activity_time: u64,
}

impl MachineState {
    fn status(&self) -> SessionStatus {
        self.session
            .as_ref()
            .map_or(SessionStatus::Idle, |s| s.status)
    }

    fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }
}

#[derive(Default)]
struct Timers {
    heartbeat: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
}

/// Outward work decided under the state lock, executed after it
#[derive(Debug)]
enum Effect {
    Publish { kind: EventKind, data: Value },
    Notify(Notification),
    ArmDebounce { generation: u64 },
    CancelDebounce,
    SyncEntry(SessionEntry),
    RemoveEntry(String),
}

/// Orchestrator of one agent host's session status
pub struct SessionMachine {
    ctx: Arc<CoordinatorContext>,
    safety: SafetyEngine,
    inspector: Arc<dyn WorkspaceInspector>,
    state: Mutex<MachineState>,
    timers: Mutex<Timers>,
    closed: AtomicBool,
}

impl SessionMachine {
    pub fn new(
        ctx: Arc<CoordinatorContext>,
        safety: SafetyEngine,
        inspector: Arc<dyn WorkspaceInspector>,
    ) -> Arc<Self> {
        let last_activity_time = ctx.clock.now_millis();
        Arc::new(Self {
            ctx,
            safety,
            inspector,
            state: Mutex::new(MachineState {
                last_activity_time,
                ..Default::default()
            }),
            timers: Mutex::new(Timers::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.lock_state().status()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock_state().session_id().map(str::to_string)
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.lock_state()
            .session
            .as_ref()
            .map(|s| s.metrics.clone())
            .unwrap_or_default()
    }

    /// Whether an idle publication is waiting on the debounce window
    pub fn idle_pending(&self) -> bool {
        self.lock_state().debounce.is_pending()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handle one host signal
    ///
    /// Returns the safety verdict for `tool_before` signals, `None` otherwise.
    pub async fn handle(self: &Arc<Self>, signal: &HostSignal) -> Option<SafetyReport> {
        if self.is_closed() {
            tracing::debug!("Signal after shutdown ignored");
            return None;
        }

        let transition = signal.normalize();
        let session_id = signal.session_id();
        let effects = {
            let mut state = self.lock_state();
            self.apply(&mut state, session_id, transition)
        };
        self.run_effects(effects).await;

        match signal {
            HostSignal::ToolBefore { .. } => Some(match ToolCall::from_signal(signal) {
                Some(call) => self.check_tool(&call).await,
                None => SafetyReport::allow_all(),
            }),
            _ => None,
        }
    }

    /// Evaluate the safety rules for a tool call in the current session
    pub async fn check_tool(&self, call: &ToolCall) -> SafetyReport {
        let workspace = &self.ctx.workspace_path;
        let ctx = SafetyContext {
            workspace_path: workspace.clone(),
            session_id: self.session_id(),
            tool: call.tool.clone(),
            command: call.command.clone(),
            branch: self.inspector.branch(workspace).await,
            has_uncommitted_changes: self.inspector.is_dirty(workspace).await,
        };
        self.safety.check_safety(&ctx).await
    }

    /// Current status snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot_of(&self.lock_state())
    }

    /// Heartbeat body: the current snapshot, independent of change
    pub fn heartbeat_payload(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or(Value::Null)
    }

    /// Publish one heartbeat and renew the session's directory entry
    pub async fn heartbeat(&self) {
        if self.is_closed() {
            return;
        }
        let (payload, entry) = {
            let state = self.lock_state();
            let snapshot = self.snapshot_of(&state);
            (
                serde_json::to_value(&snapshot).unwrap_or(Value::Null),
                self.entry_of(&state),
            )
        };

        self.ctx
            .fanout
            .publish(EventKind::Heartbeat, &self.ctx.workspace_path, payload)
            .await;
        if let Some(entry) = entry {
            if let Err(e) = self.ctx.sessions.upsert(&entry).await {
                tracing::debug!(error = %e, "Session entry renewal failed");
            }
        }
    }

    /// Start the unconditional heartbeat
    pub fn start_heartbeat(self: &Arc<Self>) {
        let machine = Arc::downgrade(self);
        let period = self.ctx.config.timing.heartbeat();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(machine) = machine.upgrade() else {
                    break;
                };
                machine.heartbeat().await;
            }
        });

        if let Some(previous) = self.lock_timers().heartbeat.replace(task) {
            previous.abort();
        }
    }

    /// Stop both timers and drop the session's directory entry
    ///
    /// After this returns, no signal, timer, or heartbeat touches the broker.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (heartbeat, debounce) = {
            let mut timers = self.lock_timers();
            (timers.heartbeat.take(), timers.debounce.take())
        };
        for task in [heartbeat, debounce].into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }

        let session_id = {
            let mut state = self.lock_state();
            state.debounce.cancel();
            state.session_id().map(str::to_string)
        };
        if let Some(id) = session_id {
            if let Err(e) = self.ctx.sessions.remove(&self.ctx.workspace_path, &id).await {
                tracing::debug!(error = %e, "Session entry removal failed during shutdown");
            }
        }
        tracing::info!("Session machine stopped");
    }

    fn apply(
        &self,
        state: &mut MachineState,
        session_id: Option<&str>,
        transition: Transition,
    ) -> Vec<Effect> {
        if transition == Transition::Ignore {
            return Vec::new();
        }

        let now = self.ctx.clock.now_millis();
        let before = state.status();
        let mut effects = Vec::new();
        state.last_activity_time = now;

        match transition {
            Transition::Ignore => {}
            Transition::Begin => {
                self.begin(state, session_id.map(str::to_string), &mut effects);
            }
            Transition::Work => {
                self.ensure_session(state, session_id, &mut effects);
                if state.debounce.cancel() {
                    effects.push(Effect::CancelDebounce);
                }
                if let Some(session) = state.session.as_mut() {
                    session.status = SessionStatus::Working;
                    if session.work_started_at.is_none() {
                        session.work_started_at = Some(now);
                        effects.push(Effect::Publish {
                            kind: EventKind::SessionActive,
                            data: json!({
                                "sessionId": session.id,
                                "workStartedAt": now,
                                "projectName": self.ctx.project_name,
                            }),
                        });
                        effects.push(Effect::Notify(Notification::new(
                            "Work started",
                            format!("Agent in {} started working", self.ctx.project_name),
                            NotificationKind::WorkStarted,
                            NotificationStyle::Info,
                        )));
                    }
                }
            }
            Transition::Idle => {
                if before == SessionStatus::Working {
                    if let Some(session) = state.session.as_mut() {
                        session.status = SessionStatus::Idle;
                    }
                    let generation = state.debounce.arm(tokio::time::Instant::now());
                    effects.push(Effect::ArmDebounce { generation });
                }
            }
            Transition::PermissionAsked { title, permission } => {
                self.ensure_session(state, session_id, &mut effects);
                self.enter_waiting(state, &mut effects);
                let message = title
                    .clone()
                    .unwrap_or_else(|| "Permission requested".to_string());
                effects.push(Effect::Publish {
                    kind: EventKind::PermissionRequested,
                    data: json!({
                        "sessionId": state.session_id(),
                        "title": title,
                        "permission": permission,
                    }),
                });
                effects.push(Effect::Notify(Notification::new(
                    "Needs your input",
                    message,
                    NotificationKind::Permission,
                    NotificationStyle::Warning,
                )));
            }
            Transition::PermissionUpdated => {
                self.ensure_session(state, session_id, &mut effects);
                self.enter_waiting(state, &mut effects);
            }
            Transition::End => {
                let matches = match (session_id, state.session_id()) {
                    (Some(signalled), Some(current)) => signalled == current,
                    (None, Some(_)) => true,
                    (_, None) => false,
                };
                if matches {
                    if state.debounce.cancel() {
                        effects.push(Effect::CancelDebounce);
                    }
                    if let Some(session) = state.session.take() {
                        effects.push(Effect::Publish {
                            kind: EventKind::SessionDeleted,
                            data: json!({
                                "sessionId": session.id,
                                "metrics": session.metrics,
                                "workStartedAt": session.work_started_at,
                            }),
                        });
                        effects.push(Effect::Notify(Notification::new(
                            "Work stopped",
                            format!("Session in {} ended", self.ctx.project_name),
                            NotificationKind::WorkStopped,
                            NotificationStyle::Info,
                        )));
                        effects.push(Effect::RemoveEntry(session.id));
                    }
                }
            }
            Transition::ToolCompleted { tool } => {
                self.ensure_session(state, session_id, &mut effects);
                if let Some(session) = state.session.as_mut() {
                    session.metrics.record_tool(&tool);
                }
            }
            Transition::Error { message } => {
                effects.push(Effect::Publish {
                    kind: EventKind::SessionError,
                    data: json!({
                        "sessionId": session_id.or(state.session_id()),
                        "error": message,
                    }),
                });
                effects.push(Effect::Notify(Notification::new(
                    "Session error",
                    message.unwrap_or_else(|| "The agent reported an error".to_string()),
                    NotificationKind::Error,
                    NotificationStyle::Error,
                )));
            }
            Transition::Compacted => {
                effects.push(Effect::Publish {
                    kind: EventKind::SessionCompacted,
                    data: json!({ "sessionId": session_id.or(state.session_id()) }),
                });
            }
        }

        let after = state.status();
        if before != after {
            tracing::debug!(from = %before, to = %after, "Session status transition");
            if let Some(entry) = self.entry_of(state) {
                effects.push(Effect::SyncEntry(entry));
            }
            let snapshot = self.snapshot_of(state);
            effects.insert(
                0,
                Effect::Publish {
                    kind: EventKind::StatusChanged,
                    data: status_changed_data(before, &snapshot),
                },
            );
        }
        effects
    }

    /// Replace the current session with a fresh one
    fn begin(&self, state: &mut MachineState, id: Option<String>, effects: &mut Vec<Effect>) {
        let id = id.unwrap_or_else(|| format!("ses-{}", uuid::Uuid::new_v4()));
        if state.debounce.cancel() {
            effects.push(Effect::CancelDebounce);
        }
        if let Some(previous) = state.session.take() {
            effects.push(Effect::RemoveEntry(previous.id));
        }

        tracing::info!(session_id = %id, "Session started");
        state.session = Some(ActiveSession::new(id.clone()));
        effects.push(Effect::Publish {
            kind: EventKind::SessionStarted,
            data: json!({
                "sessionId": id,
                "projectName": self.ctx.project_name,
            }),
        });
        if let Some(entry) = self.entry_of(state) {
            effects.push(Effect::SyncEntry(entry));
        }
    }

    /// Begin a session if there is none, or if the signal names a different one
    fn ensure_session(
        &self,
        state: &mut MachineState,
        session_id: Option<&str>,
        effects: &mut Vec<Effect>,
    ) {
        let needs_new = match (session_id, state.session_id()) {
            (_, None) => true,
            (Some(signalled), Some(current)) => signalled != current,
            (None, Some(_)) => false,
        };
        if needs_new {
            self.begin(state, session_id.map(str::to_string), effects);
        }
    }

    fn enter_waiting(&self, state: &mut MachineState, effects: &mut Vec<Effect>) {
        if state.debounce.cancel() {
            effects.push(Effect::CancelDebounce);
        }
        if let Some(session) = state.session.as_mut() {
            session.status = SessionStatus::Waiting;
        }
    }

    /// Timer callback: publish the detailed idle event if still warranted
    async fn on_debounce_elapsed(self: Arc<Self>, generation: u64) {
        if self.is_closed() {
            return;
        }
        let effects = {
            let mut state = self.lock_state();
            if state.debounce.fire(generation).is_none() {
                return;
            }
            // Work may have resumed since the timer was armed
            if state.status() != SessionStatus::Idle {
                return;
            }
            let now = self.ctx.clock.now_millis();
            let Some(session) = state.session.as_mut() else {
                return;
            };
            let work_started_at = session.work_started_at.take();
            let data = json!({
                "sessionId": session.id,
                "status": SessionStatus::Idle,
                "metrics": session.metrics,
                "workStartedAt": work_started_at,
                "workDurationMs": work_started_at.map(|at| now.saturating_sub(at)),
                "projectName": self.ctx.project_name,
            });
            vec![
                Effect::Publish {
                    kind: EventKind::SessionIdle,
                    data,
                },
                Effect::Notify(Notification::new(
                    "Ready for input",
                    format!("Agent in {} finished working", self.ctx.project_name),
                    NotificationKind::WorkStopped,
                    NotificationStyle::Success,
                )),
            ]
        };
        self.run_effects(effects).await;
    }

    async fn run_effects(self: &Arc<Self>, effects: Vec<Effect>) {
        let workspace = &self.ctx.workspace_path;
        for effect in effects {
            match effect {
                Effect::Publish { kind, data } => {
                    self.ctx.fanout.publish(kind, workspace, data).await;
                }
                Effect::Notify(notification) => {
                    if let Err(e) = self
                        .ctx
                        .fanout
                        .publish_notification(&notification, workspace)
                        .await
                    {
                        tracing::debug!(error = %e, "Notification dropped");
                    }
                }
                Effect::ArmDebounce { generation } => self.arm_timer(generation),
                Effect::CancelDebounce => {
                    if let Some(task) = self.lock_timers().debounce.take() {
                        task.abort();
                    }
                }
                Effect::SyncEntry(entry) => {
                    if let Err(e) = self.ctx.sessions.upsert(&entry).await {
                        tracing::debug!(error = %e, "Session entry update failed");
                    }
                }
                Effect::RemoveEntry(id) => {
                    if let Err(e) = self.ctx.sessions.remove(workspace, &id).await {
                        tracing::debug!(error = %e, "Session entry removal failed");
                    }
                }
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, generation: u64) {
        let machine: Weak<Self> = Arc::downgrade(self);
        let window = self.ctx.config.timing.debounce();

        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(machine) = machine.upgrade() {
                machine.on_debounce_elapsed(generation).await;
            }
        });

        let mut timers = self.lock_timers();
        if self.is_closed() {
            task.abort();
            return;
        }
        if let Some(previous) = timers.debounce.replace(task) {
            previous.abort();
        }
    }

    fn snapshot_of(&self, state: &MachineState) -> StatusSnapshot {
        let status = state.status();
        let session = state.session.as_ref();
        StatusSnapshot {
            session_id: session.map(|s| s.id.clone()),
            workspace_path: self.ctx.workspace_path.clone(),
            project_name: self.ctx.project_name.clone(),
            pid: self.ctx.pid,
            status,
            is_working: status == SessionStatus::Working,
            is_waiting: status == SessionStatus::Waiting,
            is_idle: status == SessionStatus::Idle,
            last_activity_time: state.last_activity_time,
            work_started_at: session.and_then(|s| s.work_started_at),
            metrics: session.map(|s| s.metrics.clone()).unwrap_or_default(),
        }
    }

    fn entry_of(&self, state: &MachineState) -> Option<SessionEntry> {
        let session = state.session.as_ref()?;
        Some(SessionEntry {
            session_id: session.id.clone(),
            workspace_path: self.ctx.workspace_path.clone(),
            pid: self.ctx.pid,
            status: if session.status.is_active() {
                SessionActivity::Active
            } else {
                SessionActivity::Idle
            },
            updated_at: self.ctx.clock.now_millis(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StatusSource for SessionMachine {
    fn status_snapshot(&self) -> Result<StatusSnapshot> {
        let state = self
            .state
            .lock()
            .map_err(|_| BeaconError::Status("session state lock poisoned".to_string()))?;
        Ok(self.snapshot_of(&state))
    }
}

fn status_changed_data(previous: SessionStatus, snapshot: &StatusSnapshot) -> Value {
    json!({
        "sessionId": snapshot.session_id,
        "status": snapshot.status,
        "previousStatus": previous,
        "isWorking": snapshot.is_working,
        "isWaiting": snapshot.is_waiting,
        "isIdle": snapshot.is_idle,
        "projectName": snapshot.project_name,
        "pid": snapshot.pid,
        "lastActivityTime": snapshot.last_activity_time,
        "workStartedAt": snapshot.work_started_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Broker;
    use crate::clock::ManualClock;
    use crate::config::BeaconConfig;
    use crate::inspect::StaticInspector;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        machine: Arc<SessionMachine>,
        broker: Arc<MemoryBroker>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(inspector: StaticInspector) -> Harness {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let broker = Arc::new(MemoryBroker::new(clock.clone()));
        let ctx = Arc::new(CoordinatorContext::with_parts(
            BeaconConfig::default(),
            broker.clone(),
            clock.clone(),
            "/home/dev/app",
            4242,
        ));
        let safety = SafetyEngine::with_default_rules(&ctx.config.safety, ctx.sessions.clone())
            .with_fanout(ctx.fanout.clone());
        let machine = SessionMachine::new(ctx, safety, Arc::new(inspector));
        Harness {
            machine,
            broker,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(StaticInspector::new(Some("feature/x"), false))
    }

    fn signal(value: Value) -> HostSignal {
        serde_json::from_value(value).unwrap()
    }

    fn tool_before(tool: &str) -> HostSignal {
        signal(json!({"type": "tool_before", "session_id": "s1", "tool": tool}))
    }

    fn idle() -> HostSignal {
        signal(json!({"type": "session_status", "session_id": "s1", "status": "idle"}))
    }

    impl Harness {
        fn events(&self, event_type: &str) -> Vec<Value> {
            self.broker
                .published_on("opencode:events")
                .iter()
                .map(|m| serde_json::from_str::<Value>(&m.payload).unwrap())
                .filter(|v| v["type"] == event_type)
                .collect()
        }

        /// `previous->current` for every status broadcast
        fn status_changes(&self) -> Vec<String> {
            self.events("status.changed")
                .iter()
                .map(|v| {
                    format!(
                        "{}->{}",
                        v["previousStatus"].as_str().unwrap(),
                        v["status"].as_str().unwrap()
                    )
                })
                .collect()
        }

        fn notification_kinds(&self) -> Vec<String> {
            self.broker
                .published_on("notifications")
                .iter()
                .map(|m| serde_json::from_str::<Value>(&m.payload).unwrap())
                .map(|v| v["kind"].as_str().unwrap().to_string())
                .collect()
        }
    }

    #[tokio::test]
    async fn test_tool_start_enters_working_and_publishes_immediately() {
        let h = harness();
        let report = h.machine.handle(&tool_before("read")).await;

        assert!(report.unwrap().allowed);
        assert_eq!(h.machine.status(), SessionStatus::Working);
        assert_eq!(h.status_changes(), vec!["idle->working"]);
        assert_eq!(h.events("session.active").len(), 1);
        assert_eq!(h.events("session.started").len(), 1);
        assert_eq!(h.machine.session_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_repeated_work_emits_single_transition_and_single_active() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.machine.handle(&tool_before("edit")).await;
        h.machine
            .handle(&signal(json!({"type": "session_status", "session_id": "s1", "status": "busy"})))
            .await;

        assert_eq!(h.status_changes().len(), 1);
        assert_eq!(h.events("session.active").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_publishes_status_now_and_detail_after_window() {
        let h = harness();
        h.machine.handle(&tool_before("bash")).await;
        h.machine
            .handle(&signal(json!({"type": "tool_after", "session_id": "s1", "tool": "bash"})))
            .await;
        h.machine.handle(&idle()).await;

        assert_eq!(h.machine.status(), SessionStatus::Idle);
        assert_eq!(h.status_changes().last().unwrap(), "working->idle");
        assert!(h.events("session.idle").is_empty());
        assert!(h.machine.idle_pending());

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(h.events("session.idle").is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let idle_events = h.events("session.idle");
        assert_eq!(idle_events.len(), 1);
        assert_eq!(idle_events[0]["metrics"]["commandsRun"], 1);
        assert_eq!(idle_events[0]["sessionId"], "s1");
        assert!(!h.machine.idle_pending());
        assert_eq!(h.notification_kinds(), vec!["work_started", "work_stopped"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_started_notifies_once_per_working_stretch() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.machine.handle(&tool_before("edit")).await;
        h.machine
            .handle(&signal(json!({"type": "session_status", "session_id": "s1", "status": "busy"})))
            .await;
        assert_eq!(h.notification_kinds(), vec!["work_started"]);

        let note: Value =
            serde_json::from_str(&h.broker.published_on("notifications")[0].payload).unwrap();
        assert_eq!(note["title"], "Work started");
        assert_eq!(note["style"], "info");
        assert_eq!(note["projectName"], "app");

        // An idle blip shorter than the window does not start a new stretch
        h.machine.handle(&idle()).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.machine.handle(&tool_before("read")).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.notification_kinds(), vec!["work_started"]);

        // A settled idle does
        h.machine.handle(&idle()).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        h.machine.handle(&tool_before("read")).await;
        assert_eq!(
            h.notification_kinds(),
            vec!["work_started", "work_stopped", "work_started"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_inside_window_cancels_idle_event() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.machine.handle(&idle()).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.machine.handle(&tool_before("read")).await;
        assert!(!h.machine.idle_pending());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.events("session.idle").is_empty());
        assert_eq!(
            h.status_changes(),
            vec![
                "idle->working",
                "working->idle",
                "idle->working",
            ]
        );
        // The blip did not end the working stretch
        assert_eq!(h.events("session.active").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deprecated_idle_signal_shares_guard() {
        let h = harness();
        // Not working: neither idle signal transitions
        h.machine
            .handle(&signal(json!({"type": "session_idle", "session_id": "s1"})))
            .await;
        h.machine.handle(&idle()).await;
        assert!(h.status_changes().is_empty());

        h.machine.handle(&tool_before("read")).await;
        h.machine
            .handle(&signal(json!({"type": "session_idle", "session_id": "s1"})))
            .await;
        // The duplicate idle from the other callback is a no-op
        h.machine.handle(&idle()).await;

        assert_eq!(h.status_changes().len(), 2);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.events("session.idle").len(), 1);
    }

    #[tokio::test]
    async fn test_permission_request_is_immediate_and_notifies() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.machine
            .handle(&signal(json!({
                "type": "permission_asked",
                "session_id": "s1",
                "title": "Allow git push?"
            })))
            .await;

        assert_eq!(h.machine.status(), SessionStatus::Waiting);
        assert_eq!(h.status_changes().last().unwrap(), "working->waiting");
        let asked = h.events("permission.requested");
        assert_eq!(asked.len(), 1);
        assert_eq!(asked[0]["title"], "Allow git push?");

        let notes = h.broker.published_on("notifications");
        assert_eq!(h.notification_kinds(), vec!["work_started", "permission"]);
        assert!(notes[1].payload.contains("Allow git push?"));
        assert_eq!(h.broker.published_on("agent:events").len(), 2);
    }

    #[tokio::test]
    async fn test_permission_updated_no_duplicate_notification() {
        let h = harness();
        h.machine
            .handle(&signal(json!({"type": "permission_asked", "session_id": "s1"})))
            .await;
        h.machine
            .handle(&signal(json!({"type": "permission_updated", "session_id": "s1"})))
            .await;

        assert_eq!(h.machine.status(), SessionStatus::Waiting);
        assert_eq!(h.status_changes().len(), 1);
        assert_eq!(h.broker.published_on("notifications").len(), 1);
    }

    #[tokio::test]
    async fn test_permission_updated_alone_enters_waiting() {
        let h = harness();
        h.machine
            .handle(&signal(json!({"type": "permission_updated", "session_id": "s1"})))
            .await;
        assert_eq!(h.machine.status(), SessionStatus::Waiting);
        assert_eq!(h.status_changes(), vec!["idle->waiting"]);
        assert!(h.broker.published_on("notifications").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_does_not_leave_waiting() {
        let h = harness();
        h.machine
            .handle(&signal(json!({"type": "permission_asked", "session_id": "s1"})))
            .await;
        h.machine.handle(&idle()).await;

        assert_eq!(h.machine.status(), SessionStatus::Waiting);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.events("session.idle").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_cancels_pending_idle() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.machine.handle(&idle()).await;
        h.machine
            .handle(&signal(json!({"type": "permission_updated", "session_id": "s1"})))
            .await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.events("session.idle").is_empty());
    }

    #[tokio::test]
    async fn test_session_deleted_resets_and_notifies() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.machine
            .handle(&signal(json!({"type": "session_deleted", "session_id": "s1"})))
            .await;

        assert_eq!(h.machine.status(), SessionStatus::Idle);
        assert!(h.machine.session_id().is_none());
        assert_eq!(h.events("session.deleted").len(), 1);
        assert_eq!(h.status_changes().last().unwrap(), "working->idle");

        let snapshot = h.machine.snapshot();
        assert!(snapshot.work_started_at.is_none());
        assert_eq!(snapshot.metrics, SessionMetrics::default());
        assert_eq!(h.notification_kinds(), vec!["work_started", "work_stopped"]);
    }

    #[tokio::test]
    async fn test_deleting_other_session_is_ignored() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.machine
            .handle(&signal(json!({"type": "session_deleted", "session_id": "other"})))
            .await;
        assert_eq!(h.machine.status(), SessionStatus::Working);
        assert!(h.events("session.deleted").is_empty());
    }

    #[tokio::test]
    async fn test_new_session_resets_metrics() {
        let h = harness();
        h.machine
            .handle(&signal(json!({"type": "tool_after", "session_id": "s1", "tool": "edit"})))
            .await;
        assert_eq!(h.machine.metrics().files_edited, 1);

        h.machine
            .handle(&signal(json!({"type": "session_created", "session_id": "s2"})))
            .await;
        assert_eq!(h.machine.session_id().as_deref(), Some("s2"));
        assert_eq!(h.machine.metrics(), SessionMetrics::default());
    }

    #[tokio::test]
    async fn test_anonymous_session_gets_generated_id() {
        let h = harness();
        h.machine
            .handle(&signal(json!({"type": "tool_before", "tool": "read"})))
            .await;
        assert!(h.machine.session_id().unwrap().starts_with("ses-"));
    }

    #[tokio::test]
    async fn test_malformed_signal_is_no_op() {
        let h = harness();
        let report = h
            .machine
            .handle(&signal(json!({"type": "session_status", "status": "weird"})))
            .await;
        assert!(report.is_none());
        assert!(h.broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_error_and_compacted_keep_status() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.machine
            .handle(&signal(json!({"type": "session_error", "session_id": "s1", "error": "rate limited"})))
            .await;
        h.machine
            .handle(&signal(json!({"type": "session_compacted", "session_id": "s1"})))
            .await;

        assert_eq!(h.machine.status(), SessionStatus::Working);
        assert_eq!(h.events("session.error")[0]["error"], "rate limited");
        assert_eq!(h.events("session.compacted").len(), 1);
    }

    #[tokio::test]
    async fn test_tool_before_on_protected_branch_is_blocked() {
        let h = harness_with(StaticInspector::new(Some("main"), false));
        let blocked = h.machine.handle(&tool_before("write")).await.unwrap();
        assert!(!blocked.allowed);

        let read = h.machine.handle(&tool_before("read")).await.unwrap();
        assert!(read.allowed);
        // Blocked or not, the agent is working
        assert_eq!(h.machine.status(), SessionStatus::Working);
    }

    #[tokio::test]
    async fn test_heartbeat_payload_stable_except_timestamp() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.broker.clear_published();

        h.machine.heartbeat().await;
        h.clock.advance(Duration::from_secs(5));
        h.machine.heartbeat().await;

        let mut beats = h.events("session.heartbeat");
        assert_eq!(beats.len(), 2);
        assert_ne!(beats[0]["timestamp"], beats[1]["timestamp"]);
        for beat in beats.iter_mut() {
            beat.as_object_mut().unwrap().remove("timestamp");
        }
        assert_eq!(beats[0], beats[1]);
        assert_eq!(beats[0]["status"], "working");
        assert_eq!(beats[0]["isWorking"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timer_publishes_unconditionally() {
        let h = harness();
        h.machine.start_heartbeat();

        tokio::time::sleep(Duration::from_millis(10_001)).await;
        // Ticks at 0s, 5s, 10s
        assert_eq!(h.events("session.heartbeat").len(), 3);

        h.machine.shutdown().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.events("session.heartbeat").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_pending_idle_and_ignores_signals() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        h.machine.handle(&idle()).await;
        h.machine.shutdown().await;
        h.broker.clear_published();

        tokio::time::sleep(Duration::from_secs(5)).await;
        h.machine.handle(&tool_before("read")).await;
        h.machine.heartbeat().await;

        assert!(h.broker.published().is_empty());
        assert!(h.machine.is_closed());
    }

    #[tokio::test]
    async fn test_broker_outage_never_surfaces() {
        let h = harness();
        h.broker.set_available(false);

        let report = h.machine.handle(&tool_before("bash")).await.unwrap();
        assert!(report.allowed);
        assert_eq!(h.machine.status(), SessionStatus::Working);
        h.machine.heartbeat().await;
    }

    #[tokio::test]
    async fn test_status_source_snapshot() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        let snapshot = h.machine.status_snapshot().unwrap();
        assert_eq!(snapshot.pid, 4242);
        assert_eq!(snapshot.project_name, "app");
        assert!(snapshot.is_working);
        assert_eq!(snapshot.work_started_at, Some(1_700_000_000_000));
    }

    #[tokio::test]
    async fn test_session_entry_tracks_activity() {
        let h = harness();
        h.machine.handle(&tool_before("read")).await;
        let key = "devsuite:session:s1";
        let entry: SessionEntry =
            serde_json::from_str(&h.broker.get(key).await.unwrap().unwrap()).unwrap();
        assert_eq!(entry.status, SessionActivity::Active);

        h.machine
            .handle(&signal(json!({"type": "session_deleted", "session_id": "s1"})))
            .await;
        assert!(h.broker.get(key).await.unwrap().is_none());
    }
}
