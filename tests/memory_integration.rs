//! Memory broker integration tests
//!
//! End-to-end tests driving the coordinator, registry, safety engine and
//! fanout against the in-memory broker. Covers debounce cancellation,
//! immediate status broadcast, lease expiry, safety blocking, fanout
//! isolation, and heartbeat stability.

use a3s_beacon::config::{LeaseConfig, SafetyConfig};
use a3s_beacon::inspect::StaticInspector;
use a3s_beacon::safety::SafetyEngine;
use a3s_beacon::sessions::SessionDirectory;
use a3s_beacon::signal::ToolCall;
use a3s_beacon::{
    BeaconConfig, Broker, Coordinator, CoordinatorContext, EventKind, HostSignal, InstanceRecord,
    ManualClock, MemoryBroker, PresenceRegistry, SafetyContext, SessionStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const WORKSPACE: &str = "/home/dev/app";
const START: u64 = 1_700_000_000_000;

struct Rig {
    coordinator: Coordinator,
    broker: Arc<MemoryBroker>,
    clock: Arc<ManualClock>,
}

fn rig(branch: &str) -> Rig {
    let clock = Arc::new(ManualClock::new(START));
    let broker = Arc::new(MemoryBroker::new(clock.clone()));
    let ctx = Arc::new(CoordinatorContext::with_parts(
        BeaconConfig::default(),
        broker.clone(),
        clock.clone(),
        WORKSPACE,
        4242,
    ));
    let coordinator =
        Coordinator::with_inspector(ctx, Arc::new(StaticInspector::new(Some(branch), false)));
    Rig {
        coordinator,
        broker,
        clock,
    }
}

fn signal(value: Value) -> HostSignal {
    serde_json::from_value(value).unwrap()
}

fn primary_events(broker: &MemoryBroker, event_type: &str) -> Vec<Value> {
    broker
        .published_on("opencode:events")
        .iter()
        .map(|m| serde_json::from_str::<Value>(&m.payload).unwrap())
        .filter(|v| v["type"] == event_type)
        .collect()
}

// ─── State machine ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_work_within_debounce_window_suppresses_idle_event() {
    let rig = rig("feature/x");
    let work = signal(json!({"type": "tool_before", "session_id": "s1", "tool": "read"}));
    let idle = signal(json!({"type": "session_status", "session_id": "s1", "status": "idle"}));

    rig.coordinator.handle(&work).await;
    rig.coordinator.handle(&idle).await;
    tokio::time::sleep(Duration::from_millis(1999)).await;
    rig.coordinator.handle(&work).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(primary_events(&rig.broker, "session.idle").is_empty());
    assert_eq!(rig.coordinator.machine().status(), SessionStatus::Working);
}

#[tokio::test(start_paused = true)]
async fn test_idle_event_after_stable_window() {
    let rig = rig("feature/x");
    rig.coordinator
        .handle(&signal(json!({"type": "tool_before", "session_id": "s1", "tool": "edit"})))
        .await;
    rig.coordinator
        .handle(&signal(json!({"type": "tool_after", "session_id": "s1", "tool": "edit"})))
        .await;
    rig.coordinator
        .handle(&signal(json!({"type": "session_idle", "session_id": "s1"})))
        .await;

    rig.clock.advance(Duration::from_secs(2));
    tokio::time::sleep(Duration::from_millis(2001)).await;

    let idle = primary_events(&rig.broker, "session.idle");
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0]["metrics"]["filesEdited"], 1);
    assert_eq!(idle[0]["workDurationMs"], 2000);

    let legacy: Vec<Value> = rig
        .broker
        .published_on("agent:events")
        .iter()
        .map(|m| serde_json::from_str(&m.payload).unwrap())
        .collect();
    assert!(legacy.iter().any(|v| v["event"] == "work_stopped"));
}

#[tokio::test]
async fn test_every_transition_broadcasts_exactly_once() {
    let rig = rig("feature/x");
    let steps = [
        json!({"type": "tool_before", "session_id": "s1", "tool": "read"}),
        json!({"type": "tool_before", "session_id": "s1", "tool": "grep"}),
        json!({"type": "permission_asked", "session_id": "s1", "title": "Push?"}),
        json!({"type": "permission_updated", "session_id": "s1"}),
        json!({"type": "session_status", "session_id": "s1", "status": "busy"}),
        json!({"type": "session_status", "session_id": "s1", "status": "idle"}),
        json!({"type": "session_idle", "session_id": "s1"}),
    ];

    let mut counts = Vec::new();
    for step in steps {
        rig.coordinator.handle(&signal(step)).await;
        counts.push(primary_events(&rig.broker, "status.changed").len());
    }

    // idle→working, (none), working→waiting, (none), waiting→working, working→idle, (none)
    assert_eq!(counts, vec![1, 1, 2, 2, 3, 4, 4]);
    let last = primary_events(&rig.broker, "status.changed").pop().unwrap();
    assert_eq!(last["previousStatus"], "working");
    assert_eq!(last["status"], "idle");
    assert_eq!(last["path"], WORKSPACE);
}

#[tokio::test]
async fn test_heartbeat_is_stable_apart_from_timestamp() {
    let rig = rig("feature/x");
    rig.coordinator
        .handle(&signal(json!({"type": "permission_asked", "session_id": "s1"})))
        .await;

    let machine = rig.coordinator.machine();
    let first = machine.heartbeat_payload();
    rig.clock.advance(Duration::from_secs(5));
    let second = machine.heartbeat_payload();
    assert_eq!(first, second);
    assert_eq!(first["status"], "waiting");

    machine.heartbeat().await;
    rig.clock.advance(Duration::from_secs(5));
    machine.heartbeat().await;
    let mut beats = primary_events(&rig.broker, EventKind::Heartbeat.as_str());
    assert_eq!(beats.len(), 2);
    for beat in beats.iter_mut() {
        beat.as_object_mut().unwrap().remove("timestamp");
    }
    assert_eq!(beats[0], beats[1]);
}

// ─── Presence ────────────────────────────────────────────────────

#[tokio::test]
async fn test_unrefreshed_lease_expires() {
    let clock = Arc::new(ManualClock::new(START));
    let broker = Arc::new(MemoryBroker::new(clock.clone()));
    let registry = PresenceRegistry::new(broker.clone(), "devsuite", LeaseConfig::default());
    let record = InstanceRecord {
        port: 51234,
        workspace_path: WORKSPACE.to_string(),
        process_id: 999,
        registered_at: START,
    };
    registry.register(&record).await.unwrap();

    clock.advance(Duration::from_millis(59_999));
    assert_eq!(registry.get(WORKSPACE, 999).await.unwrap(), Some(record));

    clock.advance(Duration::from_millis(1));
    assert!(registry.get(WORKSPACE, 999).await.unwrap().is_none());
    // The index still lists the pid, but a stale pid is not present
    assert!(registry.instances(WORKSPACE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lifecycle_registers_and_unregisters() {
    let rig = rig("feature/x");
    rig.coordinator.start().await;
    let port = rig.coordinator.port().unwrap();

    let ctx = rig.coordinator.context();
    let listed = ctx.presence.instances(WORKSPACE).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].port, port);

    rig.coordinator.shutdown().await;
    assert!(ctx.presence.instances(WORKSPACE).await.unwrap().is_empty());
    assert!(rig
        .broker
        .get(&ctx.presence.instance_key(WORKSPACE, 4242))
        .await
        .unwrap()
        .is_none());
}

// ─── Safety ──────────────────────────────────────────────────────

fn engine(broker: Arc<MemoryBroker>) -> SafetyEngine {
    let sessions = Arc::new(SessionDirectory::new(
        broker,
        "devsuite",
        Duration::from_secs(3600),
    ));
    SafetyEngine::with_default_rules(&SafetyConfig::default(), sessions)
}

fn on_branch(branch: &str, call: ToolCall) -> SafetyContext {
    SafetyContext {
        workspace_path: WORKSPACE.to_string(),
        session_id: Some("s1".to_string()),
        tool: call.tool,
        command: call.command,
        branch: Some(branch.to_string()),
        has_uncommitted_changes: false,
    }
}

#[tokio::test]
async fn test_protected_branch_blocks_mutating_tools_only() {
    let engine = engine(Arc::new(MemoryBroker::default()));

    for call in [ToolCall::bash("ls"), ToolCall::new("write"), ToolCall::new("edit")] {
        let tool = call.tool.clone();
        let report = engine.check_safety(&on_branch("main", call)).await;
        assert!(!report.allowed, "{tool} should be blocked on main");
        assert_eq!(report.blocked[0].rule_id, "protected-branch");
    }

    let report = engine.check_safety(&on_branch("main", ToolCall::new("read"))).await;
    assert!(report.allowed);
}

#[tokio::test]
async fn test_destructive_fragment_matches_anywhere() {
    let engine = engine(Arc::new(MemoryBroker::default()));

    let report = engine
        .check_safety(&on_branch("dev", ToolCall::bash("sudo rm -rf /tmp/x")))
        .await;
    assert!(!report.allowed);

    // Plain substring matching also catches mentions
    let report = engine
        .check_safety(&on_branch("dev", ToolCall::bash("echo sudo rm is dangerous")))
        .await;
    assert!(!report.allowed);
    assert_eq!(report.blocked[0].rule_id, "destructive-command");
}

#[tokio::test]
async fn test_safety_fails_open_without_broker() {
    let rig = rig("feature/x");
    rig.broker.set_available(false);

    let report = rig
        .coordinator
        .handle(&signal(json!({"type": "tool_before", "session_id": "s1", "tool": "bash", "args": {"command": "cargo test"}})))
        .await
        .unwrap();
    assert!(report.allowed);
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn test_concurrent_sessions_warn() {
    let rig = rig("feature/x");
    for id in ["a", "b", "c"] {
        rig.coordinator
            .context()
            .sessions
            .upsert(&a3s_beacon::sessions::SessionEntry {
                session_id: id.to_string(),
                workspace_path: WORKSPACE.to_string(),
                pid: 1,
                status: a3s_beacon::sessions::SessionActivity::Active,
                updated_at: START,
            })
            .await
            .unwrap();
    }

    let report = rig
        .coordinator
        .handle(&signal(json!({"type": "tool_before", "session_id": "s1", "tool": "read"})))
        .await
        .unwrap();
    assert!(report.allowed);
    assert_eq!(report.warnings[0].rule_id, "max-concurrent-sessions");
    assert_eq!(primary_events(&rig.broker, "safety.warning").len(), 1);
}

// ─── Fanout ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_legacy_failure_does_not_stop_other_channels() {
    let rig = rig("feature/x");
    rig.broker.fail_channel("agent:events");

    let receipt = rig
        .coordinator
        .context()
        .fanout
        .publish(EventKind::SessionActive, WORKSPACE, json!({"sessionId": "s1"}))
        .await;

    assert!(receipt.primary.is_ok());
    assert!(receipt.event_store.is_ok());
    assert!(matches!(receipt.legacy, Some(Err(_))));
    assert_eq!(rig.broker.published_on("opencode:events").len(), 1);
    assert_eq!(rig.broker.published_on("events:new").len(), 1);
}

#[tokio::test]
async fn test_event_store_shape() {
    let rig = rig("feature/x");
    rig.coordinator
        .handle(&signal(json!({"type": "tool_before", "session_id": "s1", "tool": "read"})))
        .await;

    let stored: Vec<Value> = rig
        .broker
        .published_on("events:new")
        .iter()
        .map(|m| serde_json::from_str(&m.payload).unwrap())
        .collect();
    let changed = stored
        .iter()
        .find(|v| v["event_type"] == "status.changed")
        .unwrap();
    assert_eq!(changed["channel"], "opencode:events");
    assert_eq!(changed["workspace_path"], WORKSPACE);
    let data: Value = serde_json::from_str(changed["data"].as_str().unwrap()).unwrap();
    assert_eq!(data["status"], "working");
}

// ─── Commands ────────────────────────────────────────────────────

#[tokio::test]
async fn test_workspace_scoped_control_channel() {
    let rig = rig("feature/x");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    rig.coordinator
        .commands()
        .on_command(a3s_beacon::CommandKind::SendPrompt, move |cmd| {
            let _ = tx.send(cmd);
        });
    rig.coordinator.start().await;

    let scoped = rig.coordinator.commands().channels()[1].clone();
    rig.broker
        .publish(&scoped, r#"{"type":"send_prompt","text":"continue"}"#)
        .await
        .unwrap();

    let cmd = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        cmd,
        a3s_beacon::ControlCommand::SendPrompt {
            text: "continue".to_string(),
            session_id: None
        }
    );
    rig.coordinator.shutdown().await;
}
