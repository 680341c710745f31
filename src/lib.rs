//! # a3s-beacon
//!
//! Session status coordination for coding-agent hosts in the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-beacon` runs next to an agent host, turns its lifecycle callbacks into
//! one canonical session status (`idle`, `working`, `waiting`), and makes that
//! status visible to the rest of the machine: pub/sub fanout for push
//! consumers, a loopback HTTP endpoint for pollers, and a leased presence
//! record so peers can find the endpoint. Tool calls can be vetted by a safety
//! rule engine before they run.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_beacon::{BeaconConfig, Coordinator, CoordinatorContext, HostSignal, MemoryBroker};
//!
//! # async fn example() -> a3s_beacon::Result<()> {
//! let ctx = CoordinatorContext::new(
//!     BeaconConfig::default(),
//!     Arc::new(MemoryBroker::default()),
//!     "/home/dev/app",
//! );
//! let coordinator = Coordinator::new(Arc::new(ctx));
//! coordinator.start().await;
//!
//! let signal: HostSignal = serde_json::from_str(
//!     r#"{"type":"tool_before","session_id":"s1","tool":"read"}"#,
//! )?;
//! if let Some(report) = coordinator.handle(&signal).await {
//!     assert!(report.allowed);
//! }
//!
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Brokers
//!
//! - **memory** - In-process broker with TTL expiry, for tests and detached runs
//! - **redis** - Redis pub/sub and keys via a reconnecting connection manager
//!
//! ## Architecture
//!
//! - **SessionMachine** - status state machine, idle debounce, heartbeat
//! - **EventFanout** - primary, event-store, and legacy channel publication
//! - **PresenceRegistry** - TTL-leased instance records
//! - **StatusPollServer** - `GET /status` and `GET /health`
//! - **SafetyEngine** - ordered, fail-open pre-tool rules
//! - **CommandListener** - control channel dispatch

pub mod broker;
pub mod cli;
pub mod clock;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod fanout;
pub mod inspect;
pub mod machine;
pub mod presence;
pub mod safety;
pub mod server;
pub mod sessions;
pub mod signal;
pub mod types;

// Re-export core types
pub use broker::{Broker, BrokerMessage, BrokerSubscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commands::{CommandKind, CommandListener, ControlCommand};
pub use config::BeaconConfig;
pub use coordinator::{Coordinator, CoordinatorContext};
pub use error::{BeaconError, Result};
pub use fanout::{EventFanout, FanoutReceipt, Notification};
pub use machine::SessionMachine;
pub use presence::PresenceRegistry;
pub use safety::{SafetyContext, SafetyEngine, SafetyFinding, SafetyReport, SafetyRule, Severity};
pub use server::{StatusPollServer, StatusSource};
pub use signal::HostSignal;
pub use types::{
    EventKind, HealthReport, InstanceRecord, SessionMetrics, SessionStatus, StatusSnapshot,
};

// Re-export brokers for convenience
pub use broker::memory::MemoryBroker;
pub use broker::redis::{RedisBroker, RedisConfig};
