//! Coordinator: wiring and lifecycle
//!
//! `CoordinatorContext` is built once at startup and shared by reference with
//! every part. `Coordinator` starts the poll server, command listener and
//! heartbeat, routes host signals to the state machine, and tears all of it
//! down on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::Broker;
use crate::clock::{Clock, SystemClock};
use crate::commands::{CommandKind, CommandListener};
use crate::config::BeaconConfig;
use crate::fanout::EventFanout;
use crate::inspect::{GitInspector, WorkspaceInspector};
use crate::machine::SessionMachine;
use crate::presence::PresenceRegistry;
use crate::safety::{SafetyEngine, SafetyReport};
use crate::server::{RunningServer, StatusPollServer};
use crate::sessions::SessionDirectory;
use crate::signal::HostSignal;
use crate::types::project_name;

/// Shared, immutable wiring for one plugin instance
pub struct CoordinatorContext {
    pub config: BeaconConfig,
    pub broker: Arc<dyn Broker>,
    pub clock: Arc<dyn Clock>,
    pub workspace_path: String,
    pub project_name: String,
    pub pid: u32,
    pub fanout: Arc<EventFanout>,
    pub presence: Arc<PresenceRegistry>,
    pub sessions: Arc<SessionDirectory>,
}

impl CoordinatorContext {
    /// Context for the current process, on the system clock
    pub fn new(
        config: BeaconConfig,
        broker: Arc<dyn Broker>,
        workspace_path: impl Into<String>,
    ) -> Self {
        Self::with_parts(
            config,
            broker,
            Arc::new(SystemClock),
            workspace_path,
            std::process::id(),
        )
    }

    pub fn with_parts(
        config: BeaconConfig,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        workspace_path: impl Into<String>,
        pid: u32,
    ) -> Self {
        let workspace_path = workspace_path.into();
        let fanout = Arc::new(EventFanout::new(
            broker.clone(),
            config.channels.clone(),
            config.source.clone(),
            clock.clone(),
        ));
        let presence = Arc::new(PresenceRegistry::new(
            broker.clone(),
            config.key_prefix.clone(),
            config.lease.clone(),
        ));
        let sessions = Arc::new(SessionDirectory::new(
            broker.clone(),
            config.key_prefix.clone(),
            config.lease.ttl(),
        ));

        Self {
            project_name: project_name(&workspace_path),
            config,
            broker,
            clock,
            workspace_path,
            pid,
            fanout,
            presence,
            sessions,
        }
    }
}

/// Lifecycle owner for one plugin instance
pub struct Coordinator {
    ctx: Arc<CoordinatorContext>,
    machine: Arc<SessionMachine>,
    listener: CommandListener,
    server: Mutex<Option<RunningServer>>,
    stopped: AtomicBool,
}

impl Coordinator {
    /// Coordinator inspecting the workspace with `git`
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self::with_inspector(ctx, Arc::new(GitInspector))
    }

    pub fn with_inspector(
        ctx: Arc<CoordinatorContext>,
        inspector: Arc<dyn WorkspaceInspector>,
    ) -> Self {
        let safety = SafetyEngine::with_default_rules(&ctx.config.safety, ctx.sessions.clone())
            .with_fanout(ctx.fanout.clone());
        let machine = SessionMachine::new(ctx.clone(), safety, inspector);
        let listener = CommandListener::new(
            ctx.broker.clone(),
            &ctx.config.channels.control,
            &ctx.workspace_path,
        );

        // Answer status requests with an immediate heartbeat until the host
        // registers its own handler
        let weak = Arc::downgrade(&machine);
        listener.on_command(CommandKind::RequestStatus, move |_| {
            if let Some(machine) = weak.upgrade() {
                tokio::spawn(async move { machine.heartbeat().await });
            }
        });
        listener.on_command(CommandKind::Ping, |_| tracing::debug!("Control ping received"));

        Self {
            ctx,
            machine,
            listener,
            server: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<CoordinatorContext> {
        &self.ctx
    }

    pub fn machine(&self) -> &Arc<SessionMachine> {
        &self.machine
    }

    /// Command listener, for registering host-side handlers
    pub fn commands(&self) -> &CommandListener {
        &self.listener
    }

    /// Port of the running poll server, if it started
    pub fn port(&self) -> Option<u16> {
        self.lock_server().as_ref().map(RunningServer::port)
    }

    /// Start the poll server, command listener, and heartbeat
    ///
    /// Failures here are logged and never returned: the host keeps working
    /// with whatever parts did start.
    pub async fn start(&self) {
        match StatusPollServer::new(self.ctx.clone(), self.machine.clone())
            .start()
            .await
        {
            Ok(server) => {
                *self.lock_server() = Some(server);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Status server unavailable, continuing without it");
            }
        }

        if let Err(e) = self.listener.start().await {
            tracing::warn!(error = %e, "Command listener unavailable, continuing without it");
        }

        self.machine.start_heartbeat();
        tracing::info!(
            workspace = %self.ctx.workspace_path,
            pid = self.ctx.pid,
            broker = self.ctx.broker.name(),
            "Beacon started"
        );
    }

    /// Route one host signal to the state machine
    pub async fn handle(&self, signal: &HostSignal) -> Option<SafetyReport> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        self.machine.handle(signal).await
    }

    /// Stop timers, unregister and close the server, then stop listening.
    /// Signals arriving afterwards are ignored.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.machine.shutdown().await;
        let server = self.lock_server().take();
        if let Some(server) = server {
            server.stop().await;
        }
        self.listener.stop().await;
        tracing::info!("Beacon shut down");
    }

    fn lock_server(&self) -> std::sync::MutexGuard<'_, Option<RunningServer>> {
        self.server.lock().unwrap_or_else(|e| e.into_inner())
    }
}
