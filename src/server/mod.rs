//! Status poll server
//!
//! A loopback HTTP endpoint bound to an ephemeral port. On start it registers
//! the bound port in the presence registry and keeps the lease fresh; on stop
//! it cancels the lease, unregisters, then closes the listener.

pub mod router;
pub mod state;

pub use state::{AppState, StatusSource};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::coordinator::CoordinatorContext;
use crate::error::{BeaconError, Result};
use crate::presence::LeaseHandle;
use crate::types::InstanceRecord;

/// Poll server for one instance, before it is started
pub struct StatusPollServer {
    ctx: Arc<CoordinatorContext>,
    source: Arc<dyn StatusSource>,
}

impl StatusPollServer {
    pub fn new(ctx: Arc<CoordinatorContext>, source: Arc<dyn StatusSource>) -> Self {
        Self { ctx, source }
    }

    /// Bind, register, and start serving.
    ///
    /// A bind failure is returned. A registration failure is only logged:
    /// the lease refresh keeps retrying it.
    pub async fn start(self) -> Result<RunningServer> {
        let bind_addr = format!("{}:0", self.ctx.config.server.host);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| BeaconError::Bind(format!("{bind_addr}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| BeaconError::Bind(format!("{bind_addr}: {e}")))?;

        let app = router::build(AppState::new(
            self.source,
            &self.ctx.workspace_path,
            self.ctx.pid,
            addr.port(),
        ));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::warn!(error = %e, "Status server exited with error");
            }
        });
        tracing::info!(%addr, "Status server listening");

        let record = InstanceRecord {
            port: addr.port(),
            workspace_path: self.ctx.workspace_path.clone(),
            process_id: self.ctx.pid,
            registered_at: self.ctx.clock.now_millis(),
        };
        if let Err(e) = self.ctx.presence.register(&record).await {
            tracing::warn!(error = %e, "Instance registration failed, lease refresh will retry");
        }
        let lease = self.ctx.presence.spawn_refresh(record);

        Ok(RunningServer {
            ctx: self.ctx,
            addr,
            lease: Some(lease),
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// A bound and registered poll server
pub struct RunningServer {
    ctx: Arc<CoordinatorContext>,
    addr: SocketAddr,
    lease: Option<LeaseHandle>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RunningServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Cancel the lease, unregister, then close the listener
    pub async fn stop(mut self) {
        if let Some(lease) = self.lease.take() {
            lease.cancel().await;
        }
        if let Err(e) = self
            .ctx
            .presence
            .unregister(&self.ctx.workspace_path, self.ctx.pid)
            .await
        {
            tracing::debug!(error = %e, "Instance unregistration failed");
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::info!(addr = %self.addr, "Status server stopped");
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
