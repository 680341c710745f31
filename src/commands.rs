//! Command listener: inbound control channel dispatch
//!
//! Listens on the global control channel and on a workspace-scoped one
//! (`<control>:<base64(workspace)>`). Each message is parsed as a
//! `ControlCommand` and handed to the handler registered for its kind.
//! Unparseable messages and kinds without a handler are dropped silently;
//! there is no acknowledgement or retry.

use crate::broker::Broker;
use crate::error::Result;
use crate::presence::encode_workspace;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// A control message sent to running instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Liveness check
    Ping,
    /// Publish the current status right away
    RequestStatus,
    /// Interrupt the running session
    Abort {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Feed a prompt into a session
    SendPrompt {
        text: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Show a message inside the agent host
    Notify {
        title: String,
        #[serde(default)]
        message: String,
    },
}

/// Tag of a `ControlCommand`, used as the handler key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    RequestStatus,
    Abort,
    SendPrompt,
    Notify,
}

impl ControlCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            ControlCommand::Ping => CommandKind::Ping,
            ControlCommand::RequestStatus => CommandKind::RequestStatus,
            ControlCommand::Abort { .. } => CommandKind::Abort,
            ControlCommand::SendPrompt { .. } => CommandKind::SendPrompt,
            ControlCommand::Notify { .. } => CommandKind::Notify,
        }
    }
}

/// Handler invoked with the parsed command
pub type CommandHandler = Arc<dyn Fn(ControlCommand) + Send + Sync>;

type HandlerMap = Arc<RwLock<HashMap<CommandKind, CommandHandler>>>;

/// Subscribes to control channels and dispatches by command kind
pub struct CommandListener {
    broker: Arc<dyn Broker>,
    channels: Vec<String>,
    handlers: HandlerMap,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CommandListener {
    pub fn new(broker: Arc<dyn Broker>, control_channel: &str, workspace_path: &str) -> Self {
        Self {
            broker,
            channels: vec![
                control_channel.to_string(),
                format!("{}:{}", control_channel, encode_workspace(workspace_path)),
            ],
            handlers: Arc::new(RwLock::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    /// `[global, workspace-scoped]`
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Register the handler for `kind`, replacing any previous one
    pub fn on_command<F>(&self, kind: CommandKind, handler: F)
    where
        F: Fn(ControlCommand) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(kind, Arc::new(handler));
    }

    /// Parse and dispatch one raw message; returns whether a handler ran
    pub fn dispatch(&self, raw: &str) -> bool {
        dispatch(&self.handlers, raw)
    }

    /// Subscribe and start dispatching in the background
    pub async fn start(&self) -> Result<()> {
        let mut subscription = self.broker.subscribe(&self.channels).await?;
        let handlers = Arc::clone(&self.handlers);

        let task = tokio::spawn(async move {
            loop {
                match subscription.next().await {
                    Ok(Some(message)) => {
                        dispatch(&handlers, &message.payload);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "Dropping unreadable control message");
                    }
                }
            }
            tracing::debug!("Control subscription closed");
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        tracing::info!(channels = ?self.channels, "Listening for control commands");
        Ok(())
    }

    /// Stop dispatching
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

fn dispatch(handlers: &HandlerMap, raw: &str) -> bool {
    let command = match serde_json::from_str::<ControlCommand>(raw) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unrecognised control message");
            return false;
        }
    };

    let handler = {
        let handlers = handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&command.kind()).cloned()
    };

    match handler {
        Some(handler) => {
            tracing::debug!(kind = ?command.kind(), "Dispatching control command");
            handler(command);
            true
        }
        None => false,
    }
}
