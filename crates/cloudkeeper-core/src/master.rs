// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Master orchestrator.
//!
//! The master owns every running execution. It allocates execution ids, spawns
//! one top-level interpreter task per execution, forwards start and cancel
//! commands, and publishes [`ExecutionEvent`]s to subscribers. An execution
//! that does not terminate within the cancellation grace period after a cancel
//! request is aborted and reported with a `FORCED_TERMINATION` failure.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cloudkeeper_core::{ExecutionEvent, ExecutionParams, Master};
//!
//! let master = Master::builder()
//!     .context_provider(provider)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let mut events = master.subscribe();
//! let id = master.create_execution(ExecutionParams::new(module)).await?;
//! master.start_execution(id)?;
//! while let Ok(event) = events.recv().await {
//!     if let ExecutionEvent::ExecutionFinished(outcome) = event {
//!         assert!(outcome.is_success());
//!         break;
//!     }
//! }
//! master.shutdown().await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::Config;
use crate::context::RuntimeContextProvider;
use crate::error::ExecutionFailure;
use crate::execution::{ExecutionEvent, ExecutionId, ExecutionOutcome, ExecutionParams};
use crate::top_level::{TopLevelCommand, TopLevelInterpreter};

/// Errors returned by a [`MasterHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MasterError {
    /// The master task is no longer running.
    #[error("Master is not running")]
    Stopped,
}

/// Builder for creating a [`Master`].
pub struct MasterBuilder {
    config: Config,
    context_provider: Option<Arc<dyn RuntimeContextProvider>>,
}

impl Default for MasterBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            context_provider: None,
        }
    }
}

impl MasterBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given configuration, e.g. from [`Config::from_env`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the time a cancelled execution gets before it is aborted.
    ///
    /// Default: 60 seconds
    pub fn cancel_grace_period(mut self, grace_period: Duration) -> Self {
        self.config.cancel_grace_period = grace_period;
        self
    }

    /// Set the capacity of the event broadcast channel.
    ///
    /// Default: 1024
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    /// Set the source of runtime contexts (required).
    pub fn context_provider(mut self, provider: Arc<dyn RuntimeContextProvider>) -> Self {
        self.context_provider = Some(provider);
        self
    }

    /// Build the master.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<Master> {
        let context_provider = self
            .context_provider
            .ok_or_else(|| anyhow::anyhow!("context_provider is required"))?;
        if self.config.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be positive");
        }
        Ok(Master {
            config: self.config,
            context_provider,
        })
    }
}

/// A configured, not yet running master orchestrator.
pub struct Master {
    config: Config,
    context_provider: Arc<dyn RuntimeContextProvider>,
}

impl Master {
    /// Create a new builder for configuring the master.
    pub fn builder() -> MasterBuilder {
        MasterBuilder::new()
    }

    /// Start the master task on the current tokio runtime.
    pub async fn start(self) -> Result<MasterHandle> {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.config.event_channel_capacity);
        let shutdown = CancellationToken::new();

        info!(
            cancel_grace_period_secs = self.config.cancel_grace_period.as_secs_f64(),
            event_channel_capacity = self.config.event_channel_capacity,
            "Master started"
        );

        let state = MasterState {
            config: self.config,
            context_provider: self.context_provider,
            events: events.clone(),
            messages: messages_tx.clone(),
            next_id: 0,
            executions: HashMap::new(),
        };
        let task = tokio::spawn(state.run(messages_rx, shutdown.clone()));

        Ok(MasterHandle {
            messages: messages_tx,
            events,
            shutdown,
            task,
        })
    }
}

enum MasterMessage {
    Create {
        params: ExecutionParams,
        reply: oneshot::Sender<ExecutionId>,
    },
    Start {
        id: ExecutionId,
    },
    Cancel {
        id: ExecutionId,
        cause: String,
    },
    ActiveExecutions {
        reply: oneshot::Sender<Vec<ExecutionId>>,
    },
    Terminated {
        id: ExecutionId,
        result: std::result::Result<ExecutionOutcome, JoinError>,
    },
    ForceTerminate {
        id: ExecutionId,
    },
}

struct RunningExecution {
    commands: mpsc::UnboundedSender<TopLevelCommand>,
    abort: AbortHandle,
    // set once the first cancel request arrives
    cancellation: Option<(String, JoinHandle<()>)>,
}

struct MasterState {
    config: Config,
    context_provider: Arc<dyn RuntimeContextProvider>,
    events: broadcast::Sender<ExecutionEvent>,
    messages: mpsc::UnboundedSender<MasterMessage>,
    next_id: u64,
    executions: HashMap<ExecutionId, RunningExecution>,
}

impl MasterState {
    async fn run(
        mut self,
        mut messages: mpsc::UnboundedReceiver<MasterMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Master received shutdown signal");
                    break;
                }

                message = messages.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }

        for (id, execution) in self.executions.drain() {
            debug!(execution_id = %id, "Aborting execution on shutdown");
            execution.abort.abort();
            if let Some((_, timer)) = execution.cancellation {
                timer.abort();
            }
        }
        info!("Master stopped");
    }

    fn handle(&mut self, message: MasterMessage) {
        match message {
            MasterMessage::Create { params, reply } => {
                let id = self.create(params);
                if reply.send(id).is_err() {
                    debug!(execution_id = %id, "Caller went away before receiving the execution id");
                }
            }
            MasterMessage::Start { id } => match self.executions.get(&id) {
                Some(execution) => {
                    let _ = execution.commands.send(TopLevelCommand::Start);
                }
                None => warn!(execution_id = %id, "Start requested for unknown execution"),
            },
            MasterMessage::Cancel { id, cause } => self.cancel(id, cause),
            MasterMessage::ActiveExecutions { reply } => {
                let mut ids: Vec<ExecutionId> = self.executions.keys().copied().collect();
                ids.sort();
                let _ = reply.send(ids);
            }
            MasterMessage::ForceTerminate { id } => match self.executions.get(&id) {
                Some(execution) => {
                    warn!(execution_id = %id, "Execution did not stop within the grace period, aborting");
                    execution.abort.abort();
                }
                None => debug!(execution_id = %id, "Forced termination of an execution that already finished"),
            },
            MasterMessage::Terminated { id, result } => self.terminated(id, result),
        }
    }

    fn create(&mut self, params: ExecutionParams) -> ExecutionId {
        let id = ExecutionId(self.next_id);
        self.next_id += 1;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let interpreter = TopLevelInterpreter::new(
            id,
            params,
            self.context_provider.clone(),
            self.events.clone(),
        );
        let task = tokio::spawn(
            interpreter
                .run(commands_rx)
                .instrument(info_span!("execution", execution_id = %id)),
        );
        let abort = task.abort_handle();

        let messages = self.messages.clone();
        tokio::spawn(async move {
            let result = task.await;
            let _ = messages.send(MasterMessage::Terminated { id, result });
        });

        self.executions.insert(
            id,
            RunningExecution {
                commands,
                abort,
                cancellation: None,
            },
        );
        info!(execution_id = %id, "Execution created");
        id
    }

    fn cancel(&mut self, id: ExecutionId, cause: String) {
        let Some(execution) = self.executions.get_mut(&id) else {
            warn!(execution_id = %id, "Cancel requested for unknown execution");
            return;
        };
        if execution.cancellation.is_some() {
            debug!(execution_id = %id, "Execution is already being cancelled");
            return;
        }

        info!(execution_id = %id, cause = %cause, "Cancelling execution");
        let _ = execution.commands.send(TopLevelCommand::Cancel {
            cause: cause.clone(),
        });

        let messages = self.messages.clone();
        let grace_period = self.config.cancel_grace_period;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            let _ = messages.send(MasterMessage::ForceTerminate { id });
        });
        execution.cancellation = Some((cause, timer));
    }

    fn terminated(&mut self, id: ExecutionId, result: std::result::Result<ExecutionOutcome, JoinError>) {
        let Some(execution) = self.executions.remove(&id) else {
            warn!(execution_id = %id, "Termination of unknown execution");
            return;
        };
        let cause = match execution.cancellation {
            Some((cause, timer)) => {
                timer.abort();
                cause
            }
            None => "execution aborted".to_string(),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                error!(execution_id = %id, "Top-level interpreter panicked");
                std::panic::resume_unwind(e.into_panic());
            }
            Err(_) => ExecutionOutcome {
                execution_id: id,
                finished_at: Utc::now(),
                failure: Some(ExecutionFailure::forced_termination(&cause)),
            },
        };

        match &outcome.failure {
            None => info!(execution_id = %id, "Execution finished"),
            Some(failure) => {
                warn!(execution_id = %id, code = %failure.code, message = %failure.message, "Execution finished with failure")
            }
        }
        // No subscribers is fine
        let _ = self.events.send(ExecutionEvent::ExecutionFinished(outcome));
    }
}

/// Handle to a running master.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) leaves the
/// master running until the tokio runtime shuts down.
pub struct MasterHandle {
    messages: mpsc::UnboundedSender<MasterMessage>,
    events: broadcast::Sender<ExecutionEvent>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl MasterHandle {
    /// Create an execution. It does not run until [`start_execution`](Self::start_execution).
    pub async fn create_execution(
        &self,
        params: ExecutionParams,
    ) -> std::result::Result<ExecutionId, MasterError> {
        let (reply, response) = oneshot::channel();
        self.send(MasterMessage::Create { params, reply })?;
        response.await.map_err(|_| MasterError::Stopped)
    }

    /// Start a created execution. Unknown ids are logged and ignored.
    pub fn start_execution(&self, id: ExecutionId) -> std::result::Result<(), MasterError> {
        self.send(MasterMessage::Start { id })
    }

    /// Request cancellation of an execution.
    ///
    /// The execution is aborted if it has not terminated after the configured
    /// grace period. Repeated requests for the same execution are ignored.
    pub fn cancel(
        &self,
        id: ExecutionId,
        cause: impl Into<String>,
    ) -> std::result::Result<(), MasterError> {
        self.send(MasterMessage::Cancel {
            id,
            cause: cause.into(),
        })
    }

    /// Subscribe to execution events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Ids of the executions that have not terminated yet, ascending.
    pub async fn active_executions(&self) -> std::result::Result<Vec<ExecutionId>, MasterError> {
        let (reply, response) = oneshot::channel();
        self.send(MasterMessage::ActiveExecutions { reply })?;
        response.await.map_err(|_| MasterError::Stopped)
    }

    /// Returns true while the master task is running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the master, aborting every execution that is still running.
    pub async fn shutdown(self) -> Result<()> {
        info!("Master shutting down...");
        self.shutdown.cancel();
        match self.task.await {
            Ok(()) => {
                info!("Master shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Master task panicked: {}", e);
                Err(anyhow::anyhow!("master task failed: {}", e))
            }
        }
    }

    fn send(&self, message: MasterMessage) -> std::result::Result<(), MasterError> {
        self.messages.send(message).map_err(|_| MasterError::Stopped)
    }
}
