// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Top-level interpreter: runs the root module of one execution.
//!
//! ```text
//!  WaitingForStart ──Start──► Ready ──► Running ──► ReceivedAllOutputs ──► Done
//!        │                                 │                                  ▲
//!        └────────Cancel──────────────────►└──────────failure─────────────────┘
//! ```
//!
//! The top-level interpreter owns the runtime context lease of its execution,
//! spawns the root module interpreter at [`ExecutionTrace::root`], and publishes
//! an [`ExecutionEvent::OutputAvailable`] for every requested root out-port as
//! soon as it is signalled.

use std::sync::Arc;

use chrono::Utc;
use cloudkeeper_model::ExecutionTrace;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::{ContextLease, RuntimeContext, RuntimeContextProvider};
use crate::error::{InterpreterError, Result};
use crate::execution::{ExecutionEvent, ExecutionId, ExecutionOutcome, ExecutionParams};
use crate::interpreter::{
    Behavior, InterpreterMessage, InterpreterParams, ParentLink, spawn_interpreter,
};
use crate::port_set::PortSet;

/// Commands sent by the master to a top-level interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TopLevelCommand {
    Start,
    Cancel { cause: String },
}

/// Lifecycle state of a top-level interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TopLevelState {
    /// Created, waiting for the start command.
    WaitingForStart,
    /// Started, acquiring the runtime context and checking root in-ports.
    Ready,
    /// The root module is running.
    Running,
    /// Every requested out-port was signalled; waiting for the root to terminate.
    ReceivedAllOutputs,
    /// Terminated.
    Done,
}

impl TopLevelState {
    fn can_become(self, next: TopLevelState) -> bool {
        use TopLevelState::*;
        matches!(
            (self, next),
            (WaitingForStart, Ready)
                | (Ready, Running)
                | (Running, ReceivedAllOutputs)
                | (_, Done)
        )
    }
}

pub(crate) struct TopLevelInterpreter {
    execution_id: ExecutionId,
    params: ExecutionParams,
    provider: Arc<dyn RuntimeContextProvider>,
    events: broadcast::Sender<ExecutionEvent>,
    state: TopLevelState,
}

impl TopLevelInterpreter {
    pub(crate) fn new(
        execution_id: ExecutionId,
        params: ExecutionParams,
        provider: Arc<dyn RuntimeContextProvider>,
        events: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            params,
            provider,
            events,
            state: TopLevelState::WaitingForStart,
        }
    }

    /// Run until the execution terminates and report how it went.
    pub(crate) async fn run(
        mut self,
        mut commands: UnboundedReceiver<TopLevelCommand>,
    ) -> ExecutionOutcome {
        let failure = match self.execute(&mut commands).await {
            Ok(()) => {
                info!("Execution completed successfully");
                None
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Execution failed");
                Some(e.to_failure())
            }
        };
        self.transition(TopLevelState::Done);
        ExecutionOutcome {
            execution_id: self.execution_id,
            finished_at: Utc::now(),
            failure,
        }
    }

    fn transition(&mut self, next: TopLevelState) {
        if self.state.can_become(next) {
            debug!(from = ?self.state, to = ?next, "Top-level state transition");
            self.state = next;
        } else {
            warn!(from = ?self.state, to = ?next, "Ignoring invalid top-level state transition");
        }
    }

    async fn execute(&mut self, commands: &mut UnboundedReceiver<TopLevelCommand>) -> Result<()> {
        loop {
            match commands.recv().await {
                Some(TopLevelCommand::Start) => break,
                Some(TopLevelCommand::Cancel { cause }) => {
                    return Err(InterpreterError::Cancelled {
                        trace: ExecutionTrace::root(),
                        cause,
                    });
                }
                None => {
                    return Err(InterpreterError::Cancelled {
                        trace: ExecutionTrace::root(),
                        cause: "orchestrator stopped before the execution was started".to_string(),
                    });
                }
            }
        }
        self.transition(TopLevelState::Ready);

        let lease = ContextLease::acquire(self.provider.clone(), self.execution_id).await?;
        let result = self.run_root(lease.context().clone(), commands).await;
        lease.release().await;
        result
    }

    fn resolve_names(
        &self,
        names: &[String],
        kind: &str,
        index_of: impl Fn(&str) -> Option<usize>,
    ) -> Result<PortSet> {
        names
            .iter()
            .map(|name| {
                index_of(name).ok_or_else(|| InterpreterError::InvalidArgument {
                    trace: ExecutionTrace::root(),
                    message: format!(
                        "module '{}' has no {} '{}'",
                        self.params.module.name, kind, name
                    ),
                })
            })
            .collect()
    }

    async fn run_root(
        &mut self,
        context: Arc<RuntimeContext>,
        commands: &mut UnboundedReceiver<TopLevelCommand>,
    ) -> Result<()> {
        let module = self.params.module.clone();
        let root = ExecutionTrace::root();
        module.validate().map_err(|source| InterpreterError::Model {
            trace: root.clone(),
            source,
        })?;

        let requested = match &self.params.requested_out_ports {
            Some(names) => self.resolve_names(names, "out-port", |n| module.out_port_index(n))?,
            None => (0..module.out_ports.len()).collect(),
        };

        let checks = join_all(module.in_ports.iter().map(|port| {
            let trace = root.in_port(&port.name);
            let staging = &context.staging;
            async move {
                let result = staging.exists(&trace).await;
                (trace, result)
            }
        }))
        .await;
        let mut with_value = PortSet::new();
        for (in_port, (trace, result)) in checks.into_iter().enumerate() {
            if result.map_err(|e| InterpreterError::staging(&trace, e))? {
                with_value.insert(in_port);
            }
        }

        let updated = match &self.params.updated_in_ports {
            Some(names) => {
                let updated = self.resolve_names(names, "in-port", |n| module.in_port_index(n))?;
                let missing: Vec<String> = updated
                    .iter()
                    .filter(|i| !with_value.contains(*i))
                    .map(|i| module.in_ports[i].name.clone())
                    .collect();
                if !missing.is_empty() {
                    return Err(InterpreterError::MissingInPortValues {
                        trace: root,
                        in_ports: missing,
                    });
                }
                updated
            }
            None => with_value.clone(),
        };

        let behavior = Behavior::resolve(&module, &context.repository).map_err(|source| {
            InterpreterError::Model {
                trace: root.clone(),
                source,
            }
        })?;

        let (parent_tx, mut mailbox) = mpsc::unbounded_channel();
        let params = InterpreterParams {
            module: module.clone(),
            trace: root.clone(),
            requested_out_ports: requested.clone(),
            recomputed_in_ports: updated.clone(),
            context,
            parent: ParentLink::new(parent_tx, 0),
        };
        let (root_mailbox, future) = spawn_interpreter(params, behavior);
        // Aborts the root (and with it every descendant) when dropped
        let mut root_task = JoinSet::new();
        root_task.spawn(future);

        self.transition(TopLevelState::Running);
        info!(
            module = %module.name,
            requested = ?requested,
            updated = ?updated,
            "Root module started"
        );
        for in_port in updated.iter() {
            let _ = root_mailbox.send(InterpreterMessage::InPortHasSignal { in_port });
        }

        let mut missing = requested;
        if missing.is_empty() {
            self.transition(TopLevelState::ReceivedAllOutputs);
        }
        let mut commands_open = true;
        let mut cancelled = false;

        loop {
            tokio::select! {
                biased;

                command = commands.recv(), if commands_open => match command {
                    Some(TopLevelCommand::Start) => {
                        warn!("Ignoring duplicate start command");
                    }
                    Some(TopLevelCommand::Cancel { cause }) => {
                        if !cancelled {
                            info!(cause = %cause, "Cancelling execution");
                            cancelled = true;
                            let _ = root_mailbox.send(InterpreterMessage::Cancel { cause });
                        }
                    }
                    None => {
                        commands_open = false;
                        if !cancelled {
                            cancelled = true;
                            let _ = root_mailbox.send(InterpreterMessage::Cancel {
                                cause: "orchestrator stopped".to_string(),
                            });
                        }
                    }
                },

                Some(message) = mailbox.recv() => {
                    self.root_message(message, &mut missing);
                }

                joined = root_task.join_next() => {
                    while let Ok(message) = mailbox.try_recv() {
                        self.root_message(message, &mut missing);
                    }
                    let result = match joined {
                        Some(Ok(result)) => result,
                        Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Some(Err(e)) => {
                            return Err(InterpreterError::UnexpectedTermination {
                                trace: root,
                                message: e.to_string(),
                            });
                        }
                        None => {
                            return Err(InterpreterError::protocol(&root, "root module task missing"));
                        }
                    };
                    result?;
                    if !missing.is_empty() {
                        let names: Vec<&str> = missing
                            .iter()
                            .map(|o| module.out_ports[o].name.as_str())
                            .collect();
                        return Err(InterpreterError::UnexpectedTermination {
                            trace: root,
                            message: format!("out-ports {:?} were never signalled", names),
                        });
                    }
                    return Ok(());
                }
            }
        }
    }

    fn root_message(&mut self, message: InterpreterMessage, missing: &mut PortSet) {
        match message {
            InterpreterMessage::SubmoduleOutPortHasSignal { out_port, .. } => {
                let Some(port) = self.params.module.out_ports.get(out_port) else {
                    warn!(out_port, "Root signalled an unknown out-port");
                    return;
                };
                let trace = ExecutionTrace::root().out_port(&port.name);
                info!(out_port = %port.name, "Output available");
                // No subscribers is fine
                let _ = self.events.send(ExecutionEvent::OutputAvailable {
                    execution_id: self.execution_id,
                    out_port: port.name.clone(),
                    trace,
                });
                if missing.remove(out_port) && missing.is_empty() {
                    self.transition(TopLevelState::ReceivedAllOutputs);
                }
            }
            other => warn!(message = ?other, "Unexpected message from the root module"),
        }
    }
}
