// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interpreter of loop modules.
//!
//! Each iteration runs the loop body as a composite module at `<loop>/#<n>`.
//! Iteration 0 receives the loop's in-port values. After an iteration, the
//! continue out-port decides: `true` feeds the next iteration (an in-port takes
//! the value of the same-named out-port if there is one, otherwise it carries
//! over unchanged), `false` copies the requested out-ports of the last iteration
//! to the loop's own out-ports.

use std::sync::Arc;

use cloudkeeper_model::{Body, ExecutionTrace};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use super::{
    Behavior, Interpreter, InterpreterCore, InterpreterMessage, InterpreterParams, ParentLink,
    spawn_interpreter,
};
use crate::error::{InterpreterError, Result};
use crate::port_set::PortSet;
use crate::staging;

pub(crate) enum LoopCompletion {
    /// An in-port value of the next iteration was staged.
    Staged {
        trace: ExecutionTrace,
        result: staging::Result<()>,
    },
    IterationTerminated {
        iteration: u64,
        result: Result<()>,
    },
    ContinueValue {
        trace: ExecutionTrace,
        result: staging::Result<Value>,
    },
    /// An out-port value of the final iteration was copied to the loop.
    Finished {
        out_port: usize,
        trace: ExecutionTrace,
        result: staging::Result<()>,
    },
}

pub(crate) struct LoopInterpreter {
    core: InterpreterCore<LoopCompletion>,
    body: Arc<Body>,
    continue_port: usize,
    own_mailbox: UnboundedSender<InterpreterMessage>,
    waiting_for: PortSet,
    started: bool,
    iteration: u64,
    pending_copies: usize,
    body_mailbox: Option<UnboundedSender<InterpreterMessage>>,
    body_signalled: PortSet,
}

impl LoopInterpreter {
    pub(crate) fn new(
        params: InterpreterParams,
        body: Arc<Body>,
        continue_port: usize,
        own_mailbox: UnboundedSender<InterpreterMessage>,
    ) -> Self {
        let core = InterpreterCore::new(params);
        let waiting_for = core.recomputed_in_ports.clone();
        Self {
            core,
            body,
            continue_port,
            own_mailbox,
            waiting_for,
            started: false,
            iteration: 0,
            pending_copies: 0,
            body_mailbox: None,
            body_signalled: PortSet::new(),
        }
    }

    fn iteration_trace(&self, iteration: u64) -> ExecutionTrace {
        self.core.trace.iteration(iteration)
    }

    /// Stage the in-ports of the current iteration, then run it.
    fn stage_iteration(&mut self, sources: Vec<(ExecutionTrace, ExecutionTrace)>) -> Result<()> {
        if sources.is_empty() {
            return self.spawn_iteration();
        }
        self.pending_copies = sources.len();
        for (from, to) in sources {
            let staging = self.core.context.staging.clone();
            self.core
                .actions
                .spawn(format!("copy {} to {}", from, to), async move {
                    let result = staging.copy(&from, &to).await;
                    LoopCompletion::Staged { trace: to, result }
                });
        }
        Ok(())
    }

    fn stage_first_iteration(&mut self) -> Result<()> {
        self.started = true;
        let scope = self.iteration_trace(0);
        let sources = self
            .core
            .module
            .in_ports
            .iter()
            .map(|p| (self.core.trace.in_port(&p.name), scope.in_port(&p.name)))
            .collect();
        self.stage_iteration(sources)
    }

    fn stage_next_iteration(&mut self) -> Result<()> {
        let previous = self.iteration_trace(self.iteration);
        self.iteration += 1;
        let scope = self.iteration_trace(self.iteration);
        let module = &self.core.module;
        let sources = module
            .in_ports
            .iter()
            .map(|p| {
                let from = match module.out_port_index(&p.name) {
                    Some(_) => previous.out_port(&p.name),
                    None => previous.in_port(&p.name),
                };
                (from, scope.in_port(&p.name))
            })
            .collect();
        debug!(iteration = self.iteration, "Continuing loop");
        self.stage_iteration(sources)
    }

    fn spawn_iteration(&mut self) -> Result<()> {
        let iteration = self.iteration;
        let trace = self.iteration_trace(iteration);
        let in_ports = self.core.module.in_ports.len();
        let recomputed: PortSet = if iteration == 0 {
            self.core.recomputed_in_ports.clone()
        } else {
            (0..in_ports).collect()
        };
        let index = usize::try_from(iteration).map_err(|_| {
            InterpreterError::protocol(&self.core.trace, "iteration count overflow")
        })?;

        let params = InterpreterParams {
            module: self.core.module.clone(),
            trace: trace.clone(),
            requested_out_ports: (0..self.core.module.out_ports.len()).collect(),
            recomputed_in_ports: recomputed.clone(),
            context: self.core.context.clone(),
            parent: ParentLink::new(self.own_mailbox.clone(), index),
        };
        let behavior = Behavior::Composite {
            body: self.body.clone(),
        };
        let (mailbox, future) = spawn_interpreter(params, behavior);
        self.core
            .actions
            .spawn(format!("run iteration {}", trace), async move {
                LoopCompletion::IterationTerminated {
                    iteration,
                    result: future.await,
                }
            });

        // The staged values are in place; announce them right away
        for in_port in recomputed.iter() {
            let _ = mailbox.send(InterpreterMessage::InPortHasSignal { in_port });
        }
        self.body_mailbox = Some(mailbox);
        self.body_signalled = PortSet::new();
        Ok(())
    }

    fn read_continue_value(&mut self) {
        let name = self.core.out_port_name(self.continue_port).to_string();
        let trace = self.iteration_trace(self.iteration).out_port(&name);
        let staging = self.core.context.staging.clone();
        self.core
            .actions
            .spawn(format!("read {}", trace), async move {
                let result = staging.get(&trace).await;
                LoopCompletion::ContinueValue { trace, result }
            });
    }

    fn finish(&mut self) {
        info!(iterations = self.iteration + 1, "Loop finished");
        let last = self.iteration_trace(self.iteration);
        let requested: Vec<usize> = self.core.requested_out_ports.iter().collect();
        for out_port in requested {
            let name = self.core.out_port_name(out_port).to_string();
            let from = last.out_port(&name);
            let to = self.core.out_port_trace(out_port);
            let staging = self.core.context.staging.clone();
            self.core
                .actions
                .spawn(format!("copy {} to {}", from, to), async move {
                    let result = staging.copy(&from, &to).await;
                    LoopCompletion::Finished {
                        out_port,
                        trace: to,
                        result,
                    }
                });
        }
    }
}

impl Interpreter for LoopInterpreter {
    type Completion = LoopCompletion;

    fn core(&mut self) -> &mut InterpreterCore<Self::Completion> {
        &mut self.core
    }

    fn start(&mut self) -> Result<()> {
        if self.core.requested_out_ports.is_empty() {
            return Ok(());
        }
        if self.waiting_for.is_empty() {
            self.stage_first_iteration()?;
        }
        Ok(())
    }

    fn in_port_has_signal(&mut self, in_port: usize) -> Result<()> {
        self.core.check_in_port(in_port)?;
        if !self.waiting_for.remove(in_port) {
            debug!(in_port = %self.core.in_port_name(in_port), "Ignoring signal for in-port that is not awaited");
            return Ok(());
        }
        if self.waiting_for.is_empty() && !self.started && !self.core.requested_out_ports.is_empty()
        {
            self.stage_first_iteration()?;
        }
        Ok(())
    }

    fn submodule_out_port_has_signal(&mut self, child: usize, out_port: usize) -> Result<()> {
        if child as u64 != self.iteration {
            debug!(child, "Ignoring signal from a previous iteration");
            return Ok(());
        }
        self.body_signalled.insert(out_port);
        Ok(())
    }

    fn completed(&mut self, completion: Self::Completion) -> Result<()> {
        match completion {
            LoopCompletion::Staged { trace, result } => {
                result.map_err(|e| InterpreterError::staging(&trace, e))?;
                self.pending_copies -= 1;
                if self.pending_copies == 0 {
                    self.spawn_iteration()?;
                }
                Ok(())
            }
            LoopCompletion::IterationTerminated { iteration, result } => {
                self.body_mailbox = None;
                result?;
                let all_out_ports: PortSet = (0..self.core.module.out_ports.len()).collect();
                if !all_out_ports.is_subset(&self.body_signalled) {
                    return Err(InterpreterError::UnexpectedTermination {
                        trace: self.iteration_trace(iteration),
                        message: "iteration finished without producing every out-port"
                            .to_string(),
                    });
                }
                self.read_continue_value();
                Ok(())
            }
            LoopCompletion::ContinueValue { trace, result } => {
                match result.map_err(|e| InterpreterError::staging(&trace, e))? {
                    Value::Bool(true) => self.stage_next_iteration(),
                    Value::Bool(false) => {
                        self.finish();
                        Ok(())
                    }
                    value => Err(InterpreterError::InvalidContinueValue {
                        trace: self.core.trace.clone(),
                        value,
                    }),
                }
            }
            LoopCompletion::Finished {
                out_port,
                trace,
                result,
            } => {
                result.map_err(|e| InterpreterError::staging(&trace, e))?;
                self.core.report_out_port(out_port);
                Ok(())
            }
        }
    }

    fn cancel(&mut self, cause: &str) {
        if let Some(mailbox) = &self.body_mailbox {
            let _ = mailbox.send(InterpreterMessage::Cancel {
                cause: cause.to_string(),
            });
        }
    }
}
