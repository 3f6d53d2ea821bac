// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interpreter of composite modules (and of loop iterations).
//!
//! A composite interpreter runs in two phases:
//!
//! 1. **Resume.** Build the [`DependencyGraph`] of the body for the requested
//!    out-ports and drive [`ComputeResumeState`], answering its value checks with
//!    parallel staging-area `exists` calls. In-port signals arriving meanwhile
//!    are buffered.
//! 2. **Run.** Signal requested out-ports whose existing value can be reused,
//!    spawn every child that has needed out-ports, and route values along
//!    connections into `RECOMPUTE` targets as soon as their sources signal.
//!
//! ```text
//!  start ──► value checks ──► finish() ──► report READY out-ports
//!                                      ├─► spawn children
//!                                      └─► route present in-ports + buffered signals
//!  signals ──► route_from(source) ──► copy ──► signal child / report out-port
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use cloudkeeper_model::{Body, Endpoint, ExecutionTrace, ModelError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use super::{
    Behavior, Interpreter, InterpreterCore, InterpreterMessage, InterpreterParams, ParentLink,
    spawn_interpreter,
};
use crate::error::{InterpreterError, Result};
use crate::graph::{DependencyGraph, GraphError, HasValue, NodeId};
use crate::port_set::PortSet;
use crate::resume::{ComputeResumeState, ResumeError, ResumePlan};
use crate::staging;

pub(crate) enum CompositeCompletion {
    ValueChecked {
        node: NodeId,
        trace: ExecutionTrace,
        result: staging::Result<bool>,
    },
    Routed {
        target: Endpoint,
        trace: ExecutionTrace,
        result: staging::Result<()>,
    },
    ChildTerminated {
        child: usize,
        result: Result<()>,
    },
}

struct ChildState {
    mailbox: UnboundedSender<InterpreterMessage>,
    trace: ExecutionTrace,
    requested: PortSet,
    signalled: PortSet,
}

pub(crate) struct CompositeInterpreter {
    core: InterpreterCore<CompositeCompletion>,
    body: Arc<Body>,
    own_mailbox: UnboundedSender<InterpreterMessage>,
    resume: Option<ComputeResumeState>,
    plan: Option<ResumePlan>,
    buffered_in_ports: Vec<usize>,
    children: HashMap<usize, ChildState>,
}

impl CompositeInterpreter {
    pub(crate) fn new(
        params: InterpreterParams,
        body: Arc<Body>,
        own_mailbox: UnboundedSender<InterpreterMessage>,
    ) -> Self {
        Self {
            core: InterpreterCore::new(params),
            body,
            own_mailbox,
            resume: None,
            plan: None,
            buffered_in_ports: Vec::new(),
            children: HashMap::new(),
        }
    }

    fn child_trace(&self, child: usize) -> ExecutionTrace {
        let name = self
            .body
            .child(child)
            .map(|c| c.name.as_str())
            .unwrap_or("?");
        self.core.trace.child(name)
    }

    fn endpoint_trace(&self, endpoint: Endpoint) -> ExecutionTrace {
        match endpoint {
            Endpoint::InPort(port) => self.core.in_port_trace(port),
            Endpoint::OutPort(port) => self.core.out_port_trace(port),
            Endpoint::ChildIn { child, port } => {
                let name = self
                    .body
                    .child(child)
                    .and_then(|c| c.in_ports.get(port))
                    .map(|p| p.name.as_str())
                    .unwrap_or("?");
                self.child_trace(child).in_port(name)
            }
            Endpoint::ChildOut { child, port } => {
                let name = self
                    .body
                    .child(child)
                    .and_then(|c| c.out_ports.get(port))
                    .map(|p| p.name.as_str())
                    .unwrap_or("?");
                self.child_trace(child).out_port(name)
            }
        }
    }

    fn node_trace(&self, node: NodeId) -> ExecutionTrace {
        match node {
            NodeId::InPort(port) => self.core.in_port_trace(port),
            NodeId::OutPort(port) => self.core.out_port_trace(port),
            NodeId::Submodule(child) => self.child_trace(child),
            NodeId::SubmoduleInPort { child, port } => {
                self.endpoint_trace(Endpoint::ChildIn { child, port })
            }
        }
    }

    fn graph_error(&self, error: GraphError) -> InterpreterError {
        match error {
            GraphError::InvalidArgument(message) => InterpreterError::InvalidArgument {
                trace: self.core.trace.clone(),
                message,
            },
            other => InterpreterError::protocol(&self.core.trace, other.to_string()),
        }
    }

    fn resume_error(&self, error: ResumeError) -> InterpreterError {
        match error {
            ResumeError::MissingInPortValues { in_ports } => {
                InterpreterError::MissingInPortValues {
                    trace: self.core.trace.clone(),
                    in_ports: in_ports
                        .into_iter()
                        .map(|i| self.core.in_port_name(i).to_string())
                        .collect(),
                }
            }
            ResumeError::UnconnectedPorts { nodes } => {
                let ports: Vec<String> = nodes
                    .into_iter()
                    .map(|n| self.node_trace(n).to_string())
                    .collect();
                InterpreterError::Model {
                    trace: self.core.trace.clone(),
                    source: ModelError::Malformed {
                        module: self.core.module.name.clone(),
                        reason: format!("no connection feeds {}", ports.join(", ")),
                    },
                }
            }
            ResumeError::Graph(error) => self.graph_error(error),
            other => InterpreterError::protocol(&self.core.trace, other.to_string()),
        }
    }

    fn spawn_value_checks(&mut self, nodes: Vec<NodeId>) {
        for node in nodes {
            let trace = self.node_trace(node);
            let staging = self.core.context.staging.clone();
            self.core
                .actions
                .spawn(format!("check value of {}", trace), async move {
                    let result = staging.exists(&trace).await;
                    CompositeCompletion::ValueChecked {
                        node,
                        trace,
                        result,
                    }
                });
        }
    }

    fn finish_resume_if_done(&mut self) -> Result<()> {
        if !self.resume.as_ref().is_some_and(|r| r.is_finished()) {
            return Ok(());
        }
        let Some(resume) = self.resume.take() else {
            return Ok(());
        };
        let plan = resume.finish().map_err(|e| self.resume_error(e))?;
        self.run_plan(plan)
    }

    fn run_plan(&mut self, plan: ResumePlan) -> Result<()> {
        let children: Vec<usize> = plan.children_to_run().collect();
        debug!(children = children.len(), "Resume state computed");

        let requested: Vec<usize> = self.core.requested_out_ports.iter().collect();
        for out_port in requested {
            if !plan.is_recompute(NodeId::OutPort(out_port)) {
                debug!(out_port = %self.core.out_port_name(out_port), "Reusing existing out-port value");
                self.core.report_out_port(out_port);
            }
        }

        for child in children {
            let requested = plan.needed_out_ports(child).clone();
            let recomputed = plan.recomputed_child_in_ports(child);
            self.spawn_child(child, requested, recomputed)?;
        }

        let present_in_ports: Vec<usize> = (0..self.core.module.in_ports.len())
            .filter(|&i| !self.core.recomputed_in_ports.contains(i))
            .filter(|&i| plan.graph().has_value(NodeId::InPort(i)) == Ok(HasValue::HasValue))
            .collect();
        self.plan = Some(plan);

        for in_port in present_in_ports {
            self.route_from(Endpoint::InPort(in_port))?;
        }
        for in_port in std::mem::take(&mut self.buffered_in_ports) {
            self.route_from(Endpoint::InPort(in_port))?;
        }
        Ok(())
    }

    fn spawn_child(&mut self, child: usize, requested: PortSet, recomputed: PortSet) -> Result<()> {
        let trace = self.child_trace(child);
        let module = self.body.child(child).cloned().ok_or_else(|| {
            InterpreterError::protocol(&self.core.trace, format!("no child {}", child))
        })?;
        let behavior = Behavior::resolve(&module, &self.core.context.repository).map_err(
            |source| InterpreterError::Model {
                trace: trace.clone(),
                source,
            },
        )?;
        debug!(
            child = %module.name,
            requested = ?requested,
            recomputed = ?recomputed,
            "Spawning child"
        );

        let params = InterpreterParams {
            module,
            trace: trace.clone(),
            requested_out_ports: requested.clone(),
            recomputed_in_ports: recomputed,
            context: self.core.context.clone(),
            parent: ParentLink::new(self.own_mailbox.clone(), child),
        };
        let (mailbox, future) = spawn_interpreter(params, behavior);
        self.core
            .actions
            .spawn(format!("run child {}", trace), async move {
                CompositeCompletion::ChildTerminated {
                    child,
                    result: future.await,
                }
            });
        self.children.insert(
            child,
            ChildState {
                mailbox,
                trace,
                requested,
                signalled: PortSet::new(),
            },
        );
        Ok(())
    }

    /// Copy the value at `source` along every connection into a `RECOMPUTE` target.
    fn route_from(&mut self, source: Endpoint) -> Result<()> {
        let Some(plan) = &self.plan else {
            return Err(InterpreterError::protocol(
                &self.core.trace,
                format!("routing from {} before the resume state is known", source),
            ));
        };

        let mut targets = Vec::new();
        for connection in self.body.connections_from(source) {
            let node = plan
                .graph()
                .target_node(connection.to)
                .map_err(|e| self.graph_error(e))?;
            if plan.is_recompute(node) {
                targets.push(connection.to);
            }
        }

        let from = self.endpoint_trace(source);
        for target in targets {
            let to = self.endpoint_trace(target);
            let staging = self.core.context.staging.clone();
            let from = from.clone();
            self.core
                .actions
                .spawn(format!("copy {} to {}", from, to), async move {
                    let result = staging.copy(&from, &to).await;
                    CompositeCompletion::Routed {
                        target,
                        trace: to,
                        result,
                    }
                });
        }
        Ok(())
    }
}

impl Interpreter for CompositeInterpreter {
    type Completion = CompositeCompletion;

    fn core(&mut self) -> &mut InterpreterCore<Self::Completion> {
        &mut self.core
    }

    fn start(&mut self) -> Result<()> {
        let graph = DependencyGraph::new(
            self.core.module.in_ports.len(),
            self.core.module.out_ports.len(),
            &self.body,
            &self.core.requested_out_ports,
        )
        .map_err(|e| self.graph_error(e))?;
        let mut resume = ComputeResumeState::new(graph, &self.core.recomputed_in_ports)
            .map_err(|e| self.resume_error(e))?;

        let mut checks = Vec::new();
        resume
            .run(&mut |node| checks.push(node))
            .map_err(|e| self.resume_error(e))?;
        self.resume = Some(resume);
        self.spawn_value_checks(checks);
        self.finish_resume_if_done()
    }

    fn in_port_has_signal(&mut self, in_port: usize) -> Result<()> {
        self.core.check_in_port(in_port)?;
        if !self.core.recomputed_in_ports.contains(in_port) {
            debug!(in_port = %self.core.in_port_name(in_port), "Ignoring signal for in-port that is not recomputed");
            return Ok(());
        }
        if self.plan.is_none() {
            self.buffered_in_ports.push(in_port);
            return Ok(());
        }
        self.route_from(Endpoint::InPort(in_port))
    }

    fn submodule_out_port_has_signal(&mut self, child: usize, out_port: usize) -> Result<()> {
        let Some(state) = self.children.get_mut(&child) else {
            return Err(InterpreterError::protocol(
                &self.core.trace,
                format!("out-port signal from child {} that is not running", child),
            ));
        };
        state.signalled.insert(out_port);
        self.route_from(Endpoint::ChildOut {
            child,
            port: out_port,
        })
    }

    fn completed(&mut self, completion: Self::Completion) -> Result<()> {
        match completion {
            CompositeCompletion::ValueChecked {
                node,
                trace,
                result,
            } => {
                let present = result.map_err(|e| InterpreterError::staging(&trace, e))?;
                let Some(mut resume) = self.resume.take() else {
                    return Err(InterpreterError::protocol(
                        &self.core.trace,
                        "value check completed after the resume state was computed",
                    ));
                };
                let mut checks = Vec::new();
                let updated = resume.update_has_value(node, present, &mut |n| checks.push(n));
                self.resume = Some(resume);
                updated.map_err(|e| self.resume_error(e))?;
                self.spawn_value_checks(checks);
                self.finish_resume_if_done()
            }
            CompositeCompletion::Routed {
                target,
                trace,
                result,
            } => {
                result.map_err(|e| InterpreterError::staging(&trace, e))?;
                match target {
                    Endpoint::ChildIn { child, port } => {
                        match self.children.get(&child) {
                            Some(state) => {
                                // A child that already finished no longer needs the value
                                let _ = state
                                    .mailbox
                                    .send(InterpreterMessage::InPortHasSignal { in_port: port });
                            }
                            None => debug!(child, "Value routed to a child that is not running"),
                        }
                        Ok(())
                    }
                    Endpoint::OutPort(out_port) => {
                        if self.core.requested_out_ports.contains(out_port) {
                            self.core.report_out_port(out_port);
                        }
                        Ok(())
                    }
                    other => Err(InterpreterError::protocol(
                        &self.core.trace,
                        format!("value routed to source endpoint {}", other),
                    )),
                }
            }
            CompositeCompletion::ChildTerminated { child, result } => {
                let Some(state) = self.children.remove(&child) else {
                    return Err(InterpreterError::protocol(
                        &self.core.trace,
                        format!("unknown child {} terminated", child),
                    ));
                };
                result?;
                if !state.requested.is_subset(&state.signalled) {
                    let missing: Vec<usize> = state
                        .requested
                        .iter()
                        .filter(|o| !state.signalled.contains(*o))
                        .collect();
                    return Err(InterpreterError::UnexpectedTermination {
                        trace: state.trace,
                        message: format!("out-ports {:?} were never signalled", missing),
                    });
                }
                info!(child = %state.trace, "Child completed");
                Ok(())
            }
        }
    }

    fn cancel(&mut self, cause: &str) {
        for state in self.children.values() {
            let _ = state.mailbox.send(InterpreterMessage::Cancel {
                cause: cause.to_string(),
            });
        }
    }
}
