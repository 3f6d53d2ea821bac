// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resume-state computation.
//!
//! [`ComputeResumeState`] classifies every on-path node of a [`DependencyGraph`]
//! and derives, per child, the set of out-ports that must be computed. It is a
//! worklist over two FIFO queues; the recompute queue is always drained first so
//! that no value check is started for a node that a forced recomputation would
//! make moot anyway.
//!
//! Value presence is asked through a caller-supplied `check` callback that is
//! invoked exactly once per node moving to [`HasValue::PendingValueCheck`]. The
//! caller answers each check with [`ComputeResumeState::update_has_value`], in
//! any order and at any later time.
//!
//! ```text
//!  new(graph, recomputed) ──► run(check) ──► update_has_value(..)* ──► finish()
//!                                 │                    ▲
//!                                 └── check(node) ─────┘  (async, by caller)
//! ```

use std::collections::{HashSet, VecDeque};

use thiserror::Error;
use tracing::trace;

use crate::graph::{DependencyGraph, GraphError, HasValue, NodeId, PortState, Witness};
use crate::port_set::PortSet;

/// Errors from the resume-state computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ResumeError {
    /// In-ports that must be recomputed but will never receive a value.
    #[error("In-ports {in_ports:?} need a value but none will be provided")]
    MissingInPortValues {
        /// The offending in-port indices.
        in_ports: Vec<usize>,
    },

    /// Ports that must receive a new value but have no incoming connection.
    #[error("Ports {nodes:?} must be recomputed but nothing is connected to them")]
    UnconnectedPorts {
        /// The offending out-port and child in-port nodes.
        nodes: Vec<NodeId>,
    },

    /// The graph rejected an operation.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The caller broke the check/update protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Worklist state of one resume computation.
#[derive(Debug)]
pub struct ComputeResumeState {
    graph: DependencyGraph,
    recomputed: PortSet,
    recompute_queue: VecDeque<NodeId>,
    ready_queue: VecDeque<NodeId>,
    pending_checks: usize,
    expanded: HashSet<NodeId>,
    needed: Vec<PortSet>,
}

impl ComputeResumeState {
    /// Seed the worklist.
    ///
    /// Recomputed in-ports on a path to a requested out-port start as
    /// `RECOMPUTE`; requested out-ports start as `READY`.
    pub fn new(mut graph: DependencyGraph, recomputed: &PortSet) -> Result<Self, ResumeError> {
        let mut recompute_queue = VecDeque::new();
        for in_port in recomputed.iter() {
            let node = NodeId::InPort(in_port);
            if graph.is_on_path(node)? {
                graph.set_port_state(node, PortState::Recompute)?;
                recompute_queue.push_back(node);
            }
        }

        let mut ready_queue = VecDeque::new();
        let requested: Vec<usize> = graph.requested_out_ports().iter().collect();
        for out_port in requested {
            let node = NodeId::OutPort(out_port);
            graph.set_port_state(node, PortState::Ready)?;
            ready_queue.push_back(node);
        }

        let needed = vec![PortSet::new(); graph.child_count()];
        Ok(Self {
            graph,
            recomputed: recomputed.clone(),
            recompute_queue,
            ready_queue,
            pending_checks: 0,
            expanded: HashSet::new(),
            needed,
        })
    }

    /// The graph in its current state.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Process queued nodes until both queues are empty.
    ///
    /// `check` is called for every node whose value presence must be asked.
    pub fn run(&mut self, check: &mut dyn FnMut(NodeId)) -> Result<(), ResumeError> {
        while let Some(node) = self.next_node() {
            self.process(node, check)?;
        }
        Ok(())
    }

    fn next_node(&mut self) -> Option<NodeId> {
        match self.recompute_queue.pop_front() {
            Some(node) => Some(node),
            None => self.ready_queue.pop_front(),
        }
    }

    /// Resolve a pending value check and continue processing.
    pub fn update_has_value(
        &mut self,
        node: NodeId,
        present: bool,
        check: &mut dyn FnMut(NodeId),
    ) -> Result<(), ResumeError> {
        if self.graph.has_value(node)? != HasValue::PendingValueCheck {
            return Err(ResumeError::ProtocolViolation(format!(
                "value check result for {:?} without a pending check",
                node
            )));
        }
        let resolved = if present {
            HasValue::HasValue
        } else {
            HasValue::NoValue
        };
        self.graph.set_has_value(node, resolved)?;
        self.pending_checks -= 1;
        trace!(node = ?node, present, "Value check resolved");
        self.ready_queue.push_back(node);
        self.run(check)
    }

    /// True when both queues are empty and no value check is pending.
    pub fn is_finished(&self) -> bool {
        self.recompute_queue.is_empty() && self.ready_queue.is_empty() && self.pending_checks == 0
    }

    /// Validate the final state and produce the plan.
    pub fn finish(self) -> Result<ResumePlan, ResumeError> {
        if !self.is_finished() {
            return Err(ResumeError::ProtocolViolation(format!(
                "resume state finished with {} pending value checks",
                self.pending_checks
            )));
        }

        let mut missing = Vec::new();
        for in_port in 0..self.graph.in_port_count() {
            let node = NodeId::InPort(in_port);
            if self.graph.port_state(node)? == PortState::Recompute
                && !self.recomputed.contains(in_port)
            {
                missing.push(in_port);
            }
        }
        if !missing.is_empty() {
            return Err(ResumeError::MissingInPortValues { in_ports: missing });
        }

        let mut unconnected = Vec::new();
        for node in self.graph.nodes() {
            if matches!(node, NodeId::OutPort(_) | NodeId::SubmoduleInPort { .. })
                && self.graph.port_state(node)? == PortState::Recompute
                && self.graph.predecessors(node)?.next().is_none()
            {
                unconnected.push(node);
            }
        }
        if !unconnected.is_empty() {
            return Err(ResumeError::UnconnectedPorts { nodes: unconnected });
        }

        Ok(ResumePlan {
            graph: self.graph,
            needed: self.needed,
        })
    }

    fn process(&mut self, node: NodeId, check: &mut dyn FnMut(NodeId)) -> Result<(), ResumeError> {
        if self.graph.port_state(node)? == PortState::Ready {
            match self.graph.has_value(node)? {
                HasValue::Unknown => {
                    self.graph.set_has_value(node, HasValue::PendingValueCheck)?;
                    self.pending_checks += 1;
                    check(node);
                    return Ok(());
                }
                HasValue::PendingValueCheck | HasValue::HasValue => return Ok(()),
                HasValue::NoValue => self.graph.set_port_state(node, PortState::Recompute)?,
            }
        }

        if self.graph.port_state(node)? != PortState::Recompute || !self.expanded.insert(node) {
            return Ok(());
        }

        let predecessors: Vec<(NodeId, Option<Witness>)> =
            self.graph.predecessors(node)?.collect();
        for (predecessor, witness) in predecessors {
            self.record(witness);
            if self.graph.port_state(predecessor)? == PortState::Irrelevant {
                self.graph.set_port_state(predecessor, PortState::Ready)?;
                self.ready_queue.push_back(predecessor);
            }
        }

        let successors: Vec<(NodeId, Option<Witness>)> = self.graph.successors(node)?.collect();
        for (successor, witness) in successors {
            self.record(witness);
            if self.graph.port_state(successor)? != PortState::Recompute {
                self.graph.set_port_state(successor, PortState::Recompute)?;
                self.recompute_queue.push_back(successor);
            }
        }
        Ok(())
    }

    fn record(&mut self, witness: Option<Witness>) {
        if let Some(Witness { child, out_port }) = witness {
            self.needed[child].insert(out_port);
        }
    }
}

/// The outcome of a finished resume computation.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    graph: DependencyGraph,
    needed: Vec<PortSet>,
}

impl ResumePlan {
    /// The graph with final node states.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Out-ports of `child` that must be computed.
    pub fn needed_out_ports(&self, child: usize) -> &PortSet {
        &self.needed[child]
    }

    /// Children with at least one needed out-port, ascending.
    pub fn children_to_run(&self) -> impl Iterator<Item = usize> + '_ {
        self.needed
            .iter()
            .enumerate()
            .filter(|(_, ports)| !ports.is_empty())
            .map(|(child, _)| child)
    }

    /// In-ports of `child` that will receive a new value.
    pub fn recomputed_child_in_ports(&self, child: usize) -> PortSet {
        self.graph
            .nodes()
            .filter_map(|node| match node {
                NodeId::SubmoduleInPort { child: c, port } if c == child => Some((node, port)),
                _ => None,
            })
            .filter(|(node, _)| self.graph.port_state(*node) == Ok(PortState::Recompute))
            .map(|(_, port)| port)
            .collect()
    }

    /// Whether `node` must receive a new value.
    pub fn is_recompute(&self, node: NodeId) -> bool {
        self.graph.port_state(node) == Ok(PortState::Recompute)
    }
}
