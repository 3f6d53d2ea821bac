// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency graph of one composite (or loop body) module.
//!
//! The graph is an arena of nodes addressed by [`NodeId`]. Each node is one of
//! the module's own in-ports or out-ports, a direct child (a *submodule*), or an
//! in-port of a direct child. Child out-ports are not nodes: an edge whose source
//! is a child out-port is recorded from the child's submodule node and from each
//! of the child's in-port nodes, tagged with the out-port as its [`Witness`].
//!
//! ```text
//!   InPort(0) ──────────────► SubmoduleInPort{0,0}
//!                                     │  witness (child 0, out 0)
//!   Submodule(0) ─────────────────────┼──────────► OutPort(0)
//!                                     ▼
//!                             (same target, same witness)
//! ```
//!
//! At construction time the graph is pruned: only nodes that are (transitive)
//! predecessors of a requested out-port are marked as being on the path to an
//! out-port, and every query filters edges through that flag.

use std::collections::VecDeque;

use cloudkeeper_model::{Body, Endpoint};
use thiserror::Error;

use crate::port_set::PortSet;

/// Errors from building or mutating a [`DependencyGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum GraphError {
    /// A port, child or requested out-port does not belong to this module.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A port state or has-value transition would move backwards.
    #[error("Invalid transition of {node:?} from {from} to {to}")]
    InvalidTransition {
        /// The node being updated.
        node: NodeId,
        /// Current state.
        from: &'static str,
        /// Rejected new state.
        to: &'static str,
    },
}

/// Identifies a node of a [`DependencyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    /// In-port of the module.
    InPort(usize),
    /// Out-port of the module.
    OutPort(usize),
    /// A direct child of the module.
    Submodule(usize),
    /// In-port of a direct child.
    SubmoduleInPort {
        /// Child index.
        child: usize,
        /// In-port index on the child.
        port: usize,
    },
}

/// Recomputation classification of a node.
///
/// Ordered: a node may only move from a smaller to a larger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortState {
    /// Not needed (yet).
    Irrelevant,
    /// Needed, and an existing value may be used.
    Ready,
    /// Needed, and a new value must be produced.
    Recompute,
}

impl PortState {
    fn as_str(self) -> &'static str {
        match self {
            PortState::Irrelevant => "IRRELEVANT",
            PortState::Ready => "READY",
            PortState::Recompute => "RECOMPUTE",
        }
    }
}

/// Knowledge about whether a value node currently has a value in the staging area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HasValue {
    /// Not asked yet.
    Unknown,
    /// An existence check is in flight.
    PendingValueCheck,
    /// A value exists.
    HasValue,
    /// No value exists.
    NoValue,
}

impl HasValue {
    fn as_str(self) -> &'static str {
        match self {
            HasValue::Unknown => "UNKNOWN",
            HasValue::PendingValueCheck => "PENDING_VALUE_CHECK",
            HasValue::HasValue => "HAS_VALUE",
            HasValue::NoValue => "NO_VALUE",
        }
    }

    fn can_become(self, next: HasValue) -> bool {
        matches!(
            (self, next),
            (HasValue::Unknown, HasValue::PendingValueCheck)
                | (HasValue::PendingValueCheck, HasValue::HasValue)
                | (HasValue::PendingValueCheck, HasValue::NoValue)
        )
    }
}

/// The child out-port whose computation realizes an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Witness {
    /// Child index.
    pub child: usize,
    /// Out-port index on the child.
    pub out_port: usize,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    slot: usize,
    witness: Option<Witness>,
}

#[derive(Debug, Clone)]
struct Node {
    id: NodeId,
    port_state: PortState,
    // None for submodule nodes, which always have a value
    has_value: Option<HasValue>,
    on_path: bool,
    predecessors: Vec<Edge>,
    successors: Vec<Edge>,
}

impl Node {
    fn new(id: NodeId) -> Self {
        let has_value = match id {
            NodeId::Submodule(_) => None,
            _ => Some(HasValue::Unknown),
        };
        Self {
            id,
            port_state: PortState::Irrelevant,
            has_value,
            on_path: false,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }
}

/// Pruned dependency graph of one module's body.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    in_ports: usize,
    out_ports: usize,
    child_in_ports: Vec<usize>,
    // slot of the first in-port node of each child
    child_offsets: Vec<usize>,
    requested: PortSet,
    nodes: Vec<Node>,
}

impl DependencyGraph {
    /// Build the graph of `body`, owned by a module with `in_ports` in-ports and
    /// `out_ports` out-ports, pruned to the requested out-ports.
    pub fn new(
        in_ports: usize,
        out_ports: usize,
        body: &Body,
        requested: &PortSet,
    ) -> Result<Self, GraphError> {
        if let Some(out_of_range) = requested.iter().find(|&o| o >= out_ports) {
            return Err(GraphError::InvalidArgument(format!(
                "requested out-port {} but the module has {} out-ports",
                out_of_range, out_ports
            )));
        }

        let child_in_ports: Vec<usize> = body.children.iter().map(|c| c.in_ports.len()).collect();
        let mut child_offsets = Vec::with_capacity(child_in_ports.len());
        let mut next = in_ports + out_ports + child_in_ports.len();
        for count in &child_in_ports {
            child_offsets.push(next);
            next += count;
        }

        let mut nodes = Vec::with_capacity(next);
        nodes.extend((0..in_ports).map(|i| Node::new(NodeId::InPort(i))));
        nodes.extend((0..out_ports).map(|o| Node::new(NodeId::OutPort(o))));
        nodes.extend((0..child_in_ports.len()).map(|c| Node::new(NodeId::Submodule(c))));
        for (child, count) in child_in_ports.iter().enumerate() {
            nodes.extend((0..*count).map(|port| Node::new(NodeId::SubmoduleInPort { child, port })));
        }

        let mut graph = Self {
            in_ports,
            out_ports,
            child_in_ports,
            child_offsets,
            requested: requested.clone(),
            nodes,
        };

        for connection in &body.connections {
            if matches!(connection.to, Endpoint::InPort(_)) {
                return Err(GraphError::InvalidArgument(format!(
                    "{} cannot be the target of a connection",
                    connection.to
                )));
            }
            let target = graph.slot(graph.target_node(connection.to)?);
            match connection.from {
                Endpoint::InPort(_) => {
                    let source = graph.slot(graph.source_node(connection.from)?);
                    graph.add_edge(source, target, None);
                }
                Endpoint::ChildOut { child, port } => {
                    let submodule = graph.slot(graph.submodule(child)?);
                    if port >= body.children[child].out_ports.len() {
                        return Err(GraphError::InvalidArgument(format!(
                            "{} is out of range",
                            connection.from
                        )));
                    }
                    let witness = Some(Witness {
                        child,
                        out_port: port,
                    });
                    graph.add_edge(submodule, target, witness);
                    let offset = graph.child_offsets[child];
                    for source in offset..offset + graph.child_in_ports[child] {
                        graph.add_edge(source, target, witness);
                    }
                }
                other => {
                    return Err(GraphError::InvalidArgument(format!(
                        "{} cannot be the source of a connection",
                        other
                    )));
                }
            }
        }

        graph.prune();
        Ok(graph)
    }

    fn add_edge(&mut self, source: usize, target: usize, witness: Option<Witness>) {
        self.nodes[source].successors.push(Edge {
            slot: target,
            witness,
        });
        self.nodes[target].predecessors.push(Edge {
            slot: source,
            witness,
        });
    }

    fn prune(&mut self) {
        let mut queue: VecDeque<usize> = self
            .requested
            .iter()
            .map(|o| self.in_ports + o)
            .collect();
        for &slot in &queue {
            self.nodes[slot].on_path = true;
        }
        while let Some(slot) = queue.pop_front() {
            for i in 0..self.nodes[slot].predecessors.len() {
                let predecessor = self.nodes[slot].predecessors[i].slot;
                if !self.nodes[predecessor].on_path {
                    self.nodes[predecessor].on_path = true;
                    queue.push_back(predecessor);
                }
            }
        }
    }

    fn slot(&self, id: NodeId) -> usize {
        match id {
            NodeId::InPort(i) => i,
            NodeId::OutPort(o) => self.in_ports + o,
            NodeId::Submodule(c) => self.in_ports + self.out_ports + c,
            NodeId::SubmoduleInPort { child, port } => self.child_offsets[child] + port,
        }
    }

    fn checked_slot(&self, id: NodeId) -> Result<usize, GraphError> {
        let valid = match id {
            NodeId::InPort(i) => i < self.in_ports,
            NodeId::OutPort(o) => o < self.out_ports,
            NodeId::Submodule(c) => c < self.child_in_ports.len(),
            NodeId::SubmoduleInPort { child, port } => {
                self.child_in_ports.get(child).is_some_and(|n| port < *n)
            }
        };
        if valid {
            Ok(self.slot(id))
        } else {
            Err(GraphError::InvalidArgument(format!(
                "{:?} is not a node of this graph",
                id
            )))
        }
    }

    /// Number of in-ports of the owning module.
    pub fn in_port_count(&self) -> usize {
        self.in_ports
    }

    /// Number of out-ports of the owning module.
    pub fn out_port_count(&self) -> usize {
        self.out_ports
    }

    /// Number of direct children.
    pub fn child_count(&self) -> usize {
        self.child_in_ports.len()
    }

    /// The requested out-ports the graph was pruned to.
    pub fn requested_out_ports(&self) -> &PortSet {
        &self.requested
    }

    /// Node for an endpoint used as the source of a connection.
    ///
    /// An `InPort`/`OutPort` endpoint of the owning module maps to the In/Out node.
    /// Child out-ports are not nodes.
    pub fn source_node(&self, endpoint: Endpoint) -> Result<NodeId, GraphError> {
        self.endpoint_node(endpoint)
    }

    /// Node for an endpoint used as the target of a connection.
    pub fn target_node(&self, endpoint: Endpoint) -> Result<NodeId, GraphError> {
        self.endpoint_node(endpoint)
    }

    fn endpoint_node(&self, endpoint: Endpoint) -> Result<NodeId, GraphError> {
        let id = match endpoint {
            Endpoint::InPort(i) => NodeId::InPort(i),
            Endpoint::OutPort(o) => NodeId::OutPort(o),
            Endpoint::ChildIn { child, port } => NodeId::SubmoduleInPort { child, port },
            Endpoint::ChildOut { .. } => {
                return Err(GraphError::InvalidArgument(format!(
                    "child out-port {} is not a node",
                    endpoint
                )));
            }
        };
        self.checked_slot(id).map(|_| id)
    }

    /// Node of the given direct child.
    pub fn submodule(&self, child: usize) -> Result<NodeId, GraphError> {
        let id = NodeId::Submodule(child);
        self.checked_slot(id).map(|_| id)
    }

    /// Every node of the graph, pruned or not.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    /// Whether the node lies on a path to a requested out-port.
    pub fn is_on_path(&self, id: NodeId) -> Result<bool, GraphError> {
        Ok(self.nodes[self.checked_slot(id)?].on_path)
    }

    /// On-path predecessors of a node, with the witness of each edge.
    pub fn predecessors(
        &self,
        id: NodeId,
    ) -> Result<impl Iterator<Item = (NodeId, Option<Witness>)> + '_, GraphError> {
        let slot = self.checked_slot(id)?;
        Ok(self.on_path_edges(&self.nodes[slot].predecessors))
    }

    /// On-path successors of a node, with the witness of each edge.
    pub fn successors(
        &self,
        id: NodeId,
    ) -> Result<impl Iterator<Item = (NodeId, Option<Witness>)> + '_, GraphError> {
        let slot = self.checked_slot(id)?;
        Ok(self.on_path_edges(&self.nodes[slot].successors))
    }

    fn on_path_edges<'a>(
        &'a self,
        edges: &'a [Edge],
    ) -> impl Iterator<Item = (NodeId, Option<Witness>)> + 'a {
        edges
            .iter()
            .filter(move |e| self.nodes[e.slot].on_path)
            .map(move |e| (self.nodes[e.slot].id, e.witness))
    }

    /// Current port state of a node.
    pub fn port_state(&self, id: NodeId) -> Result<PortState, GraphError> {
        Ok(self.nodes[self.checked_slot(id)?].port_state)
    }

    /// Advance the port state of a node. Setting the current state again is a no-op.
    pub fn set_port_state(&mut self, id: NodeId, state: PortState) -> Result<(), GraphError> {
        let slot = self.checked_slot(id)?;
        let current = self.nodes[slot].port_state;
        if state < current {
            return Err(GraphError::InvalidTransition {
                node: id,
                from: current.as_str(),
                to: state.as_str(),
            });
        }
        self.nodes[slot].port_state = state;
        Ok(())
    }

    /// Current has-value knowledge of a node. Submodule nodes always have a value.
    pub fn has_value(&self, id: NodeId) -> Result<HasValue, GraphError> {
        Ok(self.nodes[self.checked_slot(id)?]
            .has_value
            .unwrap_or(HasValue::HasValue))
    }

    /// Advance the has-value knowledge of a value node.
    pub fn set_has_value(&mut self, id: NodeId, has_value: HasValue) -> Result<(), GraphError> {
        let slot = self.checked_slot(id)?;
        let current = self.nodes[slot].has_value;
        match current {
            Some(current) if current.can_become(has_value) => {
                self.nodes[slot].has_value = Some(has_value);
                Ok(())
            }
            _ => Err(GraphError::InvalidTransition {
                node: id,
                from: current.unwrap_or(HasValue::HasValue).as_str(),
                to: has_value.as_str(),
            }),
        }
    }
}
