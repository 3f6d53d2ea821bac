// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime modules, bodies and declarations.
//!
//! The module tree is immutable once linked. Composite and loop modules own a
//! [`Body`] of children and connections; proxy modules name a [`Declaration`]
//! that is looked up in a [`Repository`] when the proxy is interpreted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;

/// Name of the out-port through which a loop body decides whether to iterate again.
pub const CONTINUE_PORT: &str = "continue";

/// Name of the single out-port of an input module.
pub const INPUT_OUT_PORT: &str = "value";

/// A named port. Its index is its position in the owning port list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port name, unique among the in-ports (or out-ports) of one module.
    pub name: String,
}

impl Port {
    /// Create a port with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

fn ports(names: &[&str]) -> Vec<Port> {
    names.iter().map(|name| Port::new(*name)).collect()
}

/// A module of the runtime module tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    /// Simple name, unique among the siblings of this module.
    pub name: String,
    /// In-ports, addressed by index.
    #[serde(default)]
    pub in_ports: Vec<Port>,
    /// Out-ports, addressed by index.
    #[serde(default)]
    pub out_ports: Vec<Port>,
    /// What kind of module this is.
    pub kind: ModuleKind,
}

/// The closed set of module kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ModuleKind {
    /// A literal value exposed through a single out-port.
    Input {
        /// The literal.
        value: Value,
    },
    /// An anonymous sub-workflow.
    Composite {
        /// Children and connections.
        body: Arc<Body>,
    },
    /// A sub-workflow that is re-run while its continue out-port is `true`.
    #[serde(rename_all = "camelCase")]
    Loop {
        /// Children and connections of one iteration.
        body: Arc<Body>,
        /// Index of the boolean continue out-port.
        continue_port: usize,
    },
    /// A reference to a named declaration (simple or composite).
    Proxy {
        /// Name of the declaration in the repository.
        declaration: String,
    },
}

impl Module {
    /// Create an input module holding a literal value.
    pub fn input(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            in_ports: Vec::new(),
            out_ports: vec![Port::new(INPUT_OUT_PORT)],
            kind: ModuleKind::Input { value },
        }
    }

    /// Create an anonymous composite module.
    pub fn composite(
        name: impl Into<String>,
        in_ports: &[&str],
        out_ports: &[&str],
        body: Body,
    ) -> Self {
        Self {
            name: name.into(),
            in_ports: ports(in_ports),
            out_ports: ports(out_ports),
            kind: ModuleKind::Composite {
                body: Arc::new(body),
            },
        }
    }

    /// Create a loop module.
    ///
    /// The continue port is the out-port named [`CONTINUE_PORT`]; it is appended
    /// to the out-ports if not listed.
    pub fn loop_module(
        name: impl Into<String>,
        in_ports: &[&str],
        out_ports: &[&str],
        body: Body,
    ) -> Self {
        let mut out_ports = ports(out_ports);
        let continue_port = match out_ports.iter().position(|p| p.name == CONTINUE_PORT) {
            Some(index) => index,
            None => {
                out_ports.push(Port::new(CONTINUE_PORT));
                out_ports.len() - 1
            }
        };
        Self {
            name: name.into(),
            in_ports: ports(in_ports),
            out_ports,
            kind: ModuleKind::Loop {
                body: Arc::new(body),
                continue_port,
            },
        }
    }

    /// Create a proxy module with the ports of the given declaration.
    pub fn proxy(name: impl Into<String>, declaration: &Declaration) -> Self {
        Self {
            name: name.into(),
            in_ports: declaration.in_ports.clone(),
            out_ports: declaration.out_ports.clone(),
            kind: ModuleKind::Proxy {
                declaration: declaration.name.clone(),
            },
        }
    }

    /// Index of the named in-port.
    pub fn in_port_index(&self, name: &str) -> Option<usize> {
        self.in_ports.iter().position(|p| p.name == name)
    }

    /// Index of the named out-port.
    pub fn out_port_index(&self, name: &str) -> Option<usize> {
        self.out_ports.iter().position(|p| p.name == name)
    }

    /// The body of a composite or loop module.
    pub fn body(&self) -> Option<&Arc<Body>> {
        match &self.kind {
            ModuleKind::Composite { body } | ModuleKind::Loop { body, .. } => Some(body),
            ModuleKind::Input { .. } | ModuleKind::Proxy { .. } => None,
        }
    }

    /// Check this module and, recursively, every inline child.
    ///
    /// Proxies are not followed; declarations are checked by
    /// [`Declaration::validate`] when resolved.
    pub fn validate(&self) -> Result<(), ModelError> {
        let malformed = |reason: &str| ModelError::Malformed {
            module: self.name.clone(),
            reason: reason.to_string(),
        };

        check_unique_names(&self.name, &self.in_ports)?;
        check_unique_names(&self.name, &self.out_ports)?;

        match &self.kind {
            ModuleKind::Input { .. } => {
                if !self.in_ports.is_empty() || self.out_ports.len() != 1 {
                    return Err(malformed(
                        "input modules have no in-ports and exactly one out-port",
                    ));
                }
                Ok(())
            }
            ModuleKind::Composite { body } => {
                body.validate(self.in_ports.len(), self.out_ports.len())?;
                body.validate_children()
            }
            ModuleKind::Loop {
                body,
                continue_port,
            } => {
                if *continue_port >= self.out_ports.len() {
                    return Err(malformed("continue port is out of range"));
                }
                body.validate(self.in_ports.len(), self.out_ports.len())?;
                body.validate_children()
            }
            ModuleKind::Proxy { .. } => Ok(()),
        }
    }
}

fn check_unique_names(module: &str, ports: &[Port]) -> Result<(), ModelError> {
    let mut seen = HashSet::new();
    for port in ports {
        if !seen.insert(port.name.as_str()) {
            return Err(ModelError::Malformed {
                module: module.to_string(),
                reason: format!("duplicate port name '{}'", port.name),
            });
        }
    }
    Ok(())
}

/// One end of a connection, relative to the module owning the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Endpoint {
    /// In-port of the owning module.
    InPort(usize),
    /// Out-port of the owning module.
    OutPort(usize),
    /// In-port of a child.
    ChildIn {
        /// Child index.
        child: usize,
        /// In-port index on the child.
        port: usize,
    },
    /// Out-port of a child.
    ChildOut {
        /// Child index.
        child: usize,
        /// Out-port index on the child.
        port: usize,
    },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::InPort(port) => write!(f, "in[{}]", port),
            Endpoint::OutPort(port) => write!(f, "out[{}]", port),
            Endpoint::ChildIn { child, port } => write!(f, "child[{}].in[{}]", child, port),
            Endpoint::ChildOut { child, port } => write!(f, "child[{}].out[{}]", child, port),
        }
    }
}

/// How a connection relates the owning module and its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Out-port of a child to in-port of a sibling.
    Sibling,
    /// In-port of the parent to in-port of a child.
    ParentInToChildIn,
    /// Out-port of a child to out-port of the parent.
    ChildOutToParentOut,
    /// In-port of the parent directly to out-port of the parent.
    ShortCircuit,
}

/// A directed connection between two endpoints of one body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    /// Where values come from.
    pub from: Endpoint,
    /// Where values go.
    pub to: Endpoint,
}

impl Connection {
    /// Create a connection.
    pub fn new(from: Endpoint, to: Endpoint) -> Self {
        Self { from, to }
    }

    /// The kind of this connection, or `None` for an invalid pairing.
    pub fn kind(&self) -> Option<ConnectionKind> {
        match (self.from, self.to) {
            (Endpoint::ChildOut { .. }, Endpoint::ChildIn { .. }) => Some(ConnectionKind::Sibling),
            (Endpoint::InPort(_), Endpoint::ChildIn { .. }) => {
                Some(ConnectionKind::ParentInToChildIn)
            }
            (Endpoint::ChildOut { .. }, Endpoint::OutPort(_)) => {
                Some(ConnectionKind::ChildOutToParentOut)
            }
            (Endpoint::InPort(_), Endpoint::OutPort(_)) => Some(ConnectionKind::ShortCircuit),
            _ => None,
        }
    }
}

/// Children and connections of a composite or loop module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
    /// Direct children, addressed by index.
    pub children: Vec<Arc<Module>>,
    /// Connections owned by the parent module.
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Body {
    /// Create a body from children and connections.
    pub fn new(children: Vec<Module>, connections: Vec<Connection>) -> Self {
        Self {
            children: children.into_iter().map(Arc::new).collect(),
            connections,
        }
    }

    /// The child at `index`.
    pub fn child(&self, index: usize) -> Option<&Arc<Module>> {
        self.children.get(index)
    }

    /// Index of the child with the given name.
    pub fn child_index(&self, name: &str) -> Option<usize> {
        self.children.iter().position(|c| c.name == name)
    }

    /// Connections whose source is `from`.
    pub fn connections_from(&self, from: Endpoint) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.iter().filter(move |c| c.from == from)
    }

    /// Check connections against the port counts of the owning module.
    pub fn validate(&self, in_ports: usize, out_ports: usize) -> Result<(), ModelError> {
        let mut names = HashSet::new();
        for child in &self.children {
            if !names.insert(child.name.as_str()) {
                return Err(ModelError::Malformed {
                    module: child.name.clone(),
                    reason: "duplicate child name".to_string(),
                });
            }
        }

        let mut targets = HashSet::new();
        for connection in &self.connections {
            self.check_endpoint(connection.from, in_ports, out_ports)?;
            self.check_endpoint(connection.to, in_ports, out_ports)?;

            let invalid = || ModelError::InvalidConnection {
                from: connection.from.to_string(),
                to: connection.to.to_string(),
            };
            match connection.kind() {
                None => return Err(invalid()),
                Some(ConnectionKind::Sibling) => {
                    if let (
                        Endpoint::ChildOut { child: source, .. },
                        Endpoint::ChildIn { child: target, .. },
                    ) = (connection.from, connection.to)
                    {
                        if source == target {
                            return Err(invalid());
                        }
                    }
                }
                Some(_) => {}
            }

            if !targets.insert(connection.to) {
                return Err(ModelError::DuplicateTarget {
                    endpoint: connection.to.to_string(),
                });
            }
        }

        let required = (0..out_ports).map(Endpoint::OutPort).chain(
            self.children.iter().enumerate().flat_map(|(child, module)| {
                (0..module.in_ports.len()).map(move |port| Endpoint::ChildIn { child, port })
            }),
        );
        for endpoint in required {
            if !targets.contains(&endpoint) {
                return Err(ModelError::Unconnected {
                    endpoint: endpoint.to_string(),
                });
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the child graph induced by sibling connections.
    fn check_acyclic(&self) -> Result<(), ModelError> {
        let mut in_degree = vec![0usize; self.children.len()];
        let mut dependents = vec![Vec::new(); self.children.len()];
        for connection in &self.connections {
            if let (
                Endpoint::ChildOut { child: source, .. },
                Endpoint::ChildIn { child: target, .. },
            ) = (connection.from, connection.to)
            {
                in_degree[target] += 1;
                dependents[source].push(target);
            }
        }

        let mut ready: VecDeque<usize> = (0..in_degree.len())
            .filter(|&child| in_degree[child] == 0)
            .collect();
        while let Some(child) = ready.pop_front() {
            for &dependent in &dependents[child] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        let children: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(child, _)| self.children[child].name.clone())
            .collect();
        if children.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Cycle { children })
        }
    }

    fn validate_children(&self) -> Result<(), ModelError> {
        self.children.iter().try_for_each(|child| child.validate())
    }

    fn check_endpoint(
        &self,
        endpoint: Endpoint,
        in_ports: usize,
        out_ports: usize,
    ) -> Result<(), ModelError> {
        let in_range = match endpoint {
            Endpoint::InPort(port) => port < in_ports,
            Endpoint::OutPort(port) => port < out_ports,
            Endpoint::ChildIn { child, port } => self
                .children
                .get(child)
                .is_some_and(|c| port < c.in_ports.len()),
            Endpoint::ChildOut { child, port } => self
                .children
                .get(child)
                .is_some_and(|c| port < c.out_ports.len()),
        };
        if in_range {
            Ok(())
        } else {
            Err(ModelError::EndpointOutOfRange {
                endpoint: endpoint.to_string(),
            })
        }
    }
}

/// A named module declaration that proxy modules refer to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Declaration {
    /// Declaration name, unique within a repository.
    pub name: String,
    /// In-ports of every module instantiating this declaration.
    #[serde(default)]
    pub in_ports: Vec<Port>,
    /// Out-ports of every module instantiating this declaration.
    #[serde(default)]
    pub out_ports: Vec<Port>,
    /// Simple (atomic) or composite.
    pub kind: DeclarationKind,
}

/// What a declaration expands to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeclarationKind {
    /// An atomic task run by the executor.
    Simple,
    /// A named sub-workflow.
    Composite {
        /// Children and connections.
        body: Arc<Body>,
    },
}

impl Declaration {
    /// Create a simple (atomic) declaration.
    pub fn simple(name: impl Into<String>, in_ports: &[&str], out_ports: &[&str]) -> Self {
        Self {
            name: name.into(),
            in_ports: ports(in_ports),
            out_ports: ports(out_ports),
            kind: DeclarationKind::Simple,
        }
    }

    /// Create a composite declaration.
    pub fn composite(
        name: impl Into<String>,
        in_ports: &[&str],
        out_ports: &[&str],
        body: Body,
    ) -> Self {
        Self {
            name: name.into(),
            in_ports: ports(in_ports),
            out_ports: ports(out_ports),
            kind: DeclarationKind::Composite {
                body: Arc::new(body),
            },
        }
    }

    /// Check the ports and, for a composite declaration, its body.
    pub fn validate(&self) -> Result<(), ModelError> {
        check_unique_names(&self.name, &self.in_ports)?;
        check_unique_names(&self.name, &self.out_ports)?;
        if let DeclarationKind::Composite { body } = &self.kind {
            body.validate(self.in_ports.len(), self.out_ports.len())?;
            body.validate_children()?;
        }
        Ok(())
    }
}

/// Declarations available to proxy modules, by name.
///
/// Declarations are resolved lazily, one proxy at a time, so a composite
/// declaration may (indirectly) contain proxies to itself: each level of
/// recursion reuses the same shared declaration and is only expanded when the
/// enclosing proxy is actually interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    declarations: HashMap<String, Arc<Declaration>>,
}

impl Repository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration, replacing any previous declaration with the same name.
    pub fn insert(&mut self, declaration: Declaration) {
        self.declarations
            .insert(declaration.name.clone(), Arc::new(declaration));
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, declaration: Declaration) -> Self {
        self.insert(declaration);
        self
    }

    /// Number of declarations.
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Returns true if the repository holds no declarations.
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Look up a declaration by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<Declaration>, ModelError> {
        self.declarations
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::UnknownDeclaration(name.to_string()))
    }

    /// Resolve the declaration of a proxy module and check that the ports agree.
    pub fn resolve_proxy(&self, module: &Module) -> Result<Arc<Declaration>, ModelError> {
        let ModuleKind::Proxy { declaration } = &module.kind else {
            return Err(ModelError::Malformed {
                module: module.name.clone(),
                reason: "not a proxy module".to_string(),
            });
        };
        let resolved = self.resolve(declaration)?;
        if resolved.in_ports != module.in_ports || resolved.out_ports != module.out_ports {
            return Err(ModelError::PortMismatch {
                module: module.name.clone(),
                declaration: declaration.clone(),
            });
        }
        Ok(resolved)
    }

    /// Check every composite declaration body.
    pub fn validate(&self) -> Result<(), ModelError> {
        self.declarations
            .values()
            .try_for_each(|declaration| declaration.validate())
    }
}
