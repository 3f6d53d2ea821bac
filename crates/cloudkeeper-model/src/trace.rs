// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution traces.
//!
//! A trace addresses one module instance (or one of its ports) inside a single
//! execution. Traces are the keys of the staging area.
//!
//! ```text
//! /                        the root module
//! :in:x                    in-port `x` of the root module
//! /sum:out:result          out-port `result` of child `sum` of the root
//! /loop/#2/body:in:n       in-port `n` of child `body` in iteration 2 of `loop`
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ModelError;

/// One step of an [`ExecutionTrace`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TraceElement {
    /// A child module, by name.
    Module(String),
    /// An iteration of a loop module.
    Iteration(u64),
    /// An in-port, by name. Always the last element.
    InPort(String),
    /// An out-port, by name. Always the last element.
    OutPort(String),
}

/// Hierarchical path identifying a module or port instance within one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionTrace {
    elements: Vec<TraceElement>,
}

impl ExecutionTrace {
    /// The trace of the root module.
    pub fn root() -> Self {
        Self::default()
    }

    /// Returns true for the root module's trace.
    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    /// The elements of this trace, outermost first.
    pub fn elements(&self) -> &[TraceElement] {
        &self.elements
    }

    /// Returns true if this trace addresses a port rather than a module instance.
    pub fn is_port(&self) -> bool {
        matches!(
            self.elements.last(),
            Some(TraceElement::InPort(_) | TraceElement::OutPort(_))
        )
    }

    /// Trace of the named child module.
    pub fn child(&self, name: &str) -> Self {
        self.with(TraceElement::Module(name.to_string()))
    }

    /// Trace of an iteration of this (loop) module.
    pub fn iteration(&self, index: u64) -> Self {
        self.with(TraceElement::Iteration(index))
    }

    /// Trace of the named in-port of this module instance.
    pub fn in_port(&self, name: &str) -> Self {
        self.with(TraceElement::InPort(name.to_string()))
    }

    /// Trace of the named out-port of this module instance.
    pub fn out_port(&self, name: &str) -> Self {
        self.with(TraceElement::OutPort(name.to_string()))
    }

    /// Returns true if `prefix` is an ancestor of (or equal to) this trace.
    pub fn starts_with(&self, prefix: &ExecutionTrace) -> bool {
        self.elements.starts_with(&prefix.elements)
    }

    fn with(&self, element: TraceElement) -> Self {
        debug_assert!(!self.is_port(), "port traces cannot be extended");
        let mut elements = self.elements.clone();
        elements.push(element);
        Self { elements }
    }
}

impl fmt::Display for ExecutionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elements.is_empty() {
            return f.write_str("/");
        }
        for element in &self.elements {
            match element {
                TraceElement::Module(name) => write!(f, "/{}", name)?,
                TraceElement::Iteration(index) => write!(f, "/#{}", index)?,
                TraceElement::InPort(name) => write!(f, ":in:{}", name)?,
                TraceElement::OutPort(name) => write!(f, ":out:{}", name)?,
            }
        }
        Ok(())
    }
}

impl FromStr for ExecutionTrace {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidTrace(s.to_string());

        if s == "/" {
            return Ok(Self::root());
        }

        let mut elements = Vec::new();
        let mut rest = s;
        while !rest.is_empty() {
            if let Some(port) = rest.strip_prefix(":in:") {
                if port.is_empty() || port.contains(['/', ':']) {
                    return Err(invalid());
                }
                elements.push(TraceElement::InPort(port.to_string()));
                rest = "";
            } else if let Some(port) = rest.strip_prefix(":out:") {
                if port.is_empty() || port.contains(['/', ':']) {
                    return Err(invalid());
                }
                elements.push(TraceElement::OutPort(port.to_string()));
                rest = "";
            } else if let Some(after_slash) = rest.strip_prefix('/') {
                let end = after_slash.find(['/', ':']).unwrap_or(after_slash.len());
                let segment = &after_slash[..end];
                if segment.is_empty() {
                    return Err(invalid());
                }
                let element = match segment.strip_prefix('#') {
                    Some(index) => TraceElement::Iteration(index.parse().map_err(|_| invalid())?),
                    None => TraceElement::Module(segment.to_string()),
                };
                elements.push(element);
                rest = &after_slash[end..];
            } else {
                return Err(invalid());
            }
        }

        Ok(Self { elements })
    }
}

impl Serialize for ExecutionTrace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExecutionTrace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
