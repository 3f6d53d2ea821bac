// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution identifiers, parameters, outcomes and events.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cloudkeeper_model::{ExecutionTrace, Module};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionFailure;

/// Identifier of one execution, allocated by the master from a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to execute.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    /// The root module.
    pub module: Arc<Module>,
    /// Names of the out-ports to produce; `None` requests every out-port.
    pub requested_out_ports: Option<Vec<String>>,
    /// Names of the in-ports whose value was supplied or changed since a previous
    /// run; `None` treats every in-port that currently has a value as updated.
    pub updated_in_ports: Option<Vec<String>>,
}

impl ExecutionParams {
    /// Execute `module`, requesting every out-port and treating every present
    /// in-port value as updated.
    pub fn new(module: Arc<Module>) -> Self {
        Self {
            module,
            requested_out_ports: None,
            updated_in_ports: None,
        }
    }

    /// Request only the named out-ports.
    pub fn requested_out_ports<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_out_ports = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Treat only the named in-ports as updated; every other value is reused.
    pub fn updated_in_ports<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.updated_in_ports = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

/// Final report of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// The execution.
    pub execution_id: ExecutionId,
    /// When the execution reached its terminal state.
    pub finished_at: DateTime<Utc>,
    /// Why it failed; `None` on success.
    pub failure: Option<ExecutionFailure>,
}

impl ExecutionOutcome {
    /// Returns true if the execution produced all requested outputs.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Events published to subscribers of the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A requested out-port of the root module has a value.
    OutputAvailable {
        /// The execution.
        execution_id: ExecutionId,
        /// Name of the out-port.
        out_port: String,
        /// Staging-area key of the value.
        trace: ExecutionTrace,
    },
    /// The execution terminated.
    ExecutionFinished(ExecutionOutcome),
}

impl ExecutionEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::OutputAvailable { execution_id, .. } => *execution_id,
            ExecutionEvent::ExecutionFinished(outcome) => outcome.execution_id,
        }
    }
}
