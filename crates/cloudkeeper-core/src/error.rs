// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cloudkeeper-core.
//!
//! Every interpreter failure carries the execution trace at which it occurred
//! and maps to a stable error code, so that subscribers receive one structured
//! [`ExecutionFailure`] per failed execution.

use cloudkeeper_model::{ExecutionTrace, ModelError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextError;
use crate::executor::ExecutorError;
use crate::staging::StagingError;

/// Result type using InterpreterError
pub type Result<T> = std::result::Result<T, InterpreterError>;

/// Failures of a module interpreter or top-level interpreter.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InterpreterError {
    /// Required in-ports will never receive a value.
    #[error("In-ports {in_ports:?} of {trace} need a value but none will be provided")]
    MissingInPortValues {
        /// The module instance.
        trace: ExecutionTrace,
        /// Names of the offending in-ports.
        in_ports: Vec<String>,
    },

    /// A caller-supplied argument (port name, out-port index) is invalid.
    #[error("Invalid argument at {trace}: {message}")]
    InvalidArgument {
        /// The module instance.
        trace: ExecutionTrace,
        /// What is wrong.
        message: String,
    },

    /// An interpreter protocol invariant was violated.
    #[error("Protocol violation at {trace}: {message}")]
    ProtocolViolation {
        /// The module instance.
        trace: ExecutionTrace,
        /// What happened.
        message: String,
    },

    /// A staging-area call failed.
    #[error("Staging area failure at {trace}: {source}")]
    Staging {
        /// The module or port instance being accessed.
        trace: ExecutionTrace,
        /// The staging error.
        #[source]
        source: StagingError,
    },

    /// The executor failed to run a simple module.
    #[error("Execution of {trace} failed: {source}")]
    Executor {
        /// The simple module instance.
        trace: ExecutionTrace,
        /// The executor error.
        #[source]
        source: ExecutorError,
    },

    /// A simple module did not produce a requested out-port.
    #[error("Module {trace} did not produce out-port '{out_port}'")]
    MissingOutput {
        /// The simple module instance.
        trace: ExecutionTrace,
        /// Name of the missing out-port.
        out_port: String,
    },

    /// A child terminated without reaching the expected terminal state.
    #[error("Module {trace} terminated unexpectedly: {message}")]
    UnexpectedTermination {
        /// The child instance.
        trace: ExecutionTrace,
        /// What was missing.
        message: String,
    },

    /// A loop body produced a continue value that is not a boolean.
    #[error("Loop {trace} produced non-boolean continue value {value}")]
    InvalidContinueValue {
        /// The loop instance.
        trace: ExecutionTrace,
        /// The offending value.
        value: serde_json::Value,
    },

    /// The interpreter was cancelled.
    #[error("Module {trace} was cancelled: {cause}")]
    Cancelled {
        /// The cancelled instance.
        trace: ExecutionTrace,
        /// Why it was cancelled.
        cause: String,
    },

    /// The runtime model is inconsistent.
    #[error("Invalid module at {trace}: {source}")]
    Model {
        /// The module instance.
        trace: ExecutionTrace,
        /// The model error.
        #[source]
        source: ModelError,
    },

    /// The runtime context could not be acquired.
    #[error("Runtime context unavailable: {0}")]
    ContextUnavailable(#[from] ContextError),
}

impl InterpreterError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingInPortValues { .. } => "MISSING_IN_PORT_VALUES",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            Self::Staging { .. } => "STAGING_FAILURE",
            Self::Executor { .. } => "EXECUTOR_FAILURE",
            Self::MissingOutput { .. } => "MISSING_OUTPUT",
            Self::UnexpectedTermination { .. } => "UNEXPECTED_TERMINATION",
            Self::InvalidContinueValue { .. } => "INVALID_CONTINUE_VALUE",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Model { .. } => "INVALID_MODEL",
            Self::ContextUnavailable(_) => "CONTEXT_UNAVAILABLE",
        }
    }

    /// The execution trace at which the failure occurred, if known.
    pub fn trace(&self) -> Option<&ExecutionTrace> {
        match self {
            Self::MissingInPortValues { trace, .. }
            | Self::InvalidArgument { trace, .. }
            | Self::ProtocolViolation { trace, .. }
            | Self::Staging { trace, .. }
            | Self::Executor { trace, .. }
            | Self::MissingOutput { trace, .. }
            | Self::UnexpectedTermination { trace, .. }
            | Self::InvalidContinueValue { trace, .. }
            | Self::Cancelled { trace, .. }
            | Self::Model { trace, .. } => Some(trace),
            Self::ContextUnavailable(_) => None,
        }
    }

    /// Convert this error to the structured failure reported to subscribers.
    pub fn to_failure(&self) -> ExecutionFailure {
        ExecutionFailure {
            code: self.error_code().to_string(),
            message: self.to_string(),
            trace: self.trace().cloned(),
        }
    }

    pub(crate) fn protocol(trace: &ExecutionTrace, message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            trace: trace.clone(),
            message: message.into(),
        }
    }

    pub(crate) fn staging(trace: &ExecutionTrace, source: StagingError) -> Self {
        Self::Staging {
            trace: trace.clone(),
            source,
        }
    }
}

/// Error code of executions aborted after the cancellation grace period.
pub const FORCED_TERMINATION: &str = "FORCED_TERMINATION";

/// Structured failure of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// Stable error code (e.g. `EXECUTOR_FAILURE`).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Where the failure occurred, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<ExecutionTrace>,
}

impl ExecutionFailure {
    /// Failure reported for an execution that did not terminate within the grace period.
    pub fn forced_termination(cause: &str) -> Self {
        Self {
            code: FORCED_TERMINATION.to_string(),
            message: format!(
                "Execution did not terminate within the cancellation grace period: {}",
                cause
            ),
            trace: Some(ExecutionTrace::root()),
        }
    }
}
