// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor trait definitions.
//!
//! Defines the abstract interface for running one simple (atomic) module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cloudkeeper_model::ExecutionTrace;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors from executor operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// No implementation is registered for the declaration.
    #[error("No implementation for declaration '{0}'")]
    UnknownDeclaration(String),

    /// The module body reported a failure.
    #[error("Execution failed: {0}")]
    Failed(String),

    /// Execution was cancelled.
    #[error("Execution cancelled")]
    Cancelled,

    /// Process exited with non-zero code.
    #[error("Exit code {exit_code}: {stderr}")]
    ExitCode {
        /// Exit code from the process.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The module body produced something other than a JSON object of outputs.
    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Everything an executor needs to run one simple module instance.
#[derive(Debug, Clone)]
pub struct SimpleModuleRequest {
    /// Trace of the module instance.
    pub trace: ExecutionTrace,
    /// Name of the simple declaration.
    pub declaration: String,
    /// In-port values by port name.
    pub inputs: BTreeMap<String, Value>,
}

/// Trait for simple-module executors.
///
/// Executors are pure execution engines: they never touch the staging area.
/// Reading inputs and storing outputs is done by the caller.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor type identifier (e.g., "function", "process")
    fn executor_type(&self) -> &'static str;

    /// Run the module and return its out-port values by port name.
    ///
    /// Implementations should return [`ExecutorError::Cancelled`] soon after
    /// `cancel` fires.
    async fn execute(
        &self,
        request: SimpleModuleRequest,
        cancel: CancellationToken,
    ) -> Result<BTreeMap<String, Value>>;
}
