// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging area abstraction.
//!
//! The staging area holds port values of one execution, keyed by
//! [`ExecutionTrace`]. Implementations must be safe for concurrent use: every
//! interpreter of an execution shares one instance.

mod memory;

pub use memory::InMemoryStagingArea;

use async_trait::async_trait;
use cloudkeeper_model::ExecutionTrace;
use serde_json::Value;
use thiserror::Error;

/// Errors from staging-area operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StagingError {
    /// No value is stored at the trace.
    #[error("No value at {0}")]
    NotFound(ExecutionTrace),

    /// The backing store failed.
    #[error("Staging backend error: {0}")]
    Backend(String),
}

/// Result type for staging operations.
pub type Result<T> = std::result::Result<T, StagingError>;

/// Key-value store of port values.
#[async_trait]
pub trait StagingArea: Send + Sync {
    /// Whether a value is stored at `trace`.
    async fn exists(&self, trace: &ExecutionTrace) -> Result<bool>;

    /// The value stored at `trace`.
    async fn get(&self, trace: &ExecutionTrace) -> Result<Value>;

    /// Store a value at `trace`, replacing any previous value.
    async fn put(&self, trace: &ExecutionTrace, value: Value) -> Result<()>;

    /// Copy the value at `from` to `to`.
    async fn copy(&self, from: &ExecutionTrace, to: &ExecutionTrace) -> Result<()> {
        let value = self.get(from).await?;
        self.put(to, value).await
    }
}
