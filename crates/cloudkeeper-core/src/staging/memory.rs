// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory staging area.

use std::collections::HashMap;

use async_trait::async_trait;
use cloudkeeper_model::ExecutionTrace;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Result, StagingArea, StagingError};

/// Staging area backed by a `HashMap`, for embedding and tests.
///
/// Operations on traces under a configured failure prefix fail with
/// [`StagingError::Backend`].
#[derive(Debug, Default)]
pub struct InMemoryStagingArea {
    values: RwLock<HashMap<ExecutionTrace, Value>>,
    failing_prefix: Option<ExecutionTrace>,
}

impl InMemoryStagingArea {
    /// Create an empty staging area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every operation on a trace starting with `prefix`.
    pub fn with_failures_under(mut self, prefix: ExecutionTrace) -> Self {
        self.failing_prefix = Some(prefix);
        self
    }

    /// Store a value directly.
    pub async fn insert(&self, trace: ExecutionTrace, value: Value) {
        self.values.write().await.insert(trace, value);
    }

    /// Delete the value at `trace`, returning it.
    pub async fn remove(&self, trace: &ExecutionTrace) -> Option<Value> {
        self.values.write().await.remove(trace)
    }

    /// Whether a value is stored at `trace`, bypassing failure injection.
    pub async fn contains(&self, trace: &ExecutionTrace) -> bool {
        self.values.read().await.contains_key(trace)
    }

    /// The stored value at `trace`, bypassing failure injection.
    pub async fn value(&self, trace: &ExecutionTrace) -> Option<Value> {
        self.values.read().await.get(trace).cloned()
    }

    /// Number of stored values.
    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    fn check(&self, trace: &ExecutionTrace) -> Result<()> {
        match &self.failing_prefix {
            Some(prefix) if trace.starts_with(prefix) => Err(StagingError::Backend(format!(
                "injected failure for {}",
                trace
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StagingArea for InMemoryStagingArea {
    async fn exists(&self, trace: &ExecutionTrace) -> Result<bool> {
        self.check(trace)?;
        Ok(self.values.read().await.contains_key(trace))
    }

    async fn get(&self, trace: &ExecutionTrace) -> Result<Value> {
        self.check(trace)?;
        self.values
            .read()
            .await
            .get(trace)
            .cloned()
            .ok_or_else(|| StagingError::NotFound(trace.clone()))
    }

    async fn put(&self, trace: &ExecutionTrace, value: Value) -> Result<()> {
        self.check(trace)?;
        self.values.write().await.insert(trace.clone(), value);
        Ok(())
    }
}
