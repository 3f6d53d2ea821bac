// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process executor backed by plain functions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::*;

type ModuleFn =
    dyn Fn(&BTreeMap<String, Value>) -> std::result::Result<BTreeMap<String, Value>, String>
        + Send
        + Sync;

/// Executor that dispatches on the declaration name to registered functions.
#[derive(Clone, Default)]
pub struct FunctionExecutor {
    functions: HashMap<String, Arc<ModuleFn>>,
}

impl FunctionExecutor {
    /// Create an executor without functions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the implementation of a simple declaration.
    pub fn with<F>(mut self, declaration: impl Into<String>, function: F) -> Self
    where
        F: Fn(&BTreeMap<String, Value>) -> std::result::Result<BTreeMap<String, Value>, String>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(declaration.into(), Arc::new(function));
        self
    }
}

impl std::fmt::Debug for FunctionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionExecutor")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Executor for FunctionExecutor {
    fn executor_type(&self) -> &'static str {
        "function"
    }

    async fn execute(
        &self,
        request: SimpleModuleRequest,
        cancel: CancellationToken,
    ) -> Result<BTreeMap<String, Value>> {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        let function = self
            .functions
            .get(&request.declaration)
            .ok_or_else(|| ExecutorError::UnknownDeclaration(request.declaration.clone()))?;
        debug!(trace = %request.trace, declaration = %request.declaration, "Calling function");
        function(&request.inputs).map_err(ExecutorError::Failed)
    }
}
