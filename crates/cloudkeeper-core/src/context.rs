// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime context of one execution.
//!
//! A [`RuntimeContext`] bundles the collaborators every interpreter of an
//! execution shares: staging area, executor and declaration repository. It is
//! acquired from a [`RuntimeContextProvider`] when an execution starts and
//! released exactly once when it ends, through a [`ContextLease`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cloudkeeper_model::Repository;
use thiserror::Error;
use tracing::{debug, warn};

use crate::execution::ExecutionId;
use crate::executor::Executor;
use crate::staging::StagingArea;

/// Errors from acquiring a runtime context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ContextError {
    /// The provider cannot hand out a context right now.
    #[error("{0}")]
    Unavailable(String),
}

/// Collaborators shared by all interpreters of one execution.
pub struct RuntimeContext {
    /// Port values of the execution.
    pub staging: Arc<dyn StagingArea>,
    /// Runs simple modules.
    pub executor: Arc<dyn Executor>,
    /// Declarations that proxy modules resolve against.
    pub repository: Arc<Repository>,
}

impl RuntimeContext {
    /// Create a context from its collaborators.
    pub fn new(
        staging: Arc<dyn StagingArea>,
        executor: Arc<dyn Executor>,
        repository: Arc<Repository>,
    ) -> Self {
        Self {
            staging,
            executor,
            repository,
        }
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("executor", &self.executor.executor_type())
            .field("declarations", &self.repository.len())
            .finish_non_exhaustive()
    }
}

/// Source of runtime contexts, one per execution.
#[async_trait]
pub trait RuntimeContextProvider: Send + Sync {
    /// Create (or hand out) the context of an execution.
    async fn acquire(&self, execution_id: ExecutionId) -> Result<Arc<RuntimeContext>, ContextError>;

    /// Give back the context of a finished execution.
    async fn release(&self, execution_id: ExecutionId, context: Arc<RuntimeContext>);
}

/// Scoped ownership of an acquired runtime context.
///
/// Call [`release`](Self::release) on every normal exit path. A lease that is
/// dropped without being released (for example because its task was aborted)
/// schedules the release on the current tokio runtime.
pub struct ContextLease {
    execution_id: ExecutionId,
    provider: Arc<dyn RuntimeContextProvider>,
    context: Arc<RuntimeContext>,
    released: bool,
}

impl ContextLease {
    /// Acquire the context of `execution_id`.
    pub async fn acquire(
        provider: Arc<dyn RuntimeContextProvider>,
        execution_id: ExecutionId,
    ) -> Result<Self, ContextError> {
        let context = provider.acquire(execution_id).await?;
        debug!(execution_id = %execution_id, "Runtime context acquired");
        Ok(Self {
            execution_id,
            provider,
            context,
            released: false,
        })
    }

    /// The leased context.
    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    /// Release the context.
    pub async fn release(mut self) {
        self.released = true;
        self.provider
            .release(self.execution_id, self.context.clone())
            .await;
        debug!(execution_id = %self.execution_id, "Runtime context released");
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let execution_id = self.execution_id;
        let provider = self.provider.clone();
        let context = self.context.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(execution_id = %execution_id, "Releasing abandoned runtime context");
                handle.spawn(async move {
                    provider.release(execution_id, context).await;
                });
            }
            Err(_) => {
                warn!(execution_id = %execution_id, "No runtime to release abandoned context on");
            }
        }
    }
}

/// Provider handing out one shared context to every execution.
///
/// Counts acquisitions and releases so that embedders (and tests) can check
/// that every execution gave its context back.
pub struct StaticContextProvider {
    context: Arc<RuntimeContext>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl StaticContextProvider {
    /// Create a provider for the given context.
    pub fn new(context: RuntimeContext) -> Self {
        Self {
            context: Arc::new(context),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    /// Number of successful acquisitions so far.
    pub fn acquisitions(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Number of releases so far.
    pub fn releases(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeContextProvider for StaticContextProvider {
    async fn acquire(&self, _execution_id: ExecutionId) -> Result<Arc<RuntimeContext>, ContextError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(self.context.clone())
    }

    async fn release(&self, _execution_id: ExecutionId, _context: Arc<RuntimeContext>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
