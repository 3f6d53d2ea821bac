// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outstanding asynchronous actions of one interpreter.
//!
//! An interpreter terminates exactly when it has no outstanding action. Two
//! kinds of actions are tracked under one token space:
//!
//! - *virtual* actions, started with [`Actions::start`] and ended explicitly
//!   (one per requested out-port that has not been signalled yet);
//! - *spawned* actions, futures run on a [`JoinSet`] whose completions are
//!   handed back to the interpreter through [`Actions::next`].
//!
//! Dropping an `Actions` aborts every spawned action that is still running.

use std::collections::BTreeMap;
use std::future::Future;

use tokio::task::JoinSet;
use tracing::trace;

/// Handle of one outstanding action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ActionToken(u64);

pub(crate) struct Actions<C> {
    next_token: u64,
    outstanding: BTreeMap<ActionToken, String>,
    tasks: JoinSet<(ActionToken, C)>,
}

impl<C: Send + 'static> Actions<C> {
    pub(crate) fn new() -> Self {
        Self {
            next_token: 0,
            outstanding: BTreeMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Register a virtual action.
    pub(crate) fn start(&mut self, description: impl Into<String>) -> ActionToken {
        let token = ActionToken(self.next_token);
        self.next_token += 1;
        let description = description.into();
        trace!(token = token.0, action = %description, "Action started");
        self.outstanding.insert(token, description);
        token
    }

    /// End an action. Returns false if it was not outstanding.
    pub(crate) fn end(&mut self, token: ActionToken) -> bool {
        match self.outstanding.remove(&token) {
            Some(description) => {
                trace!(token = token.0, action = %description, "Action ended");
                true
            }
            None => false,
        }
    }

    /// Run `future` as a new action; its output is returned by [`next`](Self::next).
    pub(crate) fn spawn<F>(&mut self, description: impl Into<String>, future: F) -> ActionToken
    where
        F: Future<Output = C> + Send + 'static,
    {
        let token = self.start(description);
        self.tasks.spawn(async move { (token, future.await) });
        token
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.outstanding.len()
    }

    /// Descriptions of the outstanding actions, oldest first.
    pub(crate) fn descriptions(&self) -> Vec<&str> {
        self.outstanding.values().map(String::as_str).collect()
    }

    /// Wait for the next spawned action to complete.
    ///
    /// Returns `None` when no spawned action is running. A panic inside an
    /// action is resumed on the caller. Cancel safe.
    pub(crate) async fn next(&mut self) -> Option<C> {
        loop {
            match self.tasks.join_next().await? {
                Ok((token, completion)) => {
                    self.end(token);
                    return Some(completion);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                // Aborted; the token was ended by whoever aborted it
                Err(_) => continue,
            }
        }
    }

    /// Wait for every spawned action and forget all outstanding actions.
    pub(crate) async fn drain(&mut self) {
        while self.next().await.is_some() {}
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_virtual_actions() {
        let mut actions: Actions<()> = Actions::new();
        assert!(actions.is_empty());

        let first = actions.start("out-port a");
        let second = actions.start("out-port b");
        assert_eq!(actions.len(), 2);
        assert_eq!(actions.descriptions(), vec!["out-port a", "out-port b"]);

        assert!(actions.end(first));
        assert!(!actions.end(first));
        assert!(actions.end(second));
        assert!(actions.is_empty());
        assert_eq!(actions.next().await, None);
    }

    #[tokio::test]
    async fn test_spawned_actions_complete() {
        let mut actions = Actions::new();
        actions.spawn("slow", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            2
        });
        actions.spawn("fast", async { 1 });
        assert_eq!(actions.len(), 2);

        assert_eq!(actions.next().await, Some(1));
        assert_eq!(actions.descriptions(), vec!["slow"]);
        assert_eq!(actions.next().await, Some(2));
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn test_drain_forgets_virtual_actions() {
        let mut actions = Actions::new();
        actions.start("out-port result");
        actions.spawn("work", async { "done" });
        actions.drain().await;
        assert!(actions.is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn test_panic_is_resumed() {
        let mut actions: Actions<()> = Actions::new();
        actions.spawn("explode", async { panic!("boom") });
        actions.next().await;
    }
}
