// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cloudkeeper-core integration tests.
//!
//! Provides [`TestHarness`], which runs a master over an in-memory staging area
//! and a [`TestExecutor`] that records every simple module it runs.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cloudkeeper_core::{
    ExecutionEvent, ExecutionId, ExecutionOutcome, ExecutionParams, Executor, ExecutorError,
    FunctionExecutor, InMemoryStagingArea, Master, MasterHandle, RuntimeContext,
    SimpleModuleRequest, StaticContextProvider,
};
use cloudkeeper_model::{
    Body, Connection, Declaration, Endpoint, ExecutionTrace, Module, Repository,
};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single execution in these tests.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Executor with a fixed set of test declarations.
///
/// - `add(a, b) -> sum`
/// - `double(x) -> y`
/// - `decrement(n) -> (n, continue)`: `continue` is true while the result is positive
/// - `fail(x) -> y`: always fails
/// - `forget(x) -> y`: succeeds without producing `y`
/// - `maybe(n) -> (n, continue)`: produces a non-boolean continue value
/// - `slow(x) -> y`: waits until cancelled
/// - `wait(n) -> (n, continue)`: waits until cancelled
/// - `stuck(x) -> y`: never returns, ignoring cancellation
pub struct TestExecutor {
    functions: FunctionExecutor,
    calls: Mutex<Vec<String>>,
}

impl TestExecutor {
    pub fn new() -> Self {
        let functions = FunctionExecutor::new()
            .with("add", |inputs| {
                let sum = int(inputs, "a") + int(inputs, "b");
                Ok(BTreeMap::from([("sum".to_string(), json!(sum))]))
            })
            .with("double", |inputs| {
                Ok(BTreeMap::from([("y".to_string(), json!(int(inputs, "x") * 2))]))
            })
            .with("decrement", |inputs| {
                let n = int(inputs, "n") - 1;
                Ok(BTreeMap::from([
                    ("n".to_string(), json!(n)),
                    ("continue".to_string(), json!(n > 0)),
                ]))
            })
            .with("fail", |_| Err("boom".to_string()))
            .with("forget", |_| Ok(BTreeMap::new()))
            .with("maybe", |inputs| {
                Ok(BTreeMap::from([
                    ("n".to_string(), inputs["n"].clone()),
                    ("continue".to_string(), json!("yes")),
                ]))
            });
        Self {
            functions,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Traces of every simple module run so far, sorted.
    pub fn calls(&self) -> Vec<String> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

fn int(inputs: &BTreeMap<String, Value>, name: &str) -> i64 {
    inputs.get(name).and_then(Value::as_i64).unwrap_or(0)
}

#[async_trait]
impl Executor for TestExecutor {
    fn executor_type(&self) -> &'static str {
        "test"
    }

    async fn execute(
        &self,
        request: SimpleModuleRequest,
        cancel: CancellationToken,
    ) -> Result<BTreeMap<String, Value>, ExecutorError> {
        self.calls.lock().unwrap().push(request.trace.to_string());
        match request.declaration.as_str() {
            "slow" | "wait" => {
                cancel.cancelled().await;
                Err(ExecutorError::Cancelled)
            }
            "stuck" => std::future::pending().await,
            _ => self.functions.execute(request, cancel).await,
        }
    }
}

/// Declarations known to [`TestExecutor`].
pub fn repository() -> Repository {
    Repository::new()
        .with(Declaration::simple("add", &["a", "b"], &["sum"]))
        .with(Declaration::simple("double", &["x"], &["y"]))
        .with(Declaration::simple("decrement", &["n"], &["n", "continue"]))
        .with(Declaration::simple("fail", &["x"], &["y"]))
        .with(Declaration::simple("forget", &["x"], &["y"]))
        .with(Declaration::simple("maybe", &["n"], &["n", "continue"]))
        .with(Declaration::simple("slow", &["x"], &["y"]))
        .with(Declaration::simple("stuck", &["x"], &["y"]))
        .with(Declaration::simple("wait", &["n"], &["n", "continue"]))
}

/// Proxy child instantiating a declaration from [`repository`].
pub fn proxy(name: &str, declaration: &str) -> Module {
    let declaration = repository()
        .resolve(declaration)
        .expect("test declaration exists");
    Module::proxy(name, &declaration)
}

pub fn conn(from: Endpoint, to: Endpoint) -> Connection {
    Connection::new(from, to)
}

pub fn child_in(child: usize, port: usize) -> Endpoint {
    Endpoint::ChildIn { child, port }
}

pub fn child_out(child: usize, port: usize) -> Endpoint {
    Endpoint::ChildOut { child, port }
}

/// `root(a, b) -> (sum, doubled)`: `adder` sums the inputs, `doubler` doubles the sum.
pub fn sum_and_double() -> Module {
    Module::composite(
        "root",
        &["a", "b"],
        &["sum", "doubled"],
        Body::new(
            vec![proxy("adder", "add"), proxy("doubler", "double")],
            vec![
                conn(Endpoint::InPort(0), child_in(0, 0)),
                conn(Endpoint::InPort(1), child_in(0, 1)),
                conn(child_out(0, 0), child_in(1, 0)),
                conn(child_out(0, 0), Endpoint::OutPort(0)),
                conn(child_out(1, 0), Endpoint::OutPort(1)),
            ],
        ),
    )
}

/// `root(x) -> y` running a single proxy of `declaration`.
pub fn single(declaration: &str) -> Module {
    Module::composite(
        "root",
        &["x"],
        &["y"],
        Body::new(
            vec![proxy(declaration, declaration)],
            vec![
                conn(Endpoint::InPort(0), child_in(0, 0)),
                conn(child_out(0, 0), Endpoint::OutPort(0)),
            ],
        ),
    )
}

/// `root(n) -> result` with a loop `countdown` that applies `declaration` until
/// its continue value is false.
pub fn countdown(declaration: &str) -> Module {
    let body = Body::new(
        vec![proxy("step", declaration)],
        vec![
            conn(Endpoint::InPort(0), child_in(0, 0)),
            conn(child_out(0, 0), Endpoint::OutPort(0)),
            conn(child_out(0, 1), Endpoint::OutPort(1)),
        ],
    );
    Module::composite(
        "root",
        &["n"],
        &["result"],
        Body::new(
            vec![Module::loop_module("countdown", &["n"], &["n", "continue"], body)],
            vec![
                conn(Endpoint::InPort(0), child_in(0, 0)),
                conn(child_out(0, 0), Endpoint::OutPort(0)),
            ],
        ),
    )
}

/// Master running over an in-memory staging area and a [`TestExecutor`].
pub struct TestHarness {
    pub staging: Arc<InMemoryStagingArea>,
    pub executor: Arc<TestExecutor>,
    pub provider: Arc<StaticContextProvider>,
    pub master: MasterHandle,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_staging(InMemoryStagingArea::new(), Duration::from_secs(10)).await
    }

    pub async fn with_grace_period(grace_period: Duration) -> Self {
        Self::with_staging(InMemoryStagingArea::new(), grace_period).await
    }

    pub async fn with_staging(staging: InMemoryStagingArea, grace_period: Duration) -> Self {
        Self::with_parts(staging, repository(), grace_period).await
    }

    pub async fn with_repository(repository: Repository) -> Self {
        Self::with_parts(InMemoryStagingArea::new(), repository, Duration::from_secs(10)).await
    }

    async fn with_parts(
        staging: InMemoryStagingArea,
        repository: Repository,
        grace_period: Duration,
    ) -> Self {
        let staging = Arc::new(staging);
        let executor = Arc::new(TestExecutor::new());
        let provider = Arc::new(StaticContextProvider::new(RuntimeContext::new(
            staging.clone(),
            executor.clone(),
            Arc::new(repository),
        )));
        let master = Master::builder()
            .context_provider(provider.clone())
            .cancel_grace_period(grace_period)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        Self {
            staging,
            executor,
            provider,
            master,
        }
    }

    /// Store a root in-port value.
    pub async fn supply(&self, in_port: &str, value: Value) {
        self.staging
            .insert(ExecutionTrace::root().in_port(in_port), value)
            .await;
    }

    /// Value of a root out-port, if any.
    pub async fn output(&self, out_port: &str) -> Option<Value> {
        self.staging
            .value(&ExecutionTrace::root().out_port(out_port))
            .await
    }

    /// Create and start an execution and wait until it finishes.
    ///
    /// Returns the names of the out-ports announced as available, in order,
    /// and the outcome.
    pub async fn run(&self, params: ExecutionParams) -> (Vec<String>, ExecutionOutcome) {
        let mut events = self.master.subscribe();
        let id = self.master.create_execution(params).await.unwrap();
        self.master.start_execution(id).unwrap();

        tokio::time::timeout(EXECUTION_TIMEOUT, async move {
            let mut outputs = Vec::new();
            loop {
                match events.recv().await.unwrap() {
                    ExecutionEvent::OutputAvailable {
                        execution_id,
                        out_port,
                        ..
                    } if execution_id == id => outputs.push(out_port),
                    ExecutionEvent::ExecutionFinished(outcome) if outcome.execution_id == id => {
                        return (outputs, outcome);
                    }
                    _ => {}
                }
            }
        })
        .await
        .expect("execution finished in time")
    }

    /// Wait until the executor was called at least `count` times.
    pub async fn wait_for_calls(&self, count: usize) {
        tokio::time::timeout(EXECUTION_TIMEOUT, async {
            while self.executor.calls().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executor called in time");
    }

    /// Wait until every acquired runtime context was released.
    pub async fn wait_for_releases(&self) {
        tokio::time::timeout(EXECUTION_TIMEOUT, async {
            while self.provider.releases() < self.provider.acquisitions() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("contexts released in time");
    }
}

/// Wait for the outcome of execution `id`.
pub async fn wait_until_finished(
    events: &mut broadcast::Receiver<ExecutionEvent>,
    id: ExecutionId,
) -> ExecutionOutcome {
    tokio::time::timeout(EXECUTION_TIMEOUT, async {
        loop {
            if let ExecutionEvent::ExecutionFinished(outcome) = events.recv().await.unwrap()
                && outcome.execution_id == id
            {
                return outcome;
            }
        }
    })
    .await
    .expect("execution finished in time")
}

/// Error code of a failed outcome.
pub fn failure_code(outcome: &ExecutionOutcome) -> Option<&str> {
    outcome.failure.as_ref().map(|f| f.code.as_str())
}

/// Trace of a failed outcome, as a string.
pub fn failure_trace(outcome: &ExecutionOutcome) -> Option<String> {
    outcome
        .failure
        .as_ref()
        .and_then(|f| f.trace.as_ref())
        .map(ToString::to_string)
}
