// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for module interpretation and resumption.
//!
//! Every test runs a workflow through the master and inspects the staging area,
//! the published events, and the simple modules that were executed.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cloudkeeper_core::{ExecutionParams, InMemoryStagingArea};
use cloudkeeper_model::{Body, Declaration, Endpoint, ExecutionTrace, Module};
use common::*;
use serde_json::json;

#[tokio::test]
async fn test_fresh_run_computes_all_outputs() {
    let harness = TestHarness::new().await;
    harness.supply("a", json!(1)).await;
    harness.supply("b", json!(2)).await;

    let (mut outputs, outcome) = harness
        .run(ExecutionParams::new(Arc::new(sum_and_double())))
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    outputs.sort();
    assert_eq!(outputs, vec!["doubled", "sum"]);
    assert_eq!(harness.output("sum").await, Some(json!(3)));
    assert_eq!(harness.output("doubled").await, Some(json!(6)));
    assert_eq!(harness.executor.calls(), vec!["/adder", "/doubler"]);
}

#[tokio::test]
async fn test_resume_reuses_existing_values() {
    let harness = TestHarness::new().await;
    harness.supply("a", json!(1)).await;
    harness.supply("b", json!(2)).await;
    let module = Arc::new(sum_and_double());

    let (_, first) = harness.run(ExecutionParams::new(module.clone())).await;
    assert!(first.is_success());
    harness.executor.clear_calls();

    let (mut outputs, second) = harness
        .run(ExecutionParams::new(module).updated_in_ports(Vec::<String>::new()))
        .await;

    assert!(second.is_success(), "{:?}", second.failure);
    outputs.sort();
    assert_eq!(outputs, vec!["doubled", "sum"]);
    assert!(harness.executor.calls().is_empty());
}

#[tokio::test]
async fn test_updated_in_port_recomputes_downstream() {
    let harness = TestHarness::new().await;
    harness.supply("a", json!(1)).await;
    harness.supply("b", json!(2)).await;
    let module = Arc::new(sum_and_double());

    let (_, first) = harness.run(ExecutionParams::new(module.clone())).await;
    assert!(first.is_success());
    harness.executor.clear_calls();

    harness.supply("b", json!(5)).await;
    let (_, second) = harness
        .run(ExecutionParams::new(module).updated_in_ports(["b"]))
        .await;

    assert!(second.is_success(), "{:?}", second.failure);
    assert_eq!(harness.output("sum").await, Some(json!(6)));
    assert_eq!(harness.output("doubled").await, Some(json!(12)));
    assert_eq!(harness.executor.calls(), vec!["/adder", "/doubler"]);
}

#[tokio::test]
async fn test_only_requested_outputs_are_computed() {
    let harness = TestHarness::new().await;
    harness.supply("a", json!(4)).await;
    harness.supply("b", json!(5)).await;

    let (outputs, outcome) = harness
        .run(ExecutionParams::new(Arc::new(sum_and_double())).requested_out_ports(["sum"]))
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(outputs, vec!["sum"]);
    assert_eq!(harness.output("sum").await, Some(json!(9)));
    assert_eq!(harness.output("doubled").await, None);
    assert_eq!(harness.executor.calls(), vec!["/adder"]);
}

#[tokio::test]
async fn test_short_circuit_runs_no_children() {
    let harness = TestHarness::new().await;
    harness.supply("x", json!("hello")).await;
    let module = Module::composite(
        "root",
        &["x"],
        &["y"],
        Body::new(vec![], vec![conn(Endpoint::InPort(0), Endpoint::OutPort(0))]),
    );

    let (outputs, outcome) = harness
        .run(ExecutionParams::new(Arc::new(module)).updated_in_ports(Vec::<String>::new()))
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(outputs, vec!["y"]);
    assert_eq!(harness.output("y").await, Some(json!("hello")));
    assert!(harness.executor.calls().is_empty());
}

#[tokio::test]
async fn test_input_module_feeds_sibling() {
    let harness = TestHarness::new().await;
    harness.supply("b", json!(1)).await;
    let module = Module::composite(
        "root",
        &["b"],
        &["sum"],
        Body::new(
            vec![Module::input("five", json!(5)), proxy("adder", "add")],
            vec![
                conn(child_out(0, 0), child_in(1, 0)),
                conn(Endpoint::InPort(0), child_in(1, 1)),
                conn(child_out(1, 0), Endpoint::OutPort(0)),
            ],
        ),
    );

    let (_, outcome) = harness.run(ExecutionParams::new(Arc::new(module))).await;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(harness.output("sum").await, Some(json!(6)));
    assert_eq!(
        harness
            .staging
            .value(&ExecutionTrace::root().child("five").out_port("value"))
            .await,
        Some(json!(5))
    );
}

#[tokio::test]
async fn test_composite_declaration_through_proxy() {
    let inner = Declaration::composite(
        "sum_decl",
        &["a", "b"],
        &["sum"],
        Body::new(
            vec![proxy("adder", "add")],
            vec![
                conn(Endpoint::InPort(0), child_in(0, 0)),
                conn(Endpoint::InPort(1), child_in(0, 1)),
                conn(child_out(0, 0), Endpoint::OutPort(0)),
            ],
        ),
    );
    let module = Module::composite(
        "root",
        &["a", "b"],
        &["sum"],
        Body::new(
            vec![Module::proxy("outer", &inner)],
            vec![
                conn(Endpoint::InPort(0), child_in(0, 0)),
                conn(Endpoint::InPort(1), child_in(0, 1)),
                conn(child_out(0, 0), Endpoint::OutPort(0)),
            ],
        ),
    );

    let harness = TestHarness::with_repository(repository().with(inner)).await;
    harness.supply("a", json!(20)).await;
    harness.supply("b", json!(22)).await;

    let (_, outcome) = harness.run(ExecutionParams::new(Arc::new(module))).await;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(harness.output("sum").await, Some(json!(42)));
    assert_eq!(harness.executor.calls(), vec!["/outer/adder"]);
}

#[tokio::test]
async fn test_unconnected_child_in_port_is_rejected() {
    let harness = TestHarness::new().await;
    harness.supply("x", json!(1)).await;
    // adder.b has no incoming connection
    let module = Module::composite(
        "root",
        &["x"],
        &["sum"],
        Body::new(
            vec![proxy("adder", "add")],
            vec![
                conn(Endpoint::InPort(0), child_in(0, 0)),
                conn(child_out(0, 0), Endpoint::OutPort(0)),
            ],
        ),
    );

    let (outputs, outcome) = harness.run(ExecutionParams::new(Arc::new(module))).await;

    assert!(outputs.is_empty());
    assert_eq!(failure_code(&outcome), Some("INVALID_MODEL"));
    assert_eq!(failure_trace(&outcome).as_deref(), Some("/"));
    assert!(harness.executor.calls().is_empty());
    harness.wait_for_releases().await;
}

#[tokio::test]
async fn test_unconnected_out_port_is_rejected() {
    let harness = TestHarness::new().await;
    harness.supply("x", json!(1)).await;
    let module = Module::composite(
        "root",
        &["x"],
        &["y", "z"],
        Body::new(vec![], vec![conn(Endpoint::InPort(0), Endpoint::OutPort(0))]),
    );

    let (outputs, outcome) = harness.run(ExecutionParams::new(Arc::new(module))).await;

    assert!(outputs.is_empty());
    assert_eq!(failure_code(&outcome), Some("INVALID_MODEL"));
    assert!(outcome.failure.unwrap().message.contains("no incoming connection"));
}

#[tokio::test]
async fn test_cyclic_declaration_is_rejected_when_resolved() {
    // first.b <- second.sum and second.a, second.b <- first.sum
    let cyclic = Declaration::composite(
        "cyclic",
        &["x"],
        &["y"],
        Body::new(
            vec![proxy("first", "add"), proxy("second", "add")],
            vec![
                conn(Endpoint::InPort(0), child_in(0, 0)),
                conn(child_out(1, 0), child_in(0, 1)),
                conn(child_out(0, 0), child_in(1, 0)),
                conn(child_out(0, 0), child_in(1, 1)),
                conn(child_out(0, 0), Endpoint::OutPort(0)),
            ],
        ),
    );
    let module = Module::composite(
        "root",
        &["x"],
        &["y"],
        Body::new(
            vec![Module::proxy("outer", &cyclic)],
            vec![
                conn(Endpoint::InPort(0), child_in(0, 0)),
                conn(child_out(0, 0), Endpoint::OutPort(0)),
            ],
        ),
    );

    let harness = TestHarness::with_repository(repository().with(cyclic)).await;
    harness.supply("x", json!(1)).await;

    let (_, outcome) = harness.run(ExecutionParams::new(Arc::new(module))).await;

    assert_eq!(failure_code(&outcome), Some("INVALID_MODEL"));
    assert_eq!(failure_trace(&outcome).as_deref(), Some("/outer"));
    assert!(harness.executor.calls().is_empty());
}

#[tokio::test]
async fn test_loop_runs_until_continue_is_false() {
    let harness = TestHarness::new().await;
    harness.supply("n", json!(3)).await;

    let (outputs, outcome) = harness
        .run(ExecutionParams::new(Arc::new(countdown("decrement"))))
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(outputs, vec!["result"]);
    assert_eq!(harness.output("result").await, Some(json!(0)));
    assert_eq!(
        harness.executor.calls(),
        vec![
            "/countdown/#0/step",
            "/countdown/#1/step",
            "/countdown/#2/step"
        ]
    );
    let second_iteration = ExecutionTrace::root().child("countdown").iteration(1);
    assert_eq!(
        harness.staging.value(&second_iteration.in_port("n")).await,
        Some(json!(2))
    );
}

#[tokio::test]
async fn test_loop_resume_reuses_first_iteration_only() {
    let harness = TestHarness::new().await;
    harness.supply("n", json!(3)).await;
    let module = Arc::new(countdown("decrement"));

    let (_, first) = harness.run(ExecutionParams::new(module.clone())).await;
    assert!(first.is_success(), "{:?}", first.failure);
    harness.executor.clear_calls();

    // The loop's in-port keeps its value, so iteration 0 has nothing recomputed
    harness
        .staging
        .remove(&ExecutionTrace::root().out_port("result"))
        .await;
    let (outputs, second) = harness
        .run(ExecutionParams::new(module).updated_in_ports(Vec::<String>::new()))
        .await;

    assert!(second.is_success(), "{:?}", second.failure);
    assert_eq!(outputs, vec!["result"]);
    assert_eq!(harness.output("result").await, Some(json!(0)));
    assert_eq!(
        harness.executor.calls(),
        vec!["/countdown/#1/step", "/countdown/#2/step"]
    );
}

#[tokio::test]
async fn test_loop_recomputes_every_iteration_after_update() {
    let harness = TestHarness::new().await;
    harness.supply("n", json!(2)).await;
    let module = Arc::new(countdown("decrement"));

    let (_, first) = harness.run(ExecutionParams::new(module.clone())).await;
    assert!(first.is_success(), "{:?}", first.failure);
    harness.executor.clear_calls();

    harness.supply("n", json!(3)).await;
    let (_, second) = harness
        .run(ExecutionParams::new(module).updated_in_ports(["n"]))
        .await;

    assert!(second.is_success(), "{:?}", second.failure);
    assert_eq!(harness.output("result").await, Some(json!(0)));
    assert_eq!(
        harness.executor.calls(),
        vec![
            "/countdown/#0/step",
            "/countdown/#1/step",
            "/countdown/#2/step"
        ]
    );
}

#[tokio::test]
async fn test_cancel_during_loop_iteration() {
    let harness = TestHarness::new().await;
    harness.supply("n", json!(3)).await;

    let mut events = harness.master.subscribe();
    let id = harness
        .master
        .create_execution(ExecutionParams::new(Arc::new(countdown("wait"))))
        .await
        .unwrap();
    harness.master.start_execution(id).unwrap();
    harness.wait_for_calls(1).await;

    harness.master.cancel(id, "stop looping").unwrap();
    let outcome = wait_until_finished(&mut events, id).await;

    assert_eq!(failure_code(&outcome), Some("CANCELLED"));
    assert_eq!(harness.executor.calls(), vec!["/countdown/#0/step"]);
    assert_eq!(harness.output("result").await, None);
    harness.wait_for_releases().await;
    assert_eq!(harness.provider.releases(), 1);
}

#[tokio::test]
async fn test_loop_rejects_non_boolean_continue_value() {
    let harness = TestHarness::new().await;
    harness.supply("n", json!(1)).await;

    let (outputs, outcome) = harness
        .run(ExecutionParams::new(Arc::new(countdown("maybe"))))
        .await;

    assert!(outputs.is_empty());
    assert_eq!(failure_code(&outcome), Some("INVALID_CONTINUE_VALUE"));
    assert_eq!(failure_trace(&outcome).as_deref(), Some("/countdown"));
}

#[tokio::test]
async fn test_executor_failure_fails_execution() {
    let harness = TestHarness::new().await;
    harness.supply("x", json!(1)).await;

    let (outputs, outcome) = harness
        .run(ExecutionParams::new(Arc::new(single("fail"))))
        .await;

    assert!(outputs.is_empty());
    assert_eq!(failure_code(&outcome), Some("EXECUTOR_FAILURE"));
    assert_eq!(failure_trace(&outcome).as_deref(), Some("/fail"));
    assert!(outcome.failure.unwrap().message.contains("boom"));
}

#[tokio::test]
async fn test_failure_aborts_running_siblings() {
    let harness = TestHarness::new().await;
    harness.supply("x", json!(1)).await;
    let module = Module::composite(
        "root",
        &["x"],
        &["slow", "failed"],
        Body::new(
            vec![proxy("waiting", "stuck"), proxy("failing", "fail")],
            vec![
                conn(Endpoint::InPort(0), child_in(0, 0)),
                conn(Endpoint::InPort(0), child_in(1, 0)),
                conn(child_out(0, 0), Endpoint::OutPort(0)),
                conn(child_out(1, 0), Endpoint::OutPort(1)),
            ],
        ),
    );

    let (_, outcome) = harness.run(ExecutionParams::new(Arc::new(module))).await;

    assert_eq!(failure_code(&outcome), Some("EXECUTOR_FAILURE"));
    assert_eq!(failure_trace(&outcome).as_deref(), Some("/failing"));
    harness.wait_for_releases().await;
}

#[tokio::test]
async fn test_missing_output_is_reported() {
    let harness = TestHarness::new().await;
    harness.supply("x", json!(1)).await;

    let (_, outcome) = harness
        .run(ExecutionParams::new(Arc::new(single("forget"))))
        .await;

    assert_eq!(failure_code(&outcome), Some("MISSING_OUTPUT"));
    assert_eq!(failure_trace(&outcome).as_deref(), Some("/forget"));
}

#[tokio::test]
async fn test_unsupplied_required_in_port() {
    let harness = TestHarness::new().await;
    harness.supply("a", json!(1)).await;

    let (_, outcome) = harness
        .run(ExecutionParams::new(Arc::new(sum_and_double())))
        .await;

    assert_eq!(failure_code(&outcome), Some("MISSING_IN_PORT_VALUES"));
    let failure = outcome.failure.unwrap();
    assert_eq!(failure.trace, Some(ExecutionTrace::root()));
    assert!(failure.message.contains("\"b\""));
    assert!(harness.executor.calls().is_empty());
}

#[tokio::test]
async fn test_updated_in_port_without_value() {
    let harness = TestHarness::new().await;
    harness.supply("a", json!(1)).await;

    let (_, outcome) = harness
        .run(ExecutionParams::new(Arc::new(sum_and_double())).updated_in_ports(["a", "b"]))
        .await;

    assert_eq!(failure_code(&outcome), Some("MISSING_IN_PORT_VALUES"));
}

#[tokio::test]
async fn test_unknown_out_port_name() {
    let harness = TestHarness::new().await;

    let (_, outcome) = harness
        .run(ExecutionParams::new(Arc::new(sum_and_double())).requested_out_ports(["total"]))
        .await;

    assert_eq!(failure_code(&outcome), Some("INVALID_ARGUMENT"));
    assert!(outcome.failure.unwrap().message.contains("total"));
}

#[tokio::test]
async fn test_staging_failure_is_reported_with_trace() {
    let staging =
        InMemoryStagingArea::new().with_failures_under(ExecutionTrace::root().child("doubler"));
    let harness = TestHarness::with_staging(staging, Duration::from_secs(10)).await;
    harness.supply("a", json!(1)).await;
    harness.supply("b", json!(2)).await;

    let (_, outcome) = harness
        .run(ExecutionParams::new(Arc::new(sum_and_double())))
        .await;

    assert_eq!(failure_code(&outcome), Some("STAGING_FAILURE"));
    assert!(failure_trace(&outcome).unwrap().starts_with("/doubler"));
}
