// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudKeeper Core - Execution Resumption and Orchestration
//!
//! This crate runs dataflow workflows described by [`cloudkeeper_model`]. It
//! re-uses every port value that is still valid from a previous run and only
//! recomputes what changed or is missing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Master (master.rs)                           │
//! │   execution ids · start/cancel · grace-period timers · event bus     │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │ one task per execution                     ▲ ExecutionEvent
//!          ▼                                            │
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │               Top-level interpreter (top_level.rs)                   │
//! │   context lease · root in-port checks · OutputAvailable events       │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │ spawns root at "/"
//!          ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 Module interpreters (interpreter/)                   │
//! │   ┌─────────┐  ┌─────────┐  ┌─────────────────────────┐  ┌────────┐  │
//! │   │  Input  │  │ Simple  │  │ Composite               │  │  Loop  │  │
//! │   │         │  │         │  │  DependencyGraph        │  │        │  │
//! │   │         │  │         │  │  ComputeResumeState     │  │        │  │
//! │   └─────────┘  └─────────┘  └─────────────────────────┘  └────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │   StagingArea        │   │   Executor           │
//! │   (port values)      │   │   (simple modules)   │
//! └──────────────────────┘   └──────────────────────┘
//! ```
//!
//! # Error Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | `MISSING_IN_PORT_VALUES` | A required in-port will never receive a value |
//! | `INVALID_ARGUMENT` | Unknown port name or out-of-range index |
//! | `STAGING_FAILURE` | The staging area failed |
//! | `EXECUTOR_FAILURE` | A simple module failed |
//! | `MISSING_OUTPUT` | A simple module did not produce a requested out-port |
//! | `UNEXPECTED_TERMINATION` | A module terminated without signalling its out-ports |
//! | `INVALID_CONTINUE_VALUE` | A loop's continue value is not a boolean |
//! | `CANCELLED` | The execution was cancelled |
//! | `FORCED_TERMINATION` | The execution ignored cancellation for the grace period |
//! | `INVALID_MODEL` | The module tree is inconsistent, such as a port with no incoming connection or a cyclic body |
//! | `PROTOCOL_VIOLATION` | An interpreter received a message its state does not allow |
//! | `CONTEXT_UNAVAILABLE` | The runtime context could not be acquired |
//!
//! # Configuration
//!
//! See [`Config::from_env`] for the environment variables read by the
//! `cloudkeeper-run` binary.

#![deny(missing_docs)]

/// Workflow bundles loaded from JSON files.
pub mod bundle;

/// Configuration loading from environment variables.
pub mod config;

/// Runtime contexts and their providers.
pub mod context;

/// Error types.
pub mod error;

/// Execution ids, parameters, outcomes and events.
pub mod execution;

/// Simple-module executors.
pub mod executor;

/// Dependency graph of a composite module body.
pub mod graph;

mod interpreter;

/// Master orchestrator.
pub mod master;

/// Compact sets of port indices.
pub mod port_set;

/// Resume-state computation.
pub mod resume;

/// Staging area of port values.
pub mod staging;

mod top_level;

pub use bundle::WorkflowBundle;
pub use config::{Config, ConfigError};
pub use context::{
    ContextError, ContextLease, RuntimeContext, RuntimeContextProvider, StaticContextProvider,
};
pub use error::{ExecutionFailure, InterpreterError, FORCED_TERMINATION};
pub use execution::{ExecutionEvent, ExecutionId, ExecutionOutcome, ExecutionParams};
pub use executor::{Executor, ExecutorError, FunctionExecutor, ProcessExecutor, SimpleModuleRequest};
pub use graph::{DependencyGraph, GraphError, HasValue, NodeId, PortState, Witness};
pub use master::{Master, MasterBuilder, MasterError, MasterHandle};
pub use port_set::PortSet;
pub use resume::{ComputeResumeState, ResumeError, ResumePlan};
pub use staging::{InMemoryStagingArea, StagingArea, StagingError};
