// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudKeeper Model - Runtime Module Graph
//!
//! This crate defines the immutable, already-linked shape of a workflow as the
//! interpreters see it:
//!
//! - [`Module`]: a node of the module tree (input literal, composite, loop, or
//!   proxy to a named [`Declaration`])
//! - [`Body`]: the children and [`Connection`]s owned by a composite or loop
//! - [`Repository`]: named declarations that proxy modules resolve against
//! - [`ExecutionTrace`]: hierarchical path identifying a module or port instance
//!   within one execution, used as the staging-area key
//!
//! Ports are addressed by their position in the owning module's port list; children
//! by their position in the owning body. All types are serde-serializable so that a
//! linked workflow can be shipped as JSON.
//!
//! # Connection Kinds
//!
//! | Kind | From | To |
//! |------|------|----|
//! | `ParentInToChildIn` | in-port of the parent | in-port of a child |
//! | `Sibling` | out-port of a child | in-port of another child |
//! | `ChildOutToParentOut` | out-port of a child | out-port of the parent |
//! | `ShortCircuit` | in-port of the parent | out-port of the parent |

#![deny(missing_docs)]

/// Model validation errors.
pub mod error;

/// Modules, bodies, connections and declarations.
pub mod module;

/// Execution traces (staging-area keys).
pub mod trace;

pub use error::ModelError;
pub use module::{
    Body, Connection, ConnectionKind, Declaration, DeclarationKind, Endpoint, Module, ModuleKind,
    Port, Repository, CONTINUE_PORT, INPUT_OUT_PORT,
};
pub use trace::{ExecutionTrace, TraceElement};
