// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor module - simple-module execution backends.

pub mod function;
pub mod process;
mod traits;

pub use function::FunctionExecutor;
pub use process::ProcessExecutor;
pub use traits::*;
