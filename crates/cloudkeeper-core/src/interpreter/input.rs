// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interpreter of input modules: stores the literal value at the out-port.

use serde_json::Value;

use super::{Interpreter, InterpreterCore, InterpreterParams};
use crate::error::{InterpreterError, Result};
use crate::staging;

pub(crate) struct InputInterpreter {
    core: InterpreterCore<staging::Result<()>>,
    value: Option<Value>,
}

impl InputInterpreter {
    pub(crate) fn new(params: InterpreterParams, value: Value) -> Self {
        Self {
            core: InterpreterCore::new(params),
            value: Some(value),
        }
    }
}

impl Interpreter for InputInterpreter {
    type Completion = staging::Result<()>;

    fn core(&mut self) -> &mut InterpreterCore<Self::Completion> {
        &mut self.core
    }

    fn start(&mut self) -> Result<()> {
        let Some(value) = self.value.take() else {
            return Ok(());
        };
        let trace = self.core.out_port_trace(0);
        let staging = self.core.context.staging.clone();
        self.core
            .actions
            .spawn(format!("store {}", trace), async move {
                staging.put(&trace, value).await
            });
        Ok(())
    }

    fn in_port_has_signal(&mut self, in_port: usize) -> Result<()> {
        Err(InterpreterError::protocol(
            &self.core.trace,
            format!("input module received a signal for in-port {}", in_port),
        ))
    }

    fn completed(&mut self, completion: Self::Completion) -> Result<()> {
        completion.map_err(|e| InterpreterError::staging(&self.core.out_port_trace(0), e))?;
        if self.core.requested_out_ports.contains(0) {
            self.core.report_out_port(0);
        }
        Ok(())
    }

    fn cancel(&mut self, _cause: &str) {}
}
