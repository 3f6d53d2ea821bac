// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interpreter of simple modules.
//!
//! Waits until every recomputed in-port has been signalled, then runs the module
//! once through the executor: read all in-port values, execute, store the
//! out-port values, and signal the requested out-ports.

use std::collections::BTreeMap;
use std::sync::Arc;

use cloudkeeper_model::Declaration;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Interpreter, InterpreterCore, InterpreterParams};
use crate::error::{InterpreterError, Result};
use crate::executor::SimpleModuleRequest;
use crate::port_set::PortSet;

pub(crate) struct SimpleInterpreter {
    core: InterpreterCore<Result<()>>,
    declaration: Arc<Declaration>,
    waiting_for: PortSet,
    started: bool,
    cancel: CancellationToken,
}

impl SimpleInterpreter {
    pub(crate) fn new(params: InterpreterParams, declaration: Arc<Declaration>) -> Self {
        let core = InterpreterCore::new(params);
        let waiting_for = core.recomputed_in_ports.clone();
        Self {
            core,
            declaration,
            waiting_for,
            started: false,
            cancel: CancellationToken::new(),
        }
    }

    fn execute(&mut self) {
        self.started = true;
        let module = self.core.module.clone();
        let trace = self.core.trace.clone();
        let context = self.core.context.clone();
        let declaration = self.declaration.name.clone();
        let requested: Vec<String> = self
            .core
            .requested_out_ports
            .iter()
            .map(|o| self.core.out_port_name(o).to_string())
            .collect();
        let cancel = self.cancel.clone();

        info!(declaration = %declaration, "Executing simple module");
        self.core
            .actions
            .spawn(format!("execute {}", trace), async move {
                let staging = &context.staging;
                let inputs = try_join_all(module.in_ports.iter().map(|port| {
                    let port_trace = trace.in_port(&port.name);
                    async move {
                        match staging.get(&port_trace).await {
                            Ok(value) => Ok((port.name.clone(), value)),
                            Err(e) => Err(InterpreterError::staging(&port_trace, e)),
                        }
                    }
                }))
                .await?
                .into_iter()
                .collect::<BTreeMap<_, _>>();

                let request = SimpleModuleRequest {
                    trace: trace.clone(),
                    declaration,
                    inputs,
                };
                let outputs = context
                    .executor
                    .execute(request, cancel)
                    .await
                    .map_err(|source| InterpreterError::Executor {
                        trace: trace.clone(),
                        source,
                    })?;

                if let Some(missing) = requested.iter().find(|name| !outputs.contains_key(*name)) {
                    return Err(InterpreterError::MissingOutput {
                        trace,
                        out_port: missing.clone(),
                    });
                }

                let mut writes = Vec::with_capacity(outputs.len());
                for (name, value) in outputs {
                    if module.out_port_index(&name).is_none() {
                        warn!(trace = %trace, out_port = %name, "Discarding value of undeclared out-port");
                        continue;
                    }
                    let port_trace = trace.out_port(&name);
                    writes.push(async move {
                        staging
                            .put(&port_trace, value)
                            .await
                            .map_err(|e| InterpreterError::staging(&port_trace, e))
                    });
                }
                try_join_all(writes).await?;
                Ok(())
            });
    }
}

impl Interpreter for SimpleInterpreter {
    type Completion = Result<()>;

    fn core(&mut self) -> &mut InterpreterCore<Self::Completion> {
        &mut self.core
    }

    fn start(&mut self) -> Result<()> {
        if self.waiting_for.is_empty() {
            self.execute();
        }
        Ok(())
    }

    fn in_port_has_signal(&mut self, in_port: usize) -> Result<()> {
        self.core.check_in_port(in_port)?;
        if !self.waiting_for.remove(in_port) {
            debug!(in_port = %self.core.in_port_name(in_port), "Ignoring signal for in-port that is not awaited");
            return Ok(());
        }
        if self.waiting_for.is_empty() && !self.started {
            self.execute();
        }
        Ok(())
    }

    fn completed(&mut self, completion: Self::Completion) -> Result<()> {
        completion?;
        let requested: Vec<usize> = self.core.requested_out_ports.iter().collect();
        for out_port in requested {
            self.core.report_out_port(out_port);
        }
        Ok(())
    }

    fn cancel(&mut self, _cause: &str) {
        self.cancel.cancel();
    }
}
