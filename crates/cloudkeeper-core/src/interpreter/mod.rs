// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module interpreters.
//!
//! Every module instance of an execution is run by one interpreter task. A
//! parent spawns its children and talks to them only through messages:
//!
//! ```text
//!            InPortHasSignal / Cancel
//!   parent ───────────────────────────► child mailbox
//!   mailbox ◄────────────────────────── child
//!            SubmoduleOutPortHasSignal
//! ```
//!
//! The parent learns that a child terminated when the child's future
//! completes. An interpreter's future resolves once it has no outstanding
//! action left, or as soon as one of its actions fails. In the latter case the
//! interpreter's remaining actions (including running children) are aborted.

mod actions;
mod composite;
mod input;
mod loop_module;
mod simple;

use std::collections::HashMap;
use std::sync::Arc;

use cloudkeeper_model::{
    Body, Declaration, DeclarationKind, ExecutionTrace, Module, ModuleKind, ModelError, Repository,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{Instrument, debug, debug_span, warn};

use crate::context::RuntimeContext;
use crate::error::{InterpreterError, Result};
use crate::port_set::PortSet;

pub(crate) use actions::{ActionToken, Actions};

use composite::CompositeInterpreter;
use input::InputInterpreter;
use loop_module::LoopInterpreter;
use simple::SimpleInterpreter;

/// Messages delivered to an interpreter's mailbox.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InterpreterMessage {
    /// The value of an in-port that was announced as recomputed is now available.
    InPortHasSignal { in_port: usize },
    /// A child produced the value of one of its out-ports.
    SubmoduleOutPortHasSignal { child: usize, out_port: usize },
    /// Stop as soon as possible.
    Cancel { cause: String },
}

/// How a child reaches its parent.
#[derive(Debug, Clone)]
pub(crate) struct ParentLink {
    mailbox: UnboundedSender<InterpreterMessage>,
    index: usize,
}

impl ParentLink {
    /// `index` identifies the child to the parent (child index or iteration).
    pub(crate) fn new(mailbox: UnboundedSender<InterpreterMessage>, index: usize) -> Self {
        Self { mailbox, index }
    }

    fn out_port_has_signal(&self, out_port: usize) {
        let message = InterpreterMessage::SubmoduleOutPortHasSignal {
            child: self.index,
            out_port,
        };
        if self.mailbox.send(message).is_err() {
            debug!(out_port, "Parent is gone, dropping out-port signal");
        }
    }
}

/// Everything a new interpreter is created with.
pub(crate) struct InterpreterParams {
    pub(crate) module: Arc<Module>,
    pub(crate) trace: ExecutionTrace,
    /// Out-ports the parent needs.
    pub(crate) requested_out_ports: PortSet,
    /// In-ports that will receive a new value, announced by `InPortHasSignal`.
    /// Every other in-port either has a value already or is not needed.
    pub(crate) recomputed_in_ports: PortSet,
    pub(crate) context: Arc<RuntimeContext>,
    pub(crate) parent: ParentLink,
}

/// What a module does when interpreted, after proxy resolution.
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Input { value: Value },
    Simple { declaration: Arc<Declaration> },
    Composite { body: Arc<Body> },
    Loop { body: Arc<Body>, continue_port: usize },
}

impl Behavior {
    /// Resolve the behavior of `module`, following a proxy one level.
    pub(crate) fn resolve(
        module: &Module,
        repository: &Repository,
    ) -> std::result::Result<Self, ModelError> {
        Ok(match &module.kind {
            ModuleKind::Input { value } => Behavior::Input {
                value: value.clone(),
            },
            ModuleKind::Composite { body } => Behavior::Composite { body: body.clone() },
            ModuleKind::Loop {
                body,
                continue_port,
            } => Behavior::Loop {
                body: body.clone(),
                continue_port: *continue_port,
            },
            ModuleKind::Proxy { .. } => {
                let declaration = repository.resolve_proxy(module)?;
                match &declaration.kind {
                    DeclarationKind::Simple => Behavior::Simple {
                        declaration: declaration.clone(),
                    },
                    DeclarationKind::Composite { body } => {
                        declaration.validate()?;
                        Behavior::Composite { body: body.clone() }
                    }
                }
            }
        })
    }
}

/// Create the interpreter of one module instance.
///
/// Returns the interpreter's mailbox and its future. Nothing runs until the
/// future is polled.
pub(crate) fn spawn_interpreter(
    params: InterpreterParams,
    behavior: Behavior,
) -> (
    UnboundedSender<InterpreterMessage>,
    BoxFuture<'static, Result<()>>,
) {
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let own_mailbox = mailbox_tx.clone();
    let span = debug_span!("module", trace = %params.trace);

    let future = async move {
        match behavior {
            Behavior::Input { value } => drive(InputInterpreter::new(params, value), mailbox_rx).await,
            Behavior::Simple { declaration } => {
                drive(SimpleInterpreter::new(params, declaration), mailbox_rx).await
            }
            Behavior::Composite { body } => {
                drive(
                    CompositeInterpreter::new(params, body, own_mailbox),
                    mailbox_rx,
                )
                .await
            }
            Behavior::Loop {
                body,
                continue_port,
            } => {
                drive(
                    LoopInterpreter::new(params, body, continue_port, own_mailbox),
                    mailbox_rx,
                )
                .await
            }
        }
    }
    .instrument(span)
    .boxed();

    (mailbox_tx, future)
}

/// Event handlers of one interpreter kind, run by [`drive`].
pub(crate) trait Interpreter: Send {
    type Completion: Send + 'static;

    fn core(&mut self) -> &mut InterpreterCore<Self::Completion>;

    fn start(&mut self) -> Result<()>;

    fn in_port_has_signal(&mut self, in_port: usize) -> Result<()>;

    fn submodule_out_port_has_signal(&mut self, child: usize, out_port: usize) -> Result<()> {
        Err(InterpreterError::protocol(
            &self.core().trace,
            format!(
                "unexpected out-port signal from child {} (out-port {})",
                child, out_port
            ),
        ))
    }

    fn completed(&mut self, completion: Self::Completion) -> Result<()>;

    /// Forward cancellation to whatever is running on this interpreter's behalf.
    fn cancel(&mut self, cause: &str);
}

/// Run an interpreter until it has no outstanding action, fails, or is cancelled.
async fn drive<I: Interpreter + 'static>(
    mut interpreter: I,
    mut mailbox: UnboundedReceiver<InterpreterMessage>,
) -> Result<()> {
    debug!("Interpreter started");
    interpreter.start()?;

    loop {
        if interpreter.core().actions.is_empty() {
            debug!("Interpreter finished");
            return Ok(());
        }

        tokio::select! {
            biased;

            message = mailbox.recv() => match message {
                Some(message) => handle_message(&mut interpreter, message).await?,
                None => {
                    let outstanding = interpreter.core().actions.len();
                    return Err(InterpreterError::protocol(
                        &interpreter.core().trace,
                        format!("mailbox closed with {} outstanding actions", outstanding),
                    ));
                }
            },

            Some(completion) = interpreter.core().actions.next() => {
                // A child signals its out-ports before its future completes;
                // deliver those signals before looking at the completion.
                while let Ok(message) = mailbox.try_recv() {
                    handle_message(&mut interpreter, message).await?;
                }
                interpreter.completed(completion)?;
            }
        }
    }
}

async fn handle_message<I: Interpreter>(
    interpreter: &mut I,
    message: InterpreterMessage,
) -> Result<()> {
    match message {
        InterpreterMessage::InPortHasSignal { in_port } => interpreter.in_port_has_signal(in_port),
        InterpreterMessage::SubmoduleOutPortHasSignal { child, out_port } => {
            interpreter.submodule_out_port_has_signal(child, out_port)
        }
        InterpreterMessage::Cancel { cause } => {
            debug!(
                cause = %cause,
                outstanding = ?interpreter.core().actions.descriptions(),
                "Cancelling interpreter"
            );
            interpreter.cancel(&cause);
            interpreter.core().actions.drain().await;
            Err(InterpreterError::Cancelled {
                trace: interpreter.core().trace.clone(),
                cause,
            })
        }
    }
}

/// State shared by every interpreter kind.
pub(crate) struct InterpreterCore<C> {
    pub(crate) module: Arc<Module>,
    pub(crate) trace: ExecutionTrace,
    pub(crate) requested_out_ports: PortSet,
    pub(crate) recomputed_in_ports: PortSet,
    pub(crate) context: Arc<RuntimeContext>,
    pub(crate) actions: Actions<C>,
    parent: ParentLink,
    // one virtual action per requested out-port not signalled yet
    pending_out_ports: HashMap<usize, ActionToken>,
}

impl<C: Send + 'static> InterpreterCore<C> {
    pub(crate) fn new(params: InterpreterParams) -> Self {
        let mut actions = Actions::new();
        let pending_out_ports = params
            .requested_out_ports
            .iter()
            .map(|out_port| {
                let name = port_name(&params.module.out_ports, out_port);
                (out_port, actions.start(format!("signal out-port '{}'", name)))
            })
            .collect();

        Self {
            module: params.module,
            trace: params.trace,
            requested_out_ports: params.requested_out_ports,
            recomputed_in_ports: params.recomputed_in_ports,
            context: params.context,
            actions,
            parent: params.parent,
            pending_out_ports,
        }
    }

    pub(crate) fn in_port_name(&self, in_port: usize) -> &str {
        port_name(&self.module.in_ports, in_port)
    }

    pub(crate) fn out_port_name(&self, out_port: usize) -> &str {
        port_name(&self.module.out_ports, out_port)
    }

    pub(crate) fn in_port_trace(&self, in_port: usize) -> ExecutionTrace {
        self.trace.in_port(self.in_port_name(in_port))
    }

    pub(crate) fn out_port_trace(&self, out_port: usize) -> ExecutionTrace {
        self.trace.out_port(self.out_port_name(out_port))
    }

    pub(crate) fn check_in_port(&self, in_port: usize) -> Result<()> {
        if in_port < self.module.in_ports.len() {
            Ok(())
        } else {
            Err(InterpreterError::InvalidArgument {
                trace: self.trace.clone(),
                message: format!(
                    "in-port {} out of range, module has {} in-ports",
                    in_port,
                    self.module.in_ports.len()
                ),
            })
        }
    }

    /// Tell the parent that a requested out-port has its value.
    pub(crate) fn report_out_port(&mut self, out_port: usize) {
        match self.pending_out_ports.remove(&out_port) {
            Some(token) => {
                self.actions.end(token);
                debug!(out_port = %self.out_port_name(out_port), "Out-port has signal");
                self.parent.out_port_has_signal(out_port);
            }
            None => warn!(
                out_port,
                "Ignoring signal for an out-port that is not pending"
            ),
        }
    }
}

fn port_name(ports: &[cloudkeeper_model::Port], index: usize) -> &str {
    ports.get(index).map(|p| p.name.as_str()).unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FunctionExecutor;
    use crate::staging::{InMemoryStagingArea, StagingArea};
    use cloudkeeper_model::{Connection, Endpoint};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn adder() -> Declaration {
        Declaration::simple("add", &["a", "b"], &["sum"])
    }

    fn context(staging: Arc<InMemoryStagingArea>) -> Arc<RuntimeContext> {
        let executor = FunctionExecutor::new().with("add", |inputs| {
            let a = inputs["a"].as_i64().unwrap_or(0);
            let b = inputs["b"].as_i64().unwrap_or(0);
            Ok(BTreeMap::from([("sum".to_string(), json!(a + b))]))
        });
        Arc::new(RuntimeContext::new(
            staging,
            Arc::new(executor),
            Arc::new(Repository::new().with(adder())),
        ))
    }

    fn params(
        module: Module,
        requested: &[usize],
        recomputed: &[usize],
        context: Arc<RuntimeContext>,
    ) -> (InterpreterParams, UnboundedReceiver<InterpreterMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let params = InterpreterParams {
            module: Arc::new(module),
            trace: ExecutionTrace::root(),
            requested_out_ports: requested.iter().copied().collect(),
            recomputed_in_ports: recomputed.iter().copied().collect(),
            context,
            parent: ParentLink::new(tx, 0),
        };
        (params, rx)
    }

    #[test]
    fn test_resolve_behaviors() {
        let repository = Repository::new().with(adder());
        let proxy = Module::proxy("sum", &adder());
        assert!(matches!(
            Behavior::resolve(&proxy, &repository),
            Ok(Behavior::Simple { declaration }) if declaration.name == "add"
        ));

        let input = Module::input("five", json!(5));
        assert!(matches!(
            Behavior::resolve(&input, &repository),
            Ok(Behavior::Input { value }) if value == json!(5)
        ));

        let dangling = Module::proxy("other", &Declaration::simple("missing", &[], &[]));
        assert_eq!(
            Behavior::resolve(&dangling, &repository).unwrap_err(),
            ModelError::UnknownDeclaration("missing".to_string())
        );
    }

    #[tokio::test]
    async fn test_input_module_stores_value_and_signals() {
        let staging = Arc::new(InMemoryStagingArea::new());
        let module = Module::input("five", json!(5));
        let behavior = Behavior::resolve(&module, &Repository::new()).unwrap();
        let (params, mut parent) = params(module, &[0], &[], context(staging.clone()));

        let (_mailbox, future) = spawn_interpreter(params, behavior);
        future.await.unwrap();

        assert_eq!(
            parent.recv().await,
            Some(InterpreterMessage::SubmoduleOutPortHasSignal {
                child: 0,
                out_port: 0
            })
        );
        assert_eq!(
            staging
                .value(&ExecutionTrace::root().out_port("value"))
                .await,
            Some(json!(5))
        );
    }

    #[tokio::test]
    async fn test_simple_module_waits_for_recomputed_in_ports() {
        let staging = Arc::new(InMemoryStagingArea::new());
        let root = ExecutionTrace::root();
        staging.insert(root.in_port("a"), json!(2)).await;
        let module = Module::proxy("sum", &adder());
        let context = context(staging.clone());
        let behavior = Behavior::resolve(&module, &context.repository).unwrap();
        let (params, mut parent) = params(module, &[0], &[1], context);

        let (mailbox, future) = spawn_interpreter(params, behavior);
        let handle = tokio::spawn(future);

        staging.insert(root.in_port("b"), json!(3)).await;
        mailbox
            .send(InterpreterMessage::InPortHasSignal { in_port: 1 })
            .unwrap();
        handle.await.unwrap().unwrap();

        assert!(matches!(
            parent.recv().await,
            Some(InterpreterMessage::SubmoduleOutPortHasSignal { out_port: 0, .. })
        ));
        assert_eq!(
            staging.get(&root.out_port("sum")).await.unwrap(),
            json!(5)
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_interpreter() {
        let staging = Arc::new(InMemoryStagingArea::new());
        let module = Module::composite(
            "wrapper",
            &["x"],
            &["y"],
            Body::new(
                vec![Module::proxy("sum", &adder())],
                vec![
                    Connection::new(Endpoint::InPort(0), Endpoint::ChildIn { child: 0, port: 0 }),
                    Connection::new(Endpoint::InPort(0), Endpoint::ChildIn { child: 0, port: 1 }),
                    Connection::new(Endpoint::ChildOut { child: 0, port: 0 }, Endpoint::OutPort(0)),
                ],
            ),
        );
        let context = context(staging);
        let behavior = Behavior::resolve(&module, &context.repository).unwrap();
        let (params, _parent) = params(module, &[0], &[0], context);

        let (mailbox, future) = spawn_interpreter(params, behavior);
        let handle = tokio::spawn(future);
        mailbox
            .send(InterpreterMessage::Cancel {
                cause: "test".to_string(),
            })
            .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, InterpreterError::Cancelled { ref cause, .. } if cause == "test"));
    }
}
