// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow runner CLI
//!
//! Runs a workflow bundle to completion, running simple modules as external
//! commands and keeping port values in memory.
//!
//! Usage:
//!
//! ```text
//! cloudkeeper-run --workflow <path> [--output <name>]...
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use cloudkeeper_core::{
    Config, ExecutionEvent, ExecutionParams, InMemoryStagingArea, Master, ProcessExecutor,
    RuntimeContext, StaticContextProvider, StagingArea, WorkflowBundle,
};
use cloudkeeper_model::ExecutionTrace;
use tracing::{error, info, warn};

fn print_usage() {
    eprintln!(
        r#"Usage: cloudkeeper-run [OPTIONS]

Run a workflow bundle and print its outputs as JSON.

OPTIONS:
    --workflow <path>    Path to workflow bundle JSON file (required)
    --output <name>      Root out-port to produce (repeatable, default: all)
    --help               Show this help message

ENVIRONMENT:
    CLOUDKEEPER_CANCEL_GRACE_PERIOD_SECS   Grace period after Ctrl-C (default: 60)
    CLOUDKEEPER_EVENT_CHANNEL_CAPACITY     Event channel capacity (default: 1024)
    RUST_LOG                               Log filter (default: cloudkeeper_core=info)
"#
    );
}

struct Args {
    workflow_path: PathBuf,
    outputs: Vec<String>,
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();

    let mut workflow_path: Option<PathBuf> = None;
    let mut outputs = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--workflow" => {
                i += 1;
                if i >= args.len() {
                    return Err("--workflow requires a path".to_string());
                }
                workflow_path = Some(PathBuf::from(&args[i]));
            }
            "--output" => {
                i += 1;
                if i >= args.len() {
                    return Err("--output requires a port name".to_string());
                }
                outputs.push(args[i].clone());
            }
            arg => {
                return Err(format!("Unknown argument: {}", arg));
            }
        }
        i += 1;
    }

    Ok(Args {
        workflow_path: workflow_path.ok_or("--workflow is required")?,
        outputs,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudkeeper_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}\n", e);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let config = Config::from_env()?;
    let bundle = WorkflowBundle::from_path(&args.workflow_path)?;
    info!(
        workflow = %args.workflow_path.display(),
        module = %bundle.module.name,
        declarations = bundle.declarations.len(),
        "Workflow loaded"
    );

    let staging = Arc::new(InMemoryStagingArea::new());
    let root = ExecutionTrace::root();
    for (name, value) in &bundle.inputs {
        staging.insert(root.in_port(name), value.clone()).await;
    }

    let executor = ProcessExecutor::from_commands(bundle.commands.clone());
    let context = RuntimeContext::new(
        staging.clone(),
        Arc::new(executor),
        Arc::new(bundle.repository()),
    );
    let provider = Arc::new(StaticContextProvider::new(context));

    let master = Master::builder()
        .config(config)
        .context_provider(provider)
        .build()?
        .start()
        .await?;

    let mut params = ExecutionParams::new(Arc::new(bundle.module));
    if !args.outputs.is_empty() {
        params = params.requested_out_ports(args.outputs);
    }

    let mut events = master.subscribe();
    let id = master.create_execution(params).await?;
    master.start_execution(id)?;

    let mut outputs = serde_json::Map::new();
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event? {
                ExecutionEvent::OutputAvailable { execution_id, out_port, trace } if execution_id == id => {
                    let value = staging.get(&trace).await?;
                    outputs.insert(out_port, value);
                }
                ExecutionEvent::ExecutionFinished(outcome) if outcome.execution_id == id => break outcome,
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling execution");
                master.cancel(id, "interrupted")?;
            }
        }
    };

    master.shutdown().await?;

    match outcome.failure {
        None => {
            println!("{}", serde_json::to_string_pretty(&outputs)?);
            Ok(true)
        }
        Some(failure) => {
            error!(code = %failure.code, "{}", failure.message);
            Ok(false)
        }
    }
}
