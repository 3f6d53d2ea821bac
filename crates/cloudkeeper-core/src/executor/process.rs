// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process executor.
//!
//! Runs each simple declaration as an external command. The in-port values are
//! written to the command's stdin as one JSON object keyed by port name; the
//! command must print a JSON object of out-port values to stdout and exit with
//! status 0. The process is killed when execution is cancelled.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::traits::*;

/// Executor that runs one command per simple declaration.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    commands: HashMap<String, Vec<String>>,
}

impl ProcessExecutor {
    /// Create an executor without commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an executor from a map of declaration name to program and arguments.
    pub fn from_commands(commands: HashMap<String, Vec<String>>) -> Self {
        Self { commands }
    }

    /// Register the command (program followed by arguments) of a declaration.
    pub fn with_command(mut self, declaration: impl Into<String>, command: Vec<String>) -> Self {
        self.commands.insert(declaration.into(), command);
        self
    }

    fn command(&self, declaration: &str) -> Result<Command> {
        let (program, args) = self
            .commands
            .get(declaration)
            .and_then(|argv| argv.split_first())
            .ok_or_else(|| ExecutorError::UnknownDeclaration(declaration.to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn executor_type(&self) -> &'static str {
        "process"
    }

    async fn execute(
        &self,
        request: SimpleModuleRequest,
        cancel: CancellationToken,
    ) -> Result<BTreeMap<String, Value>> {
        let mut child = self.command(&request.declaration)?.spawn()?;
        debug!(
            trace = %request.trace,
            declaration = %request.declaration,
            pid = ?child.id(),
            "Process spawned"
        );

        let input = serde_json::to_vec(&request.inputs)?;
        let stdin = child.stdin.take();
        // The command may fill stdout before it has read all of its input
        let write_input = async move {
            if let Some(mut stdin) = stdin {
                // A command that exits without reading its input is not an error here
                match stdin.write_all(&input).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };

        // Dropping the wait future drops the child, which kills it (kill_on_drop)
        let ((), output) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(trace = %request.trace, "Execution cancelled, killing process");
                return Err(ExecutorError::Cancelled);
            }
            result = async { tokio::try_join!(write_input, child.wait_with_output()) } => result?,
        };

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(trace = %request.trace, exit_code, stderr = %stderr, "Process failed");
            return Err(ExecutorError::ExitCode { exit_code, stderr });
        }

        let outputs = match serde_json::from_slice::<Value>(&output.stdout)? {
            Value::Object(map) => map.into_iter().collect(),
            other => {
                return Err(ExecutorError::InvalidOutput(format!(
                    "expected a JSON object, got {}",
                    other
                )));
            }
        };
        info!(trace = %request.trace, "Process completed successfully");
        Ok(outputs)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use cloudkeeper_model::ExecutionTrace;
    use serde_json::json;
    use std::time::Duration;

    fn request(declaration: &str) -> SimpleModuleRequest {
        SimpleModuleRequest {
            trace: ExecutionTrace::root().child("m"),
            declaration: declaration.to_string(),
            inputs: BTreeMap::from([("x".to_string(), json!(7))]),
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_echoes_inputs_as_outputs() {
        let executor = ProcessExecutor::new().with_command("echo", vec!["cat".to_string()]);
        let outputs = executor
            .execute(request("echo"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs, BTreeMap::from([("x".to_string(), json!(7))]));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let executor = ProcessExecutor::new().with_command("fail", sh("echo boom >&2; exit 3"));
        let err = executor
            .execute(request("fail"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::ExitCode { exit_code: 3, ref stderr } if stderr == "boom"
        ));
    }

    #[tokio::test]
    async fn test_output_must_be_an_object() {
        let executor = ProcessExecutor::new().with_command("list", sh("cat >/dev/null; echo '[1]'"));
        let err = executor
            .execute(request("list"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let executor = ProcessExecutor::new().with_command("sleep", sh("sleep 30"));
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let err = executor.execute(request("sleep"), token).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_large_input_is_streamed_while_output_is_read() {
        let executor = ProcessExecutor::new().with_command("echo", vec!["cat".to_string()]);
        let text = "a".repeat(1 << 20);
        let request = SimpleModuleRequest {
            inputs: BTreeMap::from([("x".to_string(), json!(text))]),
            ..request("echo")
        };

        let outputs = tokio::time::timeout(
            Duration::from_secs(10),
            executor.execute(request, CancellationToken::new()),
        )
        .await
        .expect("process finished in time")
        .unwrap();
        assert_eq!(outputs["x"].as_str().map(str::len), Some(1 << 20));
    }

    #[tokio::test]
    async fn test_cancel_while_input_is_blocked() {
        // Never reads stdin, so the write stalls once the pipe buffer is full
        let executor = ProcessExecutor::new().with_command("deaf", sh("sleep 30"));
        let request = SimpleModuleRequest {
            inputs: BTreeMap::from([("x".to_string(), json!("b".repeat(1 << 20)))]),
            ..request("deaf")
        };
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(10), executor.execute(request, token))
            .await
            .expect("cancel observed in time")
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_declaration() {
        let err = ProcessExecutor::new()
            .execute(request("missing"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownDeclaration(_)));
    }
}
