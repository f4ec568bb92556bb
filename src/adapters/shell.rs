//! Shell adapter: spawn a subprocess, capture its output, enforce timeouts.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use smithers_common::{AdapterError, CommandLine, CommandResult, ShellAdapter, ShellRequest};

/// Runs commands through tokio's process support. String commands go
/// through `sh -c`; argv commands exec directly.
pub struct TokioShell;

impl TokioShell {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl ShellAdapter for TokioShell {
    async fn exec(&self, req: ShellRequest) -> Result<CommandResult, AdapterError> {
        let mut command = match &req.command {
            CommandLine::Shell(line) => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(line);
                c
            }
            CommandLine::Argv(argv) => {
                let program = argv
                    .first()
                    .ok_or_else(|| AdapterError::Protocol("empty argv".to_string()))?;
                let mut c = Command::new(program);
                c.args(&argv[1..]);
                c
            }
        };

        if let Some(cwd) = &req.cwd {
            command.current_dir(cwd);
        }
        for (name, value) in &req.env {
            command.env(name, value);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = command.spawn().map_err(AdapterError::Spawn)?;

        match req.timeout {
            Some(limit) => match timeout(limit, child.wait_with_output()).await {
                Ok(output) => {
                    let output = output.map_err(AdapterError::Spawn)?;
                    Ok(to_result(output, start, false))
                }
                Err(_) => {
                    debug!(timeout_ms = limit.as_millis() as u64, "command timed out");
                    // kill_on_drop reaps the child when the future drops.
                    Ok(CommandResult {
                        stdout: String::new(),
                        stderr: format!("timed out after {}ms", limit.as_millis()),
                        exit_code: -1,
                        duration_ms: start.elapsed().as_millis() as u64,
                        timed_out: true,
                    })
                }
            },
            None => {
                let output = child.wait_with_output().await.map_err(AdapterError::Spawn)?;
                Ok(to_result(output, start, false))
            }
        }
    }
}

fn to_result(output: std::process::Output, start: Instant, timed_out: bool) -> CommandResult {
    CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
        duration_ms: start.elapsed().as_millis() as u64,
        timed_out,
    }
}
