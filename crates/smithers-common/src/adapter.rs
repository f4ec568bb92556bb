//! Adapter contracts consumed by the engine's executor elements.
//!
//! The engine never talks to a shell, an LLM, or a version-control system
//! directly; it goes through these traits. Adapters run inside `spawn_local`
//! futures on the engine's thread, so the traits are `?Send`.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors an adapter can surface to the engine.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("VCS error: {0}")]
    Vcs(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ── Shell ─────────────────────────────────────────────────────────────

/// A command to execute: either a shell line or an argv vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run through `sh -c`.
    Shell(String),
    /// Exec directly, first element is the program.
    Argv(Vec<String>),
}

impl CommandLine {
    /// Human-readable form used for task names and logs.
    pub fn display(&self) -> String {
        match self {
            Self::Shell(s) => s.clone(),
            Self::Argv(parts) => parts.join(" "),
        }
    }
}

/// Request handed to a [`ShellAdapter`].
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: CommandLine,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl ShellRequest {
    pub fn new(command: CommandLine) -> Self {
        Self {
            command,
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }
}

/// Captured outcome of a finished (or killed) command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Executes external commands.
#[async_trait(?Send)]
pub trait ShellAdapter {
    async fn exec(&self, req: ShellRequest) -> Result<CommandResult, AdapterError>;
}

// ── Agent ─────────────────────────────────────────────────────────────

/// Request handed to an [`AgentAdapter`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

/// One tool invocation observed while an agent ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
}

/// Final result of an agent run, persisted under the invocation's state key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// Streamed progress events, forwarded to the element's callbacks.
#[derive(Debug, Clone)]
pub enum AgentProgress {
    /// A chunk of assistant text.
    Text(String),
    /// The agent invoked a tool.
    ToolCall { name: String, input: Value },
}

/// Progress sink handed to an adapter; invoked on the engine thread.
pub type ProgressFn = Rc<dyn Fn(AgentProgress)>;

/// Runs an LLM agent to completion.
#[async_trait(?Send)]
pub trait AgentAdapter {
    async fn run(
        &self,
        req: AgentRequest,
        progress: ProgressFn,
    ) -> Result<AgentOutcome, AdapterError>;
}

// ── Version control ───────────────────────────────────────────────────

/// Identifier of a recorded snapshot or commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    pub change_id: String,
}

/// Records workspace snapshots and commits.
#[async_trait(?Send)]
pub trait VcsAdapter {
    /// Record the current workspace state under a generated message.
    async fn snapshot(&self, description: &str) -> Result<VcsChange, AdapterError>;

    /// Record the current workspace state under the caller's message.
    async fn commit(&self, message: &str) -> Result<VcsChange, AdapterError>;
}
