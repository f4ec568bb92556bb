//! Agent adapter that drives the Claude CLI in stream-json mode.
//!
//! The prompt goes to the child's stdin; stdout is a stream of JSON events
//! (assistant content blocks, tool uses, a final result). Progress events
//! are forwarded as they arrive; the final result text is the outcome.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use smithers_common::{
    AdapterError, AgentAdapter, AgentOutcome, AgentProgress, AgentRequest, ProgressFn, ToolCall,
};

/// Events from the CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        subtype: String,
    },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },
}

/// Spawns the Claude CLI per invocation.
pub struct ClaudeCliAgent {
    command: String,
    skip_permissions: bool,
}

impl ClaudeCliAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            skip_permissions: true,
        }
    }

    pub fn with_permission_prompts(mut self) -> Self {
        self.skip_permissions = false;
        self
    }

    fn flags(&self, req: &AgentRequest) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        if let Some(model) = &req.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        if let Some(system) = &req.system_prompt {
            flags.push("--append-system-prompt".to_string());
            flags.push(system.clone());
        }
        if let Some(turns) = req.max_turns {
            flags.push("--max-turns".to_string());
            flags.push(turns.to_string());
        }
        flags
    }
}

impl Default for ClaudeCliAgent {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[async_trait(?Send)]
impl AgentAdapter for ClaudeCliAgent {
    async fn run(
        &self,
        req: AgentRequest,
        progress: ProgressFn,
    ) -> Result<AgentOutcome, AdapterError> {
        let start = Instant::now();
        let mut child = Command::new(&self.command)
            .args(self.flags(&req))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(AdapterError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(req.prompt.as_bytes())
                .await
                .map_err(AdapterError::Spawn)?;
            stdin.shutdown().await.map_err(AdapterError::Spawn)?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Protocol("no stdout from agent process".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut is_error = false;
        let mut tool_calls = Vec::new();

        while let Some(line) = lines.next_line().await.map_err(AdapterError::Spawn)? {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::Assistant { message }) => {
                    for block in message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                progress(AgentProgress::Text(text.clone()));
                                accumulated.push_str(&text);
                                accumulated.push('\n');
                            }
                            ContentBlock::ToolUse { name, input } => {
                                progress(AgentProgress::ToolCall {
                                    name: name.clone(),
                                    input: input.clone(),
                                });
                                tool_calls.push(ToolCall { name, input });
                            }
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    result,
                    is_error: err,
                    subtype,
                }) => {
                    debug!(subtype = %subtype, is_error = err, "agent result event");
                    final_result = result;
                    is_error = err;
                }
                Ok(StreamEvent::User {}) | Ok(StreamEvent::System { .. }) => {}
                Err(_) => {
                    // Not an event; keep raw output for the transcript.
                    accumulated.push_str(&line);
                    accumulated.push('\n');
                }
            }
        }

        let status = child.wait().await.map_err(AdapterError::Spawn)?;
        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!(exit_code, "agent process exited non-zero");
            return Err(AdapterError::Protocol(format!(
                "agent process exited with code {}",
                exit_code
            )));
        }
        if is_error {
            return Err(AdapterError::Protocol(
                final_result.unwrap_or_else(|| "agent reported an error".to_string()),
            ));
        }

        Ok(AgentOutcome {
            output: final_result.unwrap_or(accumulated),
            stop_reason: Some("end_turn".to_string()),
            tokens_used: None,
            duration_ms: start.elapsed().as_millis() as u64,
            tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_tool_use_event() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/x"}}]}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::Assistant { message } => match &message.content[0] {
                ContentBlock::ToolUse { name, .. } => assert_eq!(name, "Read"),
                _ => panic!("expected tool_use"),
            },
            _ => panic!("expected assistant event"),
        }
    }

    #[test]
    fn parses_result_event() {
        let json = r#"{"type":"result","subtype":"success","result":"done","is_error":false}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::Result {
                result, is_error, ..
            } => {
                assert_eq!(result.as_deref(), Some("done"));
                assert!(!is_error);
            }
            _ => panic!("expected result event"),
        }
    }

    #[test]
    fn model_and_turn_flags_are_passed_through() {
        let agent = ClaudeCliAgent::new("claude");
        let req = AgentRequest {
            prompt: "hi".into(),
            model: Some("opus".into()),
            max_turns: Some(3),
            ..Default::default()
        };
        let flags = agent.flags(&req);
        assert!(flags.contains(&"--model".to_string()));
        assert!(flags.contains(&"opus".to_string()));
        assert!(flags.contains(&"--max-turns".to_string()));
        assert!(flags.contains(&"3".to_string()));
    }
}
