//! Deterministic agent adapter for tests and dry runs: returns queued
//! outcomes in order, optionally emitting scripted progress first.

use std::cell::RefCell;
use std::collections::VecDeque;

use async_trait::async_trait;

use smithers_common::{
    AdapterError, AgentAdapter, AgentOutcome, AgentProgress, AgentRequest, ProgressFn,
};

enum ScriptEntry {
    Outcome(AgentOutcome),
    Error(String),
}

/// Queue-driven agent double. Each `run` pops the next entry; an empty
/// queue echoes the prompt back, which is enough for most workflow tests.
pub struct ScriptedAgent {
    entries: RefCell<VecDeque<ScriptEntry>>,
    calls: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(VecDeque::new()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn with_output(self, output: impl Into<String>) -> Self {
        self.entries
            .borrow_mut()
            .push_back(ScriptEntry::Outcome(AgentOutcome {
                output: output.into(),
                stop_reason: Some("end_turn".to_string()),
                ..AgentOutcome::default()
            }));
        self
    }

    pub fn with_outcome(self, outcome: AgentOutcome) -> Self {
        self.entries
            .borrow_mut()
            .push_back(ScriptEntry::Outcome(outcome));
        self
    }

    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.entries
            .borrow_mut()
            .push_back(ScriptEntry::Error(message.into()));
        self
    }

    /// Requests observed so far, in call order.
    pub fn calls(&self) -> Vec<AgentRequest> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl AgentAdapter for ScriptedAgent {
    async fn run(
        &self,
        req: AgentRequest,
        progress: ProgressFn,
    ) -> Result<AgentOutcome, AdapterError> {
        self.calls.borrow_mut().push(req.clone());
        // Yield once so completion goes through the engine loop like a real
        // adapter's would.
        tokio::task::yield_now().await;

        let entry = self.entries.borrow_mut().pop_front();
        match entry {
            Some(ScriptEntry::Outcome(outcome)) => {
                progress(AgentProgress::Text(outcome.output.clone()));
                Ok(outcome)
            }
            Some(ScriptEntry::Error(message)) => Err(AdapterError::Protocol(message)),
            None => Ok(AgentOutcome {
                output: format!("echo: {}", req.prompt),
                stop_reason: Some("end_turn".to_string()),
                ..AgentOutcome::default()
            }),
        }
    }
}
