//! The `Agent` leaf: run an LLM adapter to completion, persist the outcome.
//!
//! The final result lands under a stable content-addressed state key, so a
//! re-mounted tree (same prompt, same model) resolves from the store instead
//! of invoking the adapter a second time.

use std::rc::Rc;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::while_loop::LoopContext;
use crate::engine::{Engine, Thunk};
use crate::errors::{EngineError, RenderError};
use crate::scope::ExecScope;
use crate::tree::{Component, Element, HostElement, RenderCtx};
use smithers_common::{AgentOutcome, AgentProgress, AgentRequest};

/// The `Agent` element.
pub struct Agent {
    prompt: String,
    adapter: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    max_turns: Option<u32>,
    on_finished: Option<Rc<dyn Fn(&AgentOutcome)>>,
    on_error: Option<Rc<dyn Fn(&str)>>,
    on_progress: Option<Rc<dyn Fn(&str)>>,
    on_tool_call: Option<Rc<dyn Fn(&str, &Value)>>,
}

impl Agent {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            adapter: None,
            model: None,
            system_prompt: None,
            max_turns: None,
            on_finished: None,
            on_error: None,
            on_progress: None,
            on_tool_call: None,
        }
    }

    /// Name of a registered adapter; `default` when not set.
    pub fn adapter(mut self, name: impl Into<String>) -> Self {
        self.adapter = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn on_finished(mut self, f: impl Fn(&AgentOutcome) + 'static) -> Self {
        self.on_finished = Some(Rc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + 'static) -> Self {
        self.on_error = Some(Rc::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(&str) + 'static) -> Self {
        self.on_progress = Some(Rc::new(f));
        self
    }

    pub fn on_tool_call(mut self, f: impl Fn(&str, &Value) + 'static) -> Self {
        self.on_tool_call = Some(Rc::new(f));
        self
    }

    pub fn into_element(self) -> Element {
        Element::component(self)
    }

    /// Stable key the outcome persists under.
    fn result_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.prompt.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.model.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.system_prompt.as_deref().unwrap_or("").as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        format!("agent:result:{}", hex)
    }
}

#[derive(Clone, Default, PartialEq)]
struct AgentState {
    started: bool,
    done: bool,
    errored: bool,
}

impl Component for Agent {
    fn type_name(&self) -> &'static str {
        "Agent"
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let env = cx.env();
        let adapter = env.options.agent(self.adapter.as_deref()).ok_or_else(|| {
            RenderError::author(
                "Agent",
                format!(
                    "no agent adapter registered under '{}'",
                    self.adapter.as_deref().unwrap_or("default")
                ),
            )
        })?;
        let scope = cx
            .use_context::<ExecScope>()
            .map(|s| *s)
            .unwrap_or_default();
        let iteration = cx
            .use_context::<LoopContext>()
            .map(|l| l.iteration)
            .unwrap_or(0);

        let (state, set_state) = cx.use_state(AgentState::default);
        let result_key = self.result_key();

        {
            let env = env.clone();
            let set_state = set_state.clone();
            let result_key = result_key.clone();
            let request = AgentRequest {
                prompt: self.prompt.clone(),
                model: self.model.clone(),
                system_prompt: self.system_prompt.clone(),
                max_turns: self.max_turns,
            };
            let task_name = self
                .model
                .clone()
                .unwrap_or_else(|| "agent".to_string());
            let on_finished = self.on_finished.clone();
            let on_error = self.on_error.clone();
            let on_progress = self.on_progress.clone();
            let on_tool_call = self.on_tool_call.clone();
            let scope_id = scope.scope_id;
            let fire = scope.enabled && !state.started;
            cx.use_effect(json!([scope.enabled, state.started]), move || {
                if !fire {
                    return;
                }
                let task_id = match env
                    .store
                    .tasks()
                    .start("agent", &task_name, iteration, scope_id)
                {
                    Ok(id) => id,
                    Err(err) => {
                        env.report(EngineError::Store(err));
                        return;
                    }
                };
                set_state.set(AgentState {
                    started: true,
                    ..AgentState::default()
                });

                // Resume path: a persisted outcome resolves the element
                // without re-invoking the adapter.
                match env.store.state().get::<AgentOutcome>(&result_key) {
                    Ok(Some(outcome)) => {
                        debug!(key = %result_key, "agent outcome resumed from store");
                        if let Err(err) = env.store.tasks().complete(&task_id) {
                            env.report(EngineError::Store(err));
                        }
                        if let Some(on_finished) = &on_finished {
                            on_finished(&outcome);
                        }
                        set_state.set(AgentState {
                            started: true,
                            done: true,
                            errored: false,
                        });
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        env.report(EngineError::Store(err));
                    }
                }

                // Progress events hop back to the control thread as thunks.
                let progress_handle = env.handle.clone();
                let progress_cb = on_progress.clone();
                let tool_cb = on_tool_call.clone();
                let progress: smithers_common::ProgressFn = Rc::new(move |event| {
                    let progress_cb = progress_cb.clone();
                    let tool_cb = tool_cb.clone();
                    progress_handle.defer(move |_| match event {
                        AgentProgress::Text(text) => {
                            if let Some(cb) = &progress_cb {
                                cb(&text);
                            }
                        }
                        AgentProgress::ToolCall { name, input } => {
                            if let Some(cb) = &tool_cb {
                                cb(&name, &input);
                            }
                        }
                    });
                });

                let env2 = env.clone();
                let adapter = Rc::clone(&adapter);
                env.handle.spawn(async move {
                    let outcome = adapter.run(request, progress).await;
                    Box::new(move |_: &mut Engine| match outcome {
                        Ok(outcome) => {
                            if !env2.store.is_closed() {
                                if let Err(err) = env2.store.state().set(
                                    &result_key,
                                    &outcome,
                                    "agent finished",
                                ) {
                                    env2.report(EngineError::Store(err));
                                }
                                if let Err(err) = env2.store.tasks().complete(&task_id) {
                                    env2.report(EngineError::Store(err));
                                }
                            }
                            if let Some(on_finished) = &on_finished {
                                on_finished(&outcome);
                            }
                            set_state.set(AgentState {
                                started: true,
                                done: true,
                                errored: false,
                            });
                        }
                        Err(err) => {
                            let message = err.to_string();
                            if !env2.store.is_closed() {
                                if let Err(err) = env2.store.tasks().fail(&task_id) {
                                    env2.report(EngineError::Store(err));
                                }
                            }
                            env2.report(EngineError::Adapter {
                                element: "Agent",
                                message: message.clone(),
                            });
                            if let Some(on_error) = &on_error {
                                on_error(&message);
                            }
                            set_state.set(AgentState {
                                started: true,
                                done: true,
                                errored: true,
                            });
                        }
                    }) as Thunk
                });
            });
        }

        let status = if state.errored {
            "failed"
        } else if state.done {
            "completed"
        } else if state.started {
            "running"
        } else {
            "pending"
        };

        let mut host = HostElement::new("agent").attr("status", status);
        if let Some(model) = &self.model {
            host = host.attr("model", model.clone());
        }
        Ok(host.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_key_is_stable_per_invocation() {
        let a = Agent::new("fix the bug").model("opus").result_key();
        let b = Agent::new("fix the bug").model("opus").result_key();
        assert_eq!(a, b);
        assert!(a.starts_with("agent:result:"));
    }

    #[test]
    fn result_key_varies_with_prompt_and_model() {
        let base = Agent::new("fix the bug").model("opus").result_key();
        assert_ne!(Agent::new("fix the bug").model("sonnet").result_key(), base);
        assert_ne!(Agent::new("write docs").model("opus").result_key(), base);
    }
}
