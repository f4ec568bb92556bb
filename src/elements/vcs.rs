//! `Snapshot` and `Commit` leaves: record workspace state through the VCS
//! adapter and attach the resulting ids to the enclosing step.

use std::rc::Rc;

use serde_json::json;
use tracing::debug;

use super::step::StepVcsSlot;
use super::while_loop::LoopContext;
use crate::engine::{Engine, Thunk};
use crate::errors::{EngineError, RenderError};
use crate::scope::ExecScope;
use crate::tree::{Component, Element, HostElement, RenderCtx};
use smithers_common::VcsChange;

enum VcsKind {
    Snapshot,
    Commit,
}

impl VcsKind {
    fn tag(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Commit => "commit",
        }
    }
}

/// Shared implementation behind `Snapshot` and `Commit`.
struct VcsLeaf {
    kind: VcsKind,
    message: String,
    on_finished: Option<Rc<dyn Fn(&VcsChange)>>,
    on_error: Option<Rc<dyn Fn(&str)>>,
}

/// Record a snapshot of the workspace.
pub struct Snapshot;

impl Snapshot {
    pub fn new(description: impl Into<String>) -> VcsBuilder {
        VcsBuilder(VcsLeaf {
            kind: VcsKind::Snapshot,
            message: description.into(),
            on_finished: None,
            on_error: None,
        })
    }
}

/// Record a commit with the caller's message.
pub struct Commit;

impl Commit {
    pub fn new(message: impl Into<String>) -> VcsBuilder {
        VcsBuilder(VcsLeaf {
            kind: VcsKind::Commit,
            message: message.into(),
            on_finished: None,
            on_error: None,
        })
    }
}

pub struct VcsBuilder(VcsLeaf);

impl VcsBuilder {
    pub fn on_finished(mut self, f: impl Fn(&VcsChange) + 'static) -> Self {
        self.0.on_finished = Some(Rc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + 'static) -> Self {
        self.0.on_error = Some(Rc::new(f));
        self
    }

    pub fn into_element(self) -> Element {
        Element::component(self.0)
    }
}

#[derive(Clone, Default, PartialEq)]
struct VcsState {
    started: bool,
    done: bool,
    change_id: Option<String>,
}

impl Component for VcsLeaf {
    fn type_name(&self) -> &'static str {
        match self.kind {
            VcsKind::Snapshot => "Snapshot",
            VcsKind::Commit => "Commit",
        }
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let env = cx.env();
        let Some(vcs) = env.options.vcs.clone() else {
            return Err(RenderError::author(
                self.type_name(),
                "no VCS adapter configured on the engine",
            ));
        };
        let scope = cx
            .use_context::<ExecScope>()
            .map(|s| *s)
            .unwrap_or_default();
        let iteration = cx
            .use_context::<LoopContext>()
            .map(|l| l.iteration)
            .unwrap_or(0);
        let step_slot = cx.use_context::<StepVcsSlot>();

        let (state, set_state) = cx.use_state(VcsState::default);

        {
            let env = env.clone();
            let set_state = set_state.clone();
            let message = self.message.clone();
            let is_commit = matches!(self.kind, VcsKind::Commit);
            let tag = self.kind.tag();
            let on_finished = self.on_finished.clone();
            let on_error = self.on_error.clone();
            let step_slot = step_slot.clone();
            let scope_id = scope.scope_id;
            let fire = scope.enabled && !state.started;
            cx.use_effect(json!([scope.enabled, state.started]), move || {
                if !fire {
                    return;
                }
                let task_id = match env.store.tasks().start(tag, &message, iteration, scope_id) {
                    Ok(id) => id,
                    Err(err) => {
                        env.report(EngineError::Store(err));
                        return;
                    }
                };
                set_state.set(VcsState {
                    started: true,
                    ..VcsState::default()
                });

                let env2 = env.clone();
                let message2 = message.clone();
                env.handle.spawn(async move {
                    let result = if is_commit {
                        vcs.commit(&message2).await
                    } else {
                        vcs.snapshot(&message2).await
                    };
                    Box::new(move |_: &mut Engine| match result {
                        Ok(change) => {
                            debug!(change = %change.change_id, kind = tag, "vcs event recorded");
                            if !env2.store.is_closed() {
                                if let Err(err) = env2.store.vcs().record(
                                    "git",
                                    change.commit_hash.as_deref(),
                                    Some(&change.change_id),
                                    &message2,
                                ) {
                                    env2.report(EngineError::Store(err));
                                }
                                if let Err(err) = env2.store.tasks().complete(&task_id) {
                                    env2.report(EngineError::Store(err));
                                }
                            }
                            if let Some(slot) = &step_slot {
                                let mut attachments = slot.0.borrow_mut();
                                if is_commit {
                                    attachments.commit = Some(change.change_id.clone());
                                } else {
                                    attachments.snapshot = Some(change.change_id.clone());
                                }
                            }
                            if let Some(on_finished) = &on_finished {
                                on_finished(&change);
                            }
                            set_state.set(VcsState {
                                started: true,
                                done: true,
                                change_id: Some(change.change_id),
                            });
                        }
                        Err(err) => {
                            let text = err.to_string();
                            if !env2.store.is_closed() {
                                if let Err(err) = env2.store.tasks().fail(&task_id) {
                                    env2.report(EngineError::Store(err));
                                }
                            }
                            env2.report(EngineError::Adapter {
                                element: if is_commit { "Commit" } else { "Snapshot" },
                                message: text.clone(),
                            });
                            if let Some(on_error) = &on_error {
                                on_error(&text);
                            }
                            set_state.set(VcsState {
                                started: true,
                                done: true,
                                change_id: None,
                            });
                        }
                    }) as Thunk
                });
            });
        }

        let status = if state.done {
            "completed"
        } else if state.started {
            "running"
        } else {
            "pending"
        };
        let mut host = HostElement::new(self.kind.tag()).attr("status", status);
        if let Some(change_id) = &state.change_id {
            host = host.attr("change", change_id.clone());
        }
        Ok(host.into())
    }
}
