//! The human approval gate: suspends a subtree until an external writer
//! resolves the interaction row.
//!
//! Identity is durable: an explicit id maps to `human:<id>`, otherwise a
//! FNV-1a hash of the message and children maps to `human:content:<hash>`.
//! Re-mounting against an existing entry creates no second row; the
//! surviving blocking task is adopted into the current scope instead, so a
//! restarted process keeps gating on the same pending approval.

use std::rc::Rc;

use serde_json::{Value, json};
use tracing::debug;

use super::keys;
use super::while_loop::LoopContext;
use super::{state_cell_string};
use crate::errors::{EngineError, RenderError};
use crate::scope::ExecScope;
use crate::tree::element::canonical_attr;
use crate::tree::{Component, Element, HostElement, RenderCtx};
use smithers_common::HumanStatus;

const DEFAULT_PROMPT: &str = "Approve to continue";

/// The `Human` element.
pub struct Human {
    id: Option<String>,
    message: Option<String>,
    on_approve: Option<Rc<dyn Fn(Option<&Value>)>>,
    on_reject: Option<Rc<dyn Fn(Option<&Value>)>>,
    children: Vec<Element>,
}

impl Human {
    pub fn new() -> Self {
        Self {
            id: None,
            message: None,
            on_approve: None,
            on_reject: None,
            children: Vec::new(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn on_approve(mut self, f: impl Fn(Option<&Value>) + 'static) -> Self {
        self.on_approve = Some(Rc::new(f));
        self
    }

    pub fn on_reject(mut self, f: impl Fn(Option<&Value>) + 'static) -> Self {
        self.on_reject = Some(Rc::new(f));
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: Vec<Element>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn into_element(self) -> Element {
        Element::component(self)
    }

    /// Durable identity key for this gate.
    fn state_key(&self) -> String {
        match &self.id {
            Some(id) => keys::human(id),
            None => {
                let mut content = self.message.clone().unwrap_or_default();
                for child in &self.children {
                    describe_element(child, &mut content);
                }
                keys::human_content(&fnv1a_hex(content.as_bytes()))
            }
        }
    }
}

impl Default for Human {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Default, PartialEq)]
struct GateState {
    initialized: bool,
    row_id: Option<String>,
    task_id: Option<String>,
    resolved: bool,
}

impl Component for Human {
    fn type_name(&self) -> &'static str {
        "Human"
    }

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        if self.id.is_none() && self.message.is_none() && self.children.is_empty() {
            return Err(RenderError::author(
                "Human",
                "requires an id, a message, or children",
            ));
        }
        let env = cx.env();
        let scope = cx
            .use_context::<ExecScope>()
            .map(|s| *s)
            .unwrap_or_default();
        let iteration = cx
            .use_context::<LoopContext>()
            .map(|l| l.iteration)
            .unwrap_or(0);
        let state_key = self.state_key();

        let (gate, set_gate) = cx.use_state(GateState::default);

        // The row id is itself durable state; watching it keeps this node
        // rendering with the persisted identity after a restart.
        let key_rows = cx.use_subscription(
            "SELECT value FROM state WHERE key = ?1",
            vec![json!(state_key)],
        )?;
        let row_id = state_cell_string(&key_rows).or_else(|| gate.row_id.clone());

        let row_param = row_id.clone().unwrap_or_default();
        let status_rows = cx.use_subscription_opt(
            "SELECT status, response FROM human_interactions WHERE id = ?1",
            vec![json!(row_param)],
            row_id.is_none(),
        )?;
        let status = status_rows
            .first()
            .and_then(|r| r.get("status"))
            .and_then(|v| v.as_str())
            .and_then(HumanStatus::parse);
        let response: Option<Value> = status_rows
            .first()
            .and_then(|r| r.get("response"))
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str(s).ok());

        // Create-or-resume, gated on an enabled scope.
        {
            let env = env.clone();
            let set_gate = set_gate.clone();
            let state_key = state_key.clone();
            let prompt = self
                .message
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string());
            let scope_id = scope.scope_id;
            let fire = scope.enabled && !gate.initialized;
            cx.use_effect(json!([scope.enabled, gate.initialized]), move || {
                if !fire {
                    return;
                }
                let existing = match env.store.state().get::<String>(&state_key) {
                    Ok(existing) => existing,
                    Err(err) => {
                        env.report(EngineError::Store(err));
                        return;
                    }
                };
                let (row_id, task_id, already_resolved) = match existing {
                    None => {
                        let row_id = match env.store.human().create("confirmation", &prompt) {
                            Ok(id) => id,
                            Err(err) => {
                                env.report(EngineError::Store(err));
                                return;
                            }
                        };
                        if let Err(err) =
                            env.store
                                .state()
                                .set(&state_key, &row_id, "human gate created")
                        {
                            env.report(EngineError::Store(err));
                        }
                        let task_id = env
                            .store
                            .tasks()
                            .start("human_interaction", &state_key, iteration, scope_id)
                            .map_err(|err| env.report(EngineError::Store(err)))
                            .ok();
                        debug!(key = %state_key, row = %row_id, "human gate created");
                        (Some(row_id), task_id, false)
                    }
                    Some(row_id) => {
                        // Resume: no duplicate row. Re-adopt the surviving
                        // blocking task; if it was already terminal and the
                        // row is still pending, open a fresh one so the
                        // enclosing step keeps waiting.
                        let adopted = env
                            .store
                            .tasks()
                            .adopt(&state_key, iteration, scope_id)
                            .unwrap_or(None);
                        let still_pending = matches!(
                            env.store.human().get(&row_id),
                            Ok(Some(row)) if row.status == "pending"
                        );
                        let task_id = match (adopted, still_pending) {
                            (Some(task), _) => Some(task),
                            (None, true) => env
                                .store
                                .tasks()
                                .start("human_interaction", &state_key, iteration, scope_id)
                                .ok(),
                            (None, false) => None,
                        };
                        debug!(key = %state_key, row = %row_id, "human gate resumed");
                        // A row resolved before this process started does not
                        // re-fire callbacks; it only unblocks the subtree.
                        (Some(row_id), task_id, !still_pending)
                    }
                };
                set_gate.set(GateState {
                    initialized: true,
                    row_id,
                    task_id,
                    resolved: already_resolved,
                });
            });
        }

        // Resolution: fire the matching callback once and release the task.
        let resolved_status = status.filter(|s| s.is_resolved());
        {
            let env = env.clone();
            let gate_now = gate.clone();
            let set_gate = set_gate.clone();
            let on_approve = self.on_approve.clone();
            let on_reject = self.on_reject.clone();
            let response = response.clone();
            let fire = gate.initialized && !gate.resolved && resolved_status.is_some();
            cx.use_effect(
                json!([resolved_status.map(|s| s.as_str()), gate.initialized, gate.resolved]),
                move || {
                    let Some(status) = resolved_status else {
                        return;
                    };
                    if !fire {
                        return;
                    }
                    if let Some(task_id) = &gate_now.task_id {
                        if let Err(err) = env.store.tasks().complete(task_id) {
                            env.report(EngineError::Store(err));
                        }
                    }
                    match status {
                        HumanStatus::Approved => {
                            if let Some(on_approve) = &on_approve {
                                on_approve(response.as_ref());
                            }
                        }
                        HumanStatus::Rejected => {
                            if let Some(on_reject) = &on_reject {
                                on_reject(response.as_ref());
                            }
                        }
                        // Cancellation resolves nothing but stops blocking.
                        HumanStatus::Cancelled | HumanStatus::Pending => {}
                    }
                    set_gate.set(GateState {
                        resolved: true,
                        ..gate_now.clone()
                    });
                },
            );
        }

        // Graceful unmount releases the blocking task; a killed process
        // leaves it running on purpose, to survive into the next run.
        {
            let env = env.clone();
            let task_id = gate.task_id.clone();
            let live = gate.initialized && !gate.resolved;
            cx.use_unmount(move || {
                if !live {
                    return;
                }
                if let Some(task_id) = task_id {
                    if !env.store.is_closed() {
                        if let Err(err) = env.store.tasks().complete(&task_id) {
                            env.report(EngineError::Store(err));
                        }
                    }
                }
            });
        }

        let status_attr = status.map(|s| s.as_str()).unwrap_or("pending");
        let mut host = HostElement::new("human")
            .attr("key", state_key)
            .attr("status", status_attr);
        if status == Some(HumanStatus::Approved) {
            host = host.children(self.children.clone());
        }
        Ok(host.into())
    }
}

/// FNV-1a, 64-bit, lowercase hex. The exact algorithm is part of the
/// durable identity contract for content-addressed gates.
pub(crate) fn fnv1a_hex(bytes: &[u8]) -> String {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    format!("{:016x}", hash)
}

/// Stable textual description of an element subtree, used for the content
/// hash. Components contribute their type name and key; hosts their tag,
/// attributes, and children; text its value.
fn describe_element(el: &Element, out: &mut String) {
    match el {
        Element::Component(c) => {
            out.push('<');
            out.push_str(c.type_name());
            if let Some(key) = c.key() {
                out.push(' ');
                out.push_str(key);
            }
            out.push('>');
        }
        Element::Host(host) => {
            out.push('<');
            out.push_str(&host.tag);
            for (name, value) in &host.attrs {
                out.push(' ');
                out.push_str(name);
                out.push('=');
                out.push_str(&canonical_attr(value));
            }
            out.push('>');
            for child in &host.children {
                describe_element(child, out);
            }
        }
        Element::Text(text) => out.push_str(text),
        Element::Fragment(children) => {
            for child in children {
                describe_element(child, out);
            }
        }
        Element::Empty => out.push_str("()"),
    }
}
