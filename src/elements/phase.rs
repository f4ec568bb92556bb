//! Named phases inside a loop iteration, advanced by a single cursor.
//!
//! The registry assigns each phase a zero-based index by name and publishes
//! the cursor under the `currentPhaseIndex` state key. A phase renders a
//! placeholder whatever its status; only the active phase's children get an
//! enabled execution scope.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result as AnyResult;
use serde_json::json;
use tracing::debug;

use super::keys;
use super::step::{GroupMonitor, StepRegistry};
use super::while_loop::LoopContext;
use super::{state_cell_u64};
use crate::errors::{EngineError, RenderError};
use crate::scope::ExecScope;
use crate::store::Store;
use crate::tree::{Component, Element, HostElement, RenderCtx};

/// Directory of phases under one loop. Provided by the loop context;
/// indices are assigned by first registration in render order.
pub struct PhaseRegistry {
    store: Rc<Store>,
    names: RefCell<Vec<String>>,
}

impl PhaseRegistry {
    pub fn new(store: Rc<Store>) -> Self {
        Self {
            store,
            names: RefCell::new(Vec::new()),
        }
    }

    /// Index for `name`, assigning the next one on first sight.
    pub fn register(&self, name: &str) -> usize {
        let mut names = self.names.borrow_mut();
        if let Some(index) = names.iter().position(|n| n == name) {
            return index;
        }
        names.push(name.to_string());
        names.len() - 1
    }

    pub fn len(&self) -> usize {
        self.names.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.borrow().is_empty()
    }

    /// Current cursor value; phases before it are completed, the one at it
    /// is active.
    pub fn current_index(&self) -> u64 {
        self.store
            .state()
            .get::<u64>(keys::CURRENT_PHASE_INDEX)
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    /// Move the cursor forward one phase, clamped at the total.
    pub fn advance(&self) -> Result<(), crate::errors::StoreError> {
        let next = (self.current_index() + 1).min(self.len() as u64);
        self.store
            .state()
            .set(keys::CURRENT_PHASE_INDEX, &next, "phase advanced")
    }

    pub fn is_active(&self, index: usize) -> bool {
        index as u64 == self.current_index()
    }

    pub fn is_completed(&self, index: usize) -> bool {
        (index as u64) < self.current_index()
    }
}

/// The `Phase` element.
pub struct Phase {
    name: String,
    skip_if: Option<Rc<dyn Fn() -> AnyResult<bool>>>,
    on_start: Option<Rc<dyn Fn()>>,
    on_complete: Option<Rc<dyn Fn()>>,
    children: Vec<Element>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skip_if: None,
            on_start: None,
            on_complete: None,
            children: Vec::new(),
        }
    }

    pub fn skip_if(mut self, f: impl Fn() -> AnyResult<bool> + 'static) -> Self {
        self.skip_if = Some(Rc::new(f));
        self
    }

    pub fn on_start(mut self, f: impl Fn() + 'static) -> Self {
        self.on_start = Some(Rc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + 'static) -> Self {
        self.on_complete = Some(Rc::new(f));
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
}

impl Component for Phase {
    fn type_name(&self) -> &'static str {
        "Phase"
    }

    fn key(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let env = cx.env();
        let registry = cx
            .use_context::<PhaseRegistry>()
            .ok_or_else(|| RenderError::author("Phase", "must be rendered inside a loop"))?;
        let loop_ctx = cx
            .use_context::<LoopContext>()
            .ok_or_else(|| RenderError::author("Phase", "must be rendered inside a loop"))?;
        let iteration = loop_ctx.iteration;
        let index = registry.register(&self.name);

        let cursor_rows = cx.use_subscription(
            "SELECT value FROM state WHERE key = ?1",
            vec![json!(keys::CURRENT_PHASE_INDEX)],
        )?;
        let cursor = state_cell_u64(&cursor_rows).unwrap_or(0);

        // skip_if is evaluated once per iteration; an error pins the phase
        // in `error` status without advancing.
        let skip_cell = cx.use_ref(|| None::<(u64, Result<bool, String>)>);
        let needs_eval = !matches!(&*skip_cell.borrow(), Some((it, _)) if *it == iteration);
        if needs_eval {
            let outcome = match &self.skip_if {
                Some(f) => f().map_err(|e| e.to_string()),
                None => Ok(false),
            };
            *skip_cell.borrow_mut() = Some((iteration, outcome));
        }
        let (skipped, skip_error) = match &*skip_cell.borrow() {
            Some((_, Ok(skip))) => (*skip, None),
            Some((_, Err(message))) => (false, Some(message.clone())),
            None => (false, None),
        };

        let active = !skipped && skip_error.is_none() && index as u64 == cursor;
        let completed = !skipped && skip_error.is_none() && (index as u64) < cursor;

        // Fresh step registry per activation; parallel markers and the step
        // cursor restart with it.
        let sreg_cell = cx.use_ref({
            let store = Rc::clone(&env.store);
            let name = self.name.clone();
            move || (u64::MAX, Rc::new(StepRegistry::new(store, &name)))
        });
        if active && sreg_cell.borrow().0 != iteration {
            *sreg_cell.borrow_mut() = (
                iteration,
                Rc::new(StepRegistry::new(Rc::clone(&env.store), &self.name)),
            );
        }
        let step_registry = Rc::clone(&sreg_cell.borrow().1);

        let (initialized_for, set_initialized) = cx.use_state(|| None::<u64>);
        let row_cell = cx.use_ref(|| None::<(u64, i64)>);
        let last_skip_cell = cx.use_ref(|| None::<u64>);

        // Report a skip_if failure once per iteration.
        {
            let env = env.clone();
            let name = self.name.clone();
            let message = skip_error.clone();
            cx.use_effect(json!([iteration, skip_error.is_some()]), move || {
                if let Some(message) = message {
                    env.report(EngineError::Effect(format!(
                        "phase {} skip_if: {}",
                        name, message
                    )));
                }
            });
        }

        // Skipped phases log one row and advance exactly once per iteration.
        {
            let env = env.clone();
            let registry = Rc::clone(&registry);
            let name = self.name.clone();
            let last_skip = Rc::clone(&last_skip_cell);
            let fire = skipped && *last_skip_cell.borrow() != Some(iteration);
            cx.use_effect(json!([iteration, skipped]), move || {
                if !fire {
                    return;
                }
                *last_skip.borrow_mut() = Some(iteration);
                if let Err(err) = env.store.phases().skip(&name, iteration) {
                    env.report(EngineError::Store(err));
                    return;
                }
                if let Err(err) = registry.advance() {
                    env.report(EngineError::Store(err));
                }
            });
        }

        // Activation: reset the step cursor, log the phase row, fire
        // on_start, then enable the children's scope.
        {
            let env = env.clone();
            let name = self.name.clone();
            let on_start = self.on_start.clone();
            let row_cell = Rc::clone(&row_cell);
            let set_initialized = set_initialized.clone();
            cx.use_effect(json!([iteration, active]), move || {
                if !active {
                    return;
                }
                debug!(phase = %name, iteration, "phase activating");
                if let Err(err) =
                    env.store
                        .state()
                        .set(&keys::step_index(&name), &0u64, "step registry reset")
                {
                    env.report(EngineError::Store(err));
                    return;
                }
                match env.store.phases().start(&name, iteration) {
                    Ok(row) => *row_cell.borrow_mut() = Some((iteration, row)),
                    Err(err) => {
                        env.report(EngineError::Store(err));
                        return;
                    }
                }
                if let Some(on_start) = &on_start {
                    on_start();
                }
                set_initialized.set(Some(iteration));
            });
        }

        // Deactivation: once the cursor moves past this phase, complete the
        // logged row and fire on_complete.
        {
            let env = env.clone();
            let on_complete = self.on_complete.clone();
            let row_cell = Rc::clone(&row_cell);
            cx.use_effect(json!([iteration, completed]), move || {
                if !completed {
                    return;
                }
                let row = row_cell.borrow_mut().take();
                if let Some((_, row)) = row {
                    if let Err(err) = env.store.phases().complete(row) {
                        env.report(EngineError::Store(err));
                    }
                    if let Some(on_complete) = &on_complete {
                        on_complete();
                    }
                }
            });
        }

        let parent_scope = cx
            .use_context::<ExecScope>()
            .map(|s| *s)
            .unwrap_or_default();
        let enabled =
            active && parent_scope.enabled && initialized_for == Some(iteration);
        let child_scope = if enabled {
            parent_scope
        } else {
            ExecScope::disabled()
        };
        cx.provide_context(Rc::new(child_scope));
        cx.provide_context(Rc::clone(&step_registry));

        let status = if skip_error.is_some() {
            "error"
        } else if skipped {
            "skipped"
        } else if active {
            "active"
        } else if completed {
            "completed"
        } else {
            "pending"
        };

        let mut host = HostElement::new("phase")
            .attr("name", self.name.clone())
            .attr("status", status)
            .children(self.children.clone());

        if enabled {
            let advance = {
                let env = env.clone();
                let registry = Rc::clone(&registry);
                Rc::new(move || {
                    if let Err(err) = registry.advance() {
                        env.report(EngineError::Store(err));
                    }
                }) as Rc<dyn Fn()>
            };
            host = host.child(GroupMonitor::element(iteration, None, step_registry, advance));
        }

        Ok(host.into())
    }
}
