//! The iteration driver: `While` and its bounded alias `Ralph`.
//!
//! Loop state lives in the store (`while.<id>.status`, `while.<id>.iteration`,
//! mirrored by the global `ralphCount`); the element only observes it, so a
//! restarted process resumes mid-loop from the cursors. Descendants finish an
//! iteration by calling `signal_complete` on the loop context, or implicitly
//! when the loop body's phases, steps, or tasks drain.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use anyhow::Result as AnyResult;
use futures::future::LocalBoxFuture;
use serde_json::json;
use tracing::debug;

use super::keys;
use super::phase::PhaseRegistry;
use super::step::{GroupMonitor, StepRegistry};
use super::{state_cell_string, state_cell_u64};
use crate::engine::{Engine, Env, Thunk};
use crate::errors::{EngineError, RenderError};
use crate::store::Store;
use crate::tree::{Component, Element, HostElement, RenderCtx};
use smithers_common::CompletionReason;

/// A loop condition: synchronous or asynchronous, either may fail.
#[derive(Clone)]
pub enum Condition {
    Sync(Rc<dyn Fn() -> AnyResult<bool>>),
    Async(Rc<dyn Fn() -> LocalBoxFuture<'static, AnyResult<bool>>>),
}

impl Condition {
    /// Always true; pair with `max_iterations` for a bounded loop.
    pub fn always() -> Self {
        Self::Sync(Rc::new(|| Ok(true)))
    }

    pub fn sync(f: impl Fn() -> bool + 'static) -> Self {
        Self::Sync(Rc::new(move || Ok(f())))
    }

    pub fn try_sync(f: impl Fn() -> AnyResult<bool> + 'static) -> Self {
        Self::Sync(Rc::new(f))
    }

    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = AnyResult<bool>> + 'static,
    {
        Self::Async(Rc::new(move || Box::pin(f())))
    }
}

/// Context every descendant of a loop can reach.
pub struct LoopContext {
    pub id: String,
    pub iteration: u64,
    driver: Rc<LoopDriver>,
}

impl LoopContext {
    /// Finish the current iteration: re-evaluate the condition and either
    /// start the next iteration or complete the loop.
    pub fn signal_complete(&self) {
        self.driver.signal();
    }
}

/// The `While` element.
pub struct While {
    id: String,
    condition: Condition,
    max_iterations: u64,
    on_iteration: Option<Rc<dyn Fn(u64)>>,
    on_complete: Option<Rc<dyn Fn(u64, CompletionReason)>>,
    children: Vec<Element>,
}

impl While {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            condition: Condition::always(),
            max_iterations: 10,
            on_iteration: None,
            on_complete: None,
            children: Vec::new(),
        }
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn max_iterations(mut self, max: u64) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn on_iteration(mut self, f: impl Fn(u64) + 'static) -> Self {
        self.on_iteration = Some(Rc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(u64, CompletionReason) + 'static) -> Self {
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

/// Bounded iteration loop: a `While` whose condition is always true.
pub struct Ralph;

impl Ralph {
    pub fn new(id: impl Into<String>, iterations: u64) -> While {
        While::new(id)
            .condition(Condition::always())
            .max_iterations(iterations)
    }
}

impl Component for While {
    fn type_name(&self) -> &'static str {
        "While"
    }

    fn key(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let env = cx.env();
        let status_key = keys::while_status(&self.id);
        let iter_key = keys::while_iteration(&self.id);

        let driver = Rc::clone(&*cx
            .use_ref(|| {
                Rc::new(LoopDriver {
                    id: self.id.clone(),
                    condition: self.condition.clone(),
                    max_iterations: self.max_iterations,
                    on_iteration: self.on_iteration.clone(),
                    on_complete: self.on_complete.clone(),
                    env: env.clone(),
                    advancing: Cell::new(false),
                    last_advance: RefCell::new(None),
                })
            })
            .borrow());

        let status_rows =
            cx.use_subscription("SELECT value FROM state WHERE key = ?1", vec![json!(status_key)])?;
        let iter_rows =
            cx.use_subscription("SELECT value FROM state WHERE key = ?1", vec![json!(iter_key)])?;
        let status = state_cell_string(&status_rows);
        let iteration = state_cell_u64(&iter_rows).unwrap_or(0);

        {
            let driver = Rc::clone(&driver);
            cx.use_mount(move || driver.init());
        }

        let phase_registry = Rc::clone(&*cx
            .use_ref(|| Rc::new(PhaseRegistry::new(Rc::clone(&env.store))))
            .borrow());

        // The loop-level step registry hosts steps rendered directly under
        // the loop; a fresh instance per iteration keeps parallel completion
        // markers from leaking across iterations.
        let step_cell = cx.use_ref({
            let store = Rc::clone(&env.store);
            let id = self.id.clone();
            move || (iteration, Rc::new(StepRegistry::new(store, &id)))
        });
        {
            let mut slot = step_cell.borrow_mut();
            if slot.0 != iteration {
                *slot = (
                    iteration,
                    Rc::new(StepRegistry::new(Rc::clone(&env.store), &self.id)),
                );
            }
        }
        let step_registry = Rc::clone(&step_cell.borrow().1);

        cx.provide_context(Rc::new(LoopContext {
            id: self.id.clone(),
            iteration,
            driver: Rc::clone(&driver),
        }));
        cx.provide_context(Rc::clone(&phase_registry));
        cx.provide_context(Rc::clone(&step_registry));

        let status_attr = status.clone().unwrap_or_else(|| "pending".to_string());
        let mut host = HostElement::new("while")
            .attr("id", self.id.clone())
            .attr("iteration", iteration as i64)
            .attr("maxIterations", self.max_iterations as i64)
            .attr("status", status_attr);

        if status.as_deref() == Some("running") {
            host = host.children(self.children.clone());
            let signal = {
                let driver = Rc::clone(&driver);
                Rc::new(move || driver.signal()) as Rc<dyn Fn()>
            };
            host = host.child(GroupMonitor::element(
                iteration,
                Some(Rc::clone(&phase_registry)),
                step_registry,
                signal,
            ));
        }

        Ok(host.into())
    }
}

/// Owns the advancement protocol of one loop. Shared through the loop
/// context; every method is re-entrant-safe on the control thread.
pub(crate) struct LoopDriver {
    id: String,
    condition: Condition,
    max_iterations: u64,
    on_iteration: Option<Rc<dyn Fn(u64)>>,
    on_complete: Option<Rc<dyn Fn(u64, CompletionReason)>>,
    env: Env,
    /// True while an advance is in flight (or the loop is done); extra
    /// signals within that window coalesce into nothing.
    advancing: Cell<bool>,
    last_advance: RefCell<Option<Instant>>,
}

impl LoopDriver {
    fn store(&self) -> &Store {
        &self.env.store
    }

    fn set_state(&self, key: &str, value: serde_json::Value, reason: &str) {
        if self.store().is_closed() {
            return;
        }
        if let Err(err) = self.store().state().set(key, &value, reason) {
            self.env.report(EngineError::Store(err));
        }
    }

    fn get_status(&self) -> Option<String> {
        self.store()
            .state()
            .get::<String>(&keys::while_status(&self.id))
            .ok()
            .flatten()
    }

    fn get_iteration(&self) -> u64 {
        self.store()
            .state()
            .get::<u64>(&keys::while_iteration(&self.id))
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    fn stop_requested(&self) -> bool {
        matches!(
            self.store().state().get_raw(keys::STOP_REQUESTED),
            Ok(Some(_))
        )
    }

    /// First-mount / resume protocol.
    pub(crate) fn init(self: Rc<Self>) {
        match self.get_status().as_deref() {
            None => {
                let driver = Rc::clone(&self);
                self.eval_condition(move |result| match result {
                    Err(message) => driver.enter_error(&message),
                    Ok(false) => driver.complete(0, CompletionReason::Condition),
                    Ok(true) if driver.max_iterations == 0 => {
                        driver.complete(0, CompletionReason::Condition)
                    }
                    Ok(true) => driver.begin_first_iteration(),
                });
            }
            Some("running") => {
                let iteration = self.get_iteration();
                debug!(loop_id = %self.id, iteration, "loop resumed");
                self.set_state(keys::RALPH_COUNT, json!(iteration), "loop resumed");
            }
            _ => {}
        }
    }

    fn begin_first_iteration(&self) {
        let reason = format!("loop {} started", self.id);
        self.set_state(&keys::while_iteration(&self.id), json!(0), &reason);
        self.set_state(&keys::while_status(&self.id), json!("running"), &reason);
        self.set_state(keys::RALPH_COUNT, json!(0), &reason);
        self.set_state(keys::CURRENT_PHASE_INDEX, json!(0), &reason);
        self.set_state(&keys::step_index(&self.id), json!(0), &reason);
        *self.last_advance.borrow_mut() = Some(Instant::now());
        if let Some(on_iteration) = &self.on_iteration {
            on_iteration(0);
        }
    }

    /// `signal_complete` entry point; throttled by the configured minimum
    /// delay between advances of the same loop.
    pub(crate) fn signal(self: &Rc<Self>) {
        if self.advancing.get() {
            return;
        }
        self.advancing.set(true);

        let wait = match (self.env.options.iteration_timeout, *self.last_advance.borrow()) {
            (Some(min), Some(last)) => min.checked_sub(last.elapsed()),
            _ => None,
        };
        let driver = Rc::clone(self);
        match wait {
            Some(wait) if !wait.is_zero() => {
                self.env.handle.spawn(async move {
                    tokio::time::sleep(wait).await;
                    Box::new(move |_: &mut Engine| driver.advance_now()) as Thunk
                });
            }
            _ => self
                .env
                .handle
                .defer(move |_| driver.advance_now()),
        }
    }

    fn advance_now(self: Rc<Self>) {
        if self.get_status().as_deref() != Some("running") {
            self.advancing.set(false);
            return;
        }
        let next = self.get_iteration() + 1;

        if self.stop_requested() {
            self.complete(next, CompletionReason::Condition);
            return;
        }
        if next >= self.max_iterations {
            self.complete(next, CompletionReason::Max);
            return;
        }

        let driver = Rc::clone(&self);
        self.eval_condition(move |result| match result {
            Err(message) => {
                driver.advancing.set(false);
                driver.enter_error(&message);
            }
            Ok(false) => driver.complete(next, CompletionReason::Condition),
            Ok(true) => driver.begin_iteration(next),
        });
    }

    fn begin_iteration(&self, iteration: u64) {
        let reason = format!("loop {} iteration {}", self.id, iteration);
        self.set_state(&keys::while_iteration(&self.id), json!(iteration), &reason);
        self.set_state(keys::RALPH_COUNT, json!(iteration), &reason);
        self.set_state(keys::CURRENT_PHASE_INDEX, json!(0), &reason);
        self.set_state(&keys::step_index(&self.id), json!(0), &reason);
        *self.last_advance.borrow_mut() = Some(Instant::now());
        self.advancing.set(false);
        if let Some(on_iteration) = &self.on_iteration {
            on_iteration(iteration);
        }
    }

    fn complete(&self, iterations: u64, reason: CompletionReason) {
        debug!(loop_id = %self.id, iterations, reason = reason.as_str(), "loop complete");
        self.set_state(
            &keys::while_status(&self.id),
            json!("complete"),
            &format!("loop complete ({})", reason.as_str()),
        );
        // `advancing` stays set: a finished loop ignores further signals.
        self.advancing.set(true);
        if let Some(on_complete) = &self.on_complete {
            on_complete(iterations, reason);
        }
    }

    fn enter_error(&self, message: &str) {
        self.set_state(
            &keys::while_status(&self.id),
            json!("error"),
            "condition evaluation failed",
        );
        self.env.report(EngineError::Effect(format!(
            "loop {} condition: {}",
            self.id, message
        )));
    }

    /// Check `stop_requested`, then evaluate the condition. Sync conditions
    /// resolve inline; async ones resolve through a spawned future.
    fn eval_condition(&self, k: impl FnOnce(Result<bool, String>) + 'static) {
        if self.stop_requested() {
            k(Ok(false));
            return;
        }
        match &self.condition {
            Condition::Sync(f) => k(f().map_err(|e| e.to_string())),
            Condition::Async(f) => {
                let fut = f();
                self.env.handle.spawn(async move {
                    let result = fut.await.map_err(|e| e.to_string());
                    Box::new(move |_: &mut Engine| k(result)) as Thunk
                });
            }
        }
    }
}
