//! Steps: the sequential (or parallel) units of work inside a phase or loop.
//!
//! A step registry assigns indices by first registration and keeps its
//! cursor in `stepIndex_<owner>`; the `Parallel` wrapper flips the same
//! registry to all-active mode with per-step completion markers. A step
//! derives its own completion from scope-isolated task counts: once its
//! allow-empty latch arms (after its children's mount effects committed)
//! and no scoped task is running, the step finishes, attaches any VCS ids,
//! and advances the registry.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::keys;
use super::phase::PhaseRegistry;
use super::while_loop::LoopContext;
use super::{count_cell, state_cell_u64};
use crate::engine::{Engine, Env, Thunk};
use crate::errors::{EngineError, RenderError, StoreError};
use crate::scope::ExecScope;
use crate::store::Store;
use crate::tree::{Component, Element, HostElement, RenderCtx};
use smithers_common::{AdapterError, VcsChange};

const RUNNING_SQL: &str = "SELECT COUNT(*) AS n FROM tasks WHERE scope_id = ?1 \
     AND iteration = ?2 AND status = 'running' AND component_type NOT IN ('step', 'phase')";
const TOTAL_SQL: &str = "SELECT COUNT(*) AS n FROM tasks WHERE scope_id = ?1 \
     AND iteration = ?2 AND component_type NOT IN ('step', 'phase')";
const ITER_RUNNING_SQL: &str = "SELECT COUNT(*) AS n FROM tasks WHERE execution_id = ?1 \
     AND iteration = ?2 AND status = 'running' AND component_type NOT IN ('step', 'phase')";
const ITER_TOTAL_SQL: &str = "SELECT COUNT(*) AS n FROM tasks WHERE execution_id = ?1 \
     AND iteration = ?2 AND component_type NOT IN ('step', 'phase')";

/// Directory of steps under one phase activation (or directly under a
/// loop). A fresh instance is created per activation so completion markers
/// never leak between iterations.
pub struct StepRegistry {
    store: Rc<Store>,
    owner: String,
    instance: String,
    parallel: Cell<bool>,
    names: RefCell<Vec<String>>,
}

impl StepRegistry {
    pub fn new(store: Rc<Store>, owner: &str) -> Self {
        Self {
            store,
            owner: owner.to_string(),
            instance: Uuid::new_v4().simple().to_string(),
            parallel: Cell::new(false),
            names: RefCell::new(Vec::new()),
        }
    }

    /// Namespace for parallel completion markers, unique per activation.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn cursor_key(&self) -> String {
        keys::step_index(&self.owner)
    }

    /// Register a step, assigning the next index. Unnamed steps get a
    /// positional name.
    pub fn register(&self, name: Option<&str>) -> (usize, String) {
        let mut names = self.names.borrow_mut();
        if let Some(name) = name {
            if let Some(index) = names.iter().position(|n| n == name) {
                return (index, name.to_string());
            }
        }
        let index = names.len();
        let name = name
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("step-{}", index));
        names.push(name.clone());
        (index, name)
    }

    pub fn len(&self) -> usize {
        self.names.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.borrow().is_empty()
    }

    pub fn set_parallel(&self) {
        self.parallel.set(true);
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel.get()
    }

    /// Sequential cursor; `-1` in parallel mode (every step active).
    pub fn current_index(&self) -> i64 {
        if self.parallel.get() {
            return -1;
        }
        self.store
            .state()
            .get::<u64>(&self.cursor_key())
            .ok()
            .flatten()
            .unwrap_or(0) as i64
    }

    pub fn advance(&self) -> Result<(), StoreError> {
        let current = self.current_index().max(0) as u64;
        let next = (current + 1).min(self.len() as u64);
        self.store
            .state()
            .set(&self.cursor_key(), &next, "step advanced")
    }

    /// Record completion: a marker in parallel mode, a cursor move otherwise.
    pub fn mark_complete(&self, index: usize) -> Result<(), StoreError> {
        if self.parallel.get() {
            self.store.state().set(
                &keys::step_complete(&self.instance, index),
                &"1",
                "step complete",
            )
        } else {
            self.advance()
        }
    }

    pub fn is_step_active(&self, index: usize) -> bool {
        self.parallel.get() || index as i64 == self.current_index()
    }

    pub fn is_step_completed(&self, index: usize) -> bool {
        if self.parallel.get() {
            matches!(
                self.store
                    .state()
                    .get_raw(&keys::step_complete(&self.instance, index)),
                Ok(Some(_))
            )
        } else {
            (index as i64) < self.current_index()
        }
    }
}

/// VCS ids recorded by `Snapshot`/`Commit` leaves inside a step; attached
/// to the step row on completion.
#[derive(Default)]
pub struct StepAttachments {
    pub snapshot: Option<String>,
    pub commit: Option<String>,
}

/// Context slot the active step provides to its subtree.
pub struct StepVcsSlot(pub RefCell<StepAttachments>);

/// Switches the enclosing step registry to all-active mode.
pub struct Parallel {
    children: Vec<Element>,
}

impl Parallel {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
        }
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

impl Default for Parallel {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for Parallel {
    fn type_name(&self) -> &'static str {
        "Parallel"
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let registry = cx.use_context::<StepRegistry>().ok_or_else(|| {
            RenderError::author("Parallel", "must be rendered inside a phase or loop")
        })?;
        registry.set_parallel();
        Ok(HostElement::new("parallel")
            .children(self.children.clone())
            .into())
    }
}

/// Local lifecycle of one step activation.
#[derive(Clone, Default, PartialEq)]
struct StepState {
    started_for: Option<u64>,
    ready: bool,
    armed: bool,
    completing: bool,
    completed: bool,
    failed: bool,
    scope_id: Option<Uuid>,
    task_id: Option<String>,
    row_id: Option<i64>,
}

/// The `Step` element.
pub struct Step {
    name: Option<String>,
    snapshot_before: bool,
    snapshot_after: bool,
    commit_after: bool,
    commit_message: Option<String>,
    on_start: Option<Rc<dyn Fn()>>,
    on_complete: Option<Rc<dyn Fn()>>,
    on_error: Option<Rc<dyn Fn(&str)>>,
    children: Vec<Element>,
}

impl Step {
    pub fn new() -> Self {
        Self {
            name: None,
            snapshot_before: false,
            snapshot_after: false,
            commit_after: false,
            commit_message: None,
            on_start: None,
            on_complete: None,
            on_error: None,
            children: Vec::new(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        let mut step = Self::new();
        step.name = Some(name.into());
        step
    }

    pub fn snapshot_before(mut self) -> Self {
        self.snapshot_before = true;
        self
    }

    pub fn snapshot_after(mut self) -> Self {
        self.snapshot_after = true;
        self
    }

    pub fn commit_after(mut self, message: impl Into<String>) -> Self {
        self.commit_after = true;
        self.commit_message = Some(message.into());
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

    pub fn on_error(mut self, f: impl Fn(&str) + 'static) -> Self {
        self.on_error = Some(Rc::new(f));
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

impl Default for Step {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for Step {
    fn type_name(&self) -> &'static str {
        "Step"
    }

    fn key(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let env = cx.env();
        let registry = cx.use_context::<StepRegistry>().ok_or_else(|| {
            RenderError::author("Step", "must be rendered inside a phase or loop")
        })?;
        let iteration = cx
            .use_context::<LoopContext>()
            .map(|l| l.iteration)
            .unwrap_or(0);
        let scope_in = cx
            .use_context::<ExecScope>()
            .map(|s| *s)
            .unwrap_or_default();

        // Registration is per registry instance; a fresh activation hands
        // out fresh indices in render order.
        let reg_cell = cx.use_ref(|| None::<(String, usize, String)>);
        let needs_registration = !matches!(
            &*reg_cell.borrow(),
            Some((instance, _, _)) if instance.as_str() == registry.instance()
        );
        if needs_registration {
            let (index, name) = registry.register(self.name.as_deref());
            *reg_cell.borrow_mut() = Some((registry.instance().to_string(), index, name));
        }
        let (index, name) = match &*reg_cell.borrow() {
            Some((_, index, name)) => (*index, name.clone()),
            None => (0, String::new()),
        };

        let (state, set_state) = cx.use_state(StepState::default);
        // New iteration, same node: restart the lifecycle.
        if let Some(previous) = state.started_for {
            if previous != iteration {
                set_state.set(StepState::default());
            }
        }

        // One attachment slot per node; inner Snapshot/Commit leaves write
        // their change ids here and completion folds them into the row.
        let vcs_slot = Rc::clone(
            &*cx.use_ref(|| Rc::new(StepVcsSlot(RefCell::new(StepAttachments::default()))))
                .borrow(),
        );

        let parallel = registry.is_parallel();
        let cursor_rows = cx.use_subscription_opt(
            "SELECT value FROM state WHERE key = ?1",
            vec![json!(registry.cursor_key())],
            parallel,
        )?;
        let cursor = state_cell_u64(&cursor_rows).unwrap_or(0) as i64;
        let is_active = parallel || index as i64 == cursor;

        let scope_param = state
            .scope_id
            .map(|s| s.to_string())
            .unwrap_or_default();
        let running_rows = cx.use_subscription_opt(
            RUNNING_SQL,
            vec![json!(scope_param), json!(iteration)],
            state.scope_id.is_none(),
        )?;
        let total_rows = cx.use_subscription_opt(
            TOTAL_SQL,
            vec![json!(scope_param), json!(iteration)],
            state.scope_id.is_none(),
        )?;
        let running = count_cell(&running_rows);
        let total = count_cell(&total_rows);

        let started = state.started_for == Some(iteration);
        let can_activate =
            scope_in.enabled && is_active && !started && !state.completed && !state.failed;

        // Activation: fresh scope, step task (excluded from counts), steps
        // row, optional snapshot-before, then enable the children.
        {
            let env = env.clone();
            let name = name.clone();
            let set_state = set_state.clone();
            let on_start = self.on_start.clone();
            let on_error = self.on_error.clone();
            let snapshot_before = self.snapshot_before;
            let vcs_slot = Rc::clone(&vcs_slot);
            cx.use_effect(json!([iteration, can_activate]), move || {
                if !can_activate {
                    return;
                }
                *vcs_slot.0.borrow_mut() = StepAttachments::default();
                let scope_id = Uuid::new_v4();
                debug!(step = %name, iteration, %scope_id, "step activating");
                let task_id = match env.store.tasks().start("step", &name, iteration, Some(scope_id))
                {
                    Ok(id) => id,
                    Err(err) => {
                        env.report(EngineError::Store(err));
                        return;
                    }
                };
                let row_id = match env.store.steps().start(&name) {
                    Ok(id) => id,
                    Err(err) => {
                        env.report(EngineError::Store(err));
                        return;
                    }
                };
                if let Some(on_start) = &on_start {
                    on_start();
                }

                let base = StepState {
                    started_for: Some(iteration),
                    ready: false,
                    scope_id: Some(scope_id),
                    task_id: Some(task_id.clone()),
                    row_id: Some(row_id),
                    ..StepState::default()
                };

                if snapshot_before {
                    let Some(vcs) = env.options.vcs.clone() else {
                        fail_step(&env, &base, "snapshot requested but no VCS adapter", &on_error);
                        set_state.set(StepState {
                            failed: true,
                            ..base
                        });
                        return;
                    };
                    set_state.set(base.clone());
                    let description = format!("before step {}", name);
                    let env2 = env.clone();
                    let set_state = set_state.clone();
                    let on_error = on_error.clone();
                    env.handle.spawn(async move {
                        let result = vcs.snapshot(&description).await;
                        Box::new(move |_: &mut Engine| {
                            apply_snapshot_before(&env2, &base, result, &set_state, &on_error);
                        }) as Thunk
                    });
                } else {
                    set_state.set(StepState {
                        ready: true,
                        ..base
                    });
                }
            });
        }

        // Allow-empty latch: this effect commits after the children's mount
        // effects, so any synchronously started child task is already
        // visible in the counts when it arms.
        {
            let set_state = set_state.clone();
            let state_now = state.clone();
            let arm = started && state.ready && !state.armed;
            cx.use_effect(json!([iteration, started && state.ready]), move || {
                if arm {
                    set_state.set(StepState {
                        armed: true,
                        ..state_now
                    });
                }
            });
        }

        // Completion: counts drained after the latch armed.
        let may_complete = started
            && state.ready
            && state.armed
            && !state.completing
            && !state.completed
            && !state.failed
            && running == 0;
        {
            let env = env.clone();
            let name = name.clone();
            let registry = Rc::clone(&registry);
            let state_now = state.clone();
            let set_state = set_state.clone();
            let on_complete = self.on_complete.clone();
            let snapshot_after = self.snapshot_after;
            let commit_after = self.commit_after;
            let commit_message = self.commit_message.clone();
            let vcs_slot = Rc::clone(&vcs_slot);
            cx.use_effect(
                json!([iteration, may_complete, running, total]),
                move || {
                    if !may_complete {
                        return;
                    }
                    let mut state_next = state_now.clone();
                    state_next.completing = true;
                    set_state.set(state_next.clone());

                    let needs_vcs = snapshot_after || commit_after;
                    if needs_vcs {
                        let Some(vcs) = env.options.vcs.clone() else {
                            finish_step(&env, &registry, index, &name, &state_next,
                                Some("vcs finalization requested but no VCS adapter"),
                                None, None, &vcs_slot, &set_state, &on_complete);
                            return;
                        };
                        let message = commit_message
                            .clone()
                            .unwrap_or_else(|| format!("step {} complete", name));
                        let description = format!("after step {}", name);
                        let env2 = env.clone();
                        let registry = Rc::clone(&registry);
                        let name2 = name.clone();
                        let set_state = set_state.clone();
                        let on_complete = on_complete.clone();
                        let vcs_slot = Rc::clone(&vcs_slot);
                        env.handle.spawn(async move {
                            let snapshot = if snapshot_after {
                                Some(vcs.snapshot(&description).await)
                            } else {
                                None
                            };
                            let commit = if commit_after {
                                Some(vcs.commit(&message).await)
                            } else {
                                None
                            };
                            Box::new(move |_: &mut Engine| {
                                apply_vcs_finalization(
                                    &env2, &registry, index, &name2, &state_next, snapshot,
                                    commit, &message, &vcs_slot, &set_state, &on_complete,
                                );
                            }) as Thunk
                        });
                    } else {
                        finish_step(
                            &env, &registry, index, &name, &state_next, None, None, None,
                            &vcs_slot, &set_state, &on_complete,
                        );
                    }
                },
            );
        }

        // Defensive cleanup: an unmounted running step completes its task so
        // counts do not leak.
        {
            let env = env.clone();
            let snapshot = state.clone();
            let live = started && !state.completed && !state.failed;
            cx.use_unmount(move || {
                if !live {
                    return;
                }
                if let Some(task_id) = &snapshot.task_id {
                    if !env.store.is_closed() {
                        if let Err(err) = env.store.tasks().complete(task_id) {
                            env.report(EngineError::Store(err));
                        }
                    }
                }
                if let Some(row_id) = snapshot.row_id {
                    if !env.store.is_closed() {
                        let _ = env.store.steps().complete(
                            row_id,
                            None,
                            None,
                            Some("unmounted before completion"),
                        );
                    }
                }
            });
        }

        let can_execute =
            scope_in.enabled && is_active && started && state.ready && !state.completed
                && !state.failed;

        let status = if state.failed {
            "failed"
        } else if state.completed || registry.is_step_completed(index) {
            "completed"
        } else if can_execute {
            "active"
        } else {
            "pending"
        };

        let mut host = HostElement::new("step")
            .attr("name", name.clone())
            .attr("status", status);

        if can_execute {
            if let Some(scope_id) = state.scope_id {
                cx.provide_context(Rc::new(ExecScope::active(scope_id)));
                cx.provide_context(vcs_slot);
                host = host.children(self.children.clone());
            }
        }

        Ok(host.into())
    }
}

fn fail_step(env: &Env, state: &StepState, message: &str, on_error: &Option<Rc<dyn Fn(&str)>>) {
    if let Some(row_id) = state.row_id {
        if let Err(err) = env.store.steps().fail(row_id, message) {
            env.report(EngineError::Store(err));
        }
    }
    if let Some(task_id) = &state.task_id {
        if let Err(err) = env.store.tasks().complete(task_id) {
            env.report(EngineError::Store(err));
        }
    }
    if let Some(on_error) = on_error {
        on_error(message);
    }
}

fn apply_snapshot_before(
    env: &Env,
    base: &StepState,
    result: Result<VcsChange, AdapterError>,
    set_state: &crate::tree::Setter<StepState>,
    on_error: &Option<Rc<dyn Fn(&str)>>,
) {
    match result {
        Ok(change) => {
            if let Err(err) =
                env.store
                    .vcs()
                    .record("git", change.commit_hash.as_deref(), Some(&change.change_id),
                        "snapshot before step")
            {
                env.report(EngineError::Store(err));
            }
            if let Some(row_id) = base.row_id {
                if let Err(err) = env.store.steps().set_snapshot_before(row_id, &change.change_id) {
                    env.report(EngineError::Store(err));
                }
            }
            set_state.set(StepState {
                ready: true,
                ..base.clone()
            });
        }
        Err(err) => {
            let message = format!("snapshot before step failed: {}", err);
            fail_step(env, base, &message, on_error);
            set_state.set(StepState {
                failed: true,
                ..base.clone()
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_vcs_finalization(
    env: &Env,
    registry: &Rc<StepRegistry>,
    index: usize,
    name: &str,
    state: &StepState,
    snapshot: Option<Result<VcsChange, AdapterError>>,
    commit: Option<Result<VcsChange, AdapterError>>,
    commit_message: &str,
    vcs_slot: &Rc<StepVcsSlot>,
    set_state: &crate::tree::Setter<StepState>,
    on_complete: &Option<Rc<dyn Fn()>>,
) {
    let mut error = None;
    let snapshot_id = match snapshot {
        Some(Ok(change)) => {
            let _ = env.store.vcs().record(
                "git",
                change.commit_hash.as_deref(),
                Some(&change.change_id),
                "snapshot after step",
            );
            Some(change.change_id)
        }
        Some(Err(err)) => {
            error = Some(format!("snapshot after step failed: {}", err));
            None
        }
        None => None,
    };
    let commit_id = match commit {
        Some(Ok(change)) => {
            let _ = env.store.vcs().record(
                "git",
                change.commit_hash.as_deref(),
                Some(&change.change_id),
                commit_message,
            );
            Some(change.change_id)
        }
        Some(Err(err)) => {
            error = Some(format!("commit after step failed: {}", err));
            None
        }
        None => None,
    };
    finish_step(
        env,
        registry,
        index,
        name,
        state,
        error.as_deref(),
        snapshot_id.as_deref(),
        commit_id.as_deref(),
        vcs_slot,
        set_state,
        on_complete,
    );
}

/// Terminal bookkeeping shared by every completion path: the steps row, the
/// owning task, the registry cursor/marker, and the element's callback.
#[allow(clippy::too_many_arguments)]
fn finish_step(
    env: &Env,
    registry: &Rc<StepRegistry>,
    index: usize,
    name: &str,
    state: &StepState,
    error: Option<&str>,
    snapshot_after: Option<&str>,
    commit_created: Option<&str>,
    vcs_slot: &Rc<StepVcsSlot>,
    set_state: &crate::tree::Setter<StepState>,
    on_complete: &Option<Rc<dyn Fn()>>,
) {
    let iteration = state.started_for.unwrap_or(0);
    // A failed command inside the step is not a step failure; mirror it in
    // the row's error column.
    let child_failures = state
        .scope_id
        .and_then(|scope| env.store.tasks().scope_failed(scope, iteration).ok())
        .unwrap_or(0);
    let note = match (error, child_failures) {
        (Some(error), _) => Some(error.to_string()),
        (None, 0) => None,
        (None, n) => Some(format!("{} child task(s) failed", n)),
    };

    // Ids recorded by inner Snapshot/Commit leaves fill in whatever the
    // step's own finalization did not produce.
    let attachments = vcs_slot.0.borrow();
    let snapshot_after = snapshot_after.or(attachments.snapshot.as_deref());
    let commit_created = commit_created.or(attachments.commit.as_deref());

    if let Some(row_id) = state.row_id {
        if let Err(err) = env.store.steps().complete(
            row_id,
            snapshot_after,
            commit_created,
            note.as_deref(),
        ) {
            env.report(EngineError::Store(err));
        }
    }
    if let Some(task_id) = &state.task_id {
        if let Err(err) = env.store.tasks().complete(task_id) {
            env.report(EngineError::Store(err));
        }
    }
    if let Err(err) = registry.mark_complete(index) {
        env.report(EngineError::Store(err));
    }
    debug!(step = %name, index, "step complete");
    if let Some(on_complete) = on_complete {
        on_complete();
    }
    set_state.set(StepState {
        completing: false,
        completed: true,
        ..state.clone()
    });
}

/// Watches a step registry (or, with no steps, the iteration's task counts)
/// and fires `on_all_complete` exactly once per iteration. Rendered as the
/// last child of its group so its latch arms after sibling mount effects.
pub(crate) struct GroupMonitor {
    iteration: u64,
    phases: Option<Rc<PhaseRegistry>>,
    steps: Rc<StepRegistry>,
    on_all_complete: Rc<dyn Fn()>,
}

impl GroupMonitor {
    pub(crate) fn element(
        iteration: u64,
        phases: Option<Rc<PhaseRegistry>>,
        steps: Rc<StepRegistry>,
        on_all_complete: Rc<dyn Fn()>,
    ) -> Element {
        Element::component(Self {
            iteration,
            phases,
            steps,
            on_all_complete,
        })
    }
}

impl Component for GroupMonitor {
    fn type_name(&self) -> &'static str {
        "GroupMonitor"
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
        let env = cx.env();
        let iteration = self.iteration;
        let fired = cx.use_ref(|| None::<u64>);
        let (armed_for, set_armed) = cx.use_state(|| None::<u64>);

        let phase_total = self.phases.as_ref().map(|p| p.len()).unwrap_or(0);
        let step_total = self.steps.len();
        let parallel = self.steps.is_parallel();
        let execution = env.store.execution_id().unwrap_or_default();

        // Slots are stable: every mode's subscription is always registered,
        // with `skip` silencing the ones the current mode ignores.
        let phase_rows = cx.use_subscription_opt(
            "SELECT value FROM state WHERE key = ?1",
            vec![json!(keys::CURRENT_PHASE_INDEX)],
            phase_total == 0,
        )?;
        let step_cursor_rows = cx.use_subscription_opt(
            "SELECT value FROM state WHERE key = ?1",
            vec![json!(self.steps.cursor_key())],
            phase_total > 0 || step_total == 0 || parallel,
        )?;
        let marker_rows = cx.use_subscription_opt(
            "SELECT COUNT(*) AS n FROM state WHERE key LIKE ?1",
            vec![json!(format!("stepComplete:{}:%", self.steps.instance()))],
            phase_total > 0 || step_total == 0 || !parallel,
        )?;
        let fallback = phase_total == 0 && step_total == 0;
        let running_rows = cx.use_subscription_opt(
            ITER_RUNNING_SQL,
            vec![json!(execution), json!(iteration)],
            !fallback,
        )?;
        let _total_rows = cx.use_subscription_opt(
            ITER_TOTAL_SQL,
            vec![json!(execution), json!(iteration)],
            !fallback,
        )?;

        // The latch arms one commit after mount (per iteration), after the
        // sibling subtrees' mount effects have started their tasks.
        {
            let set_armed = set_armed.clone();
            cx.use_effect(json!([iteration]), move || {
                set_armed.set(Some(iteration));
            });
        }
        let armed = armed_for == Some(iteration);

        let complete = if phase_total > 0 {
            state_cell_u64(&phase_rows).unwrap_or(0) >= phase_total as u64
        } else if step_total > 0 {
            if parallel {
                count_cell(&marker_rows) >= step_total as u64
            } else {
                state_cell_u64(&step_cursor_rows).unwrap_or(0) >= step_total as u64
            }
        } else {
            armed && count_cell(&running_rows) == 0
        };

        {
            let fired = Rc::clone(&fired);
            let on_all_complete = Rc::clone(&self.on_all_complete);
            cx.use_effect(json!([iteration, complete]), move || {
                if complete && *fired.borrow() != Some(iteration) {
                    *fired.borrow_mut() = Some(iteration);
                    on_all_complete();
                }
            });
        }

        Ok(Element::Empty)
    }
}
