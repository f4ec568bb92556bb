//! The engine: a single control loop that owns the tree and the store.
//!
//! All reconciliation, store callbacks, and scheduler decisions run on one
//! logical thread. Spawned work (child processes, agent calls, VCS commands,
//! timers) runs as `spawn_local` futures whose completions come back as
//! thunks over an unbounded channel and are applied as state writes here.
//! A render never blocks; progress is observed through task counts and
//! store subscriptions.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::adapters::TokioShell;
use crate::errors::{EngineError, StoreError};
use crate::store::Store;
use crate::tree::serialize::{to_serialized_form, to_tree_snapshot};
use crate::tree::{Element, NodeId, Reconciler};
use smithers_common::{AgentAdapter, ExecutionStatus, ShellAdapter, VcsAdapter};

/// Deferred work applied on the control thread.
pub type Thunk = Box<dyn FnOnce(&mut Engine)>;

/// How the engine finished.
#[derive(Debug, Clone)]
pub struct ExitStatus {
    pub exit_code: i32,
    pub reason: String,
}

impl ExitStatus {
    pub fn success(reason: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            reason: reason.into(),
        }
    }

    pub fn failure(exit_code: i32, reason: impl Into<String>) -> Self {
        Self {
            exit_code,
            reason: reason.into(),
        }
    }
}

/// Cloneable handle for scheduling work back onto the engine loop.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Thunk>,
    pending: Rc<Cell<usize>>,
}

impl EngineHandle {
    /// Queue a thunk for the next tick.
    pub fn defer(&self, f: impl FnOnce(&mut Engine) + 'static) {
        let _ = self.tx.send(Box::new(f));
    }

    /// Schedule a re-render of one node.
    pub fn mark_dirty(&self, node: NodeId) {
        self.defer(move |engine| engine.reconciler.mark_dirty(node));
    }

    /// Run a future on the local set; its resulting thunk is applied on the
    /// control thread. The engine stays alive until every spawned future has
    /// delivered.
    pub fn spawn(&self, fut: impl Future<Output = Thunk> + 'static) {
        self.pending.set(self.pending.get() + 1);
        let tx = self.tx.clone();
        let pending = Rc::clone(&self.pending);
        tokio::task::spawn_local(async move {
            let thunk = fut.await;
            pending.set(pending.get().saturating_sub(1));
            let _ = tx.send(thunk);
        });
    }

    /// Number of spawned futures that have not delivered their thunk yet.
    pub fn pending_ops(&self) -> usize {
        self.pending.get()
    }
}

/// Engine environment cloned into components, effects, and spawned futures.
#[derive(Clone)]
pub struct Env {
    pub store: Rc<Store>,
    pub handle: EngineHandle,
    pub options: Rc<EngineOptions>,
}

impl Env {
    /// Deliver an error to the root handler and the log.
    pub fn report(&self, err: EngineError) {
        error!(error = %err, "engine error");
        if let Some(on_error) = &self.options.on_error {
            on_error(&err);
        }
    }
}

/// Configuration and collaborators for one engine instance.
pub struct EngineOptions {
    /// Name recorded on the execution row.
    pub name: String,
    /// Where the authored tree came from (file, module, test name).
    pub source_label: String,
    /// Minimum delay between two successive iteration advances of one loop.
    pub iteration_timeout: Option<Duration>,
    pub agents: HashMap<String, Rc<dyn AgentAdapter>>,
    pub vcs: Option<Rc<dyn VcsAdapter>>,
    pub shell: Rc<dyn ShellAdapter>,
    pub on_error: Option<Rc<dyn Fn(&EngineError)>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            name: "workflow".to_string(),
            source_label: String::new(),
            iteration_timeout: None,
            agents: HashMap::new(),
            vcs: None,
            shell: Rc::new(TokioShell::new()),
            on_error: None,
        }
    }
}

impl EngineOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_source_label(mut self, label: impl Into<String>) -> Self {
        self.source_label = label.into();
        self
    }

    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    /// Register an agent adapter under a name referenced by agent elements.
    pub fn with_agent(mut self, name: impl Into<String>, adapter: Rc<dyn AgentAdapter>) -> Self {
        self.agents.insert(name.into(), adapter);
        self
    }

    /// Register the adapter agent elements use when they name none.
    pub fn with_default_agent(self, adapter: Rc<dyn AgentAdapter>) -> Self {
        self.with_agent("default", adapter)
    }

    pub fn with_vcs(mut self, vcs: Rc<dyn VcsAdapter>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn with_shell(mut self, shell: Rc<dyn ShellAdapter>) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_on_error(mut self, f: impl Fn(&EngineError) + 'static) -> Self {
        self.on_error = Some(Rc::new(f));
        self
    }

    /// Resolve an agent adapter by name, falling back to `default`.
    pub fn agent(&self, name: Option<&str>) -> Option<Rc<dyn AgentAdapter>> {
        match name {
            Some(name) => self.agents.get(name).cloned(),
            None => self.agents.get("default").cloned(),
        }
    }
}

/// Write the `stop_requested` state entry; running loops observe it at their
/// next condition check and complete.
pub fn request_stop(store: &Store, reason: &str) -> Result<(), StoreError> {
    let payload = json!({
        "reason": reason,
        "timestamp": Utc::now().to_rfc3339(),
        "executionId": store.execution_id().ok(),
    });
    store.state().set("stop_requested", &payload, "stop requested")
}

/// The programmatic root: render a tree, drive it to quiescence, inspect it.
pub struct Engine {
    store: Rc<Store>,
    options: Rc<EngineOptions>,
    reconciler: Reconciler,
    rx: mpsc::UnboundedReceiver<Thunk>,
    handle: EngineHandle,
    exit: Option<ExitStatus>,
    execution_finalized: bool,
    disposed: bool,
}

impl Engine {
    /// Open an execution on the store and build an empty tree.
    pub fn new(store: Rc<Store>, options: EngineOptions) -> Result<Self, StoreError> {
        store
            .executions()
            .begin(&options.name, &options.source_label)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EngineHandle {
            tx,
            pending: Rc::new(Cell::new(0)),
        };
        Ok(Self {
            reconciler: Reconciler::new(Rc::clone(&store)),
            store,
            options: Rc::new(options),
            rx,
            handle,
            exit: None,
            execution_finalized: false,
            disposed: false,
        })
    }

    pub fn store(&self) -> Rc<Store> {
        Rc::clone(&self.store)
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn env(&self) -> Env {
        Env {
            store: Rc::clone(&self.store),
            handle: self.handle.clone(),
            options: Rc::clone(&self.options),
        }
    }

    /// Mount (or update) the authored tree. Effects queued by the render run
    /// on the next settle.
    pub fn render(&mut self, el: Element) {
        let env = self.env();
        if let Err(failure) = self.reconciler.render_root(el, &env) {
            env.report(EngineError::Render {
                path: failure.path,
                source: failure.error,
            });
        }
    }

    /// Record the exit status. First writer wins; later calls are ignored.
    pub fn set_exit(&mut self, status: ExitStatus) {
        if self.exit.is_none() {
            debug!(code = status.exit_code, reason = %status.reason, "exit recorded");
            self.exit = Some(status);
        }
    }

    /// Mark the execution row finalized so the run teardown does not write a
    /// second terminal state over it.
    pub fn mark_execution_finalized(&mut self) {
        self.execution_finalized = true;
    }

    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.exit.as_ref()
    }

    /// Apply queued thunks, subscription flushes, renders, and effects until
    /// nothing is immediately runnable. Subscription caches are refreshed
    /// before dirty nodes re-render, so a render never observes a cursor its
    /// own subscriptions have not caught up to.
    pub fn settle_sync(&mut self) -> bool {
        let mut worked = false;
        loop {
            let mut drained = false;
            while let Ok(thunk) = self.rx.try_recv() {
                thunk(self);
                drained = true;
            }
            if drained {
                worked = true;
                continue;
            }

            if self.store.reactive().has_dirty() {
                if let Err(err) = self.store.reactive().flush(&self.store) {
                    // A store failure mid-flush is fatal: the reactive view
                    // can no longer be trusted.
                    let env = self.env();
                    env.report(EngineError::Store(err));
                    let _ = self.store.executions().finish(
                        ExecutionStatus::Failed,
                        1,
                        None,
                        "store failure",
                    );
                    self.execution_finalized = true;
                    self.set_exit(ExitStatus::failure(1, "store failure"));
                }
                worked = true;
                continue;
            }

            if self.reconciler.has_dirty() {
                let env = self.env();
                if let Err(failure) = self.reconciler.flush_dirty(&env) {
                    env.report(EngineError::Render {
                        path: failure.path,
                        source: failure.error,
                    });
                }
                worked = true;
                continue;
            }

            if self.reconciler.has_effects() {
                self.reconciler.run_effects();
                worked = true;
                continue;
            }

            break;
        }
        worked
    }

    /// Drive the tree until no synchronous work remains and no spawned
    /// future is outstanding. Must run inside a tokio `LocalSet`.
    pub async fn run_until_settled(&mut self) {
        loop {
            self.settle_sync();
            if self.exit.is_some() {
                break;
            }
            if self.handle.pending_ops() == 0 {
                break;
            }
            match self.rx.recv().await {
                Some(thunk) => thunk(self),
                None => break,
            }
        }
    }

    /// Run to quiescence, finalize the execution row, tear down the tree,
    /// and report how the run ended.
    pub async fn run(mut self) -> ExitStatus {
        self.run_until_settled().await;
        let status = self
            .exit
            .clone()
            .unwrap_or_else(|| ExitStatus::success("settled"));
        if !self.execution_finalized {
            let exec_status = if status.exit_code == 0 {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            };
            if let Err(err) = self.store.executions().finish(
                exec_status,
                status.exit_code,
                None,
                &status.reason,
            ) {
                warn!(error = %err, "failed to finalize execution row");
            }
        }
        self.dispose();
        status
    }

    /// Unmount the tree, running unmount cleanups. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.reconciler.dispose();
        // Cleanups may have queued store writes; deliver them.
        self.settle_sync();
    }

    pub fn to_serialized_form(&self) -> String {
        to_serialized_form(&self.reconciler)
    }

    pub fn to_tree_snapshot(&self) -> Value {
        to_tree_snapshot(&self.reconciler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RenderError;
    use crate::tree::{Component, Element, HostElement, RenderCtx};
    use std::cell::RefCell;

    fn test_engine() -> Engine {
        let store = Rc::new(Store::open_in_memory().unwrap());
        Engine::new(store, EngineOptions::default()).unwrap()
    }

    /// Captures its first seed into node state; later renders keep it.
    struct Sticky {
        id: String,
        seed: String,
    }

    impl Component for Sticky {
        fn type_name(&self) -> &'static str {
            "Sticky"
        }

        fn key(&self) -> Option<&str> {
            Some(&self.id)
        }

        fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
            let seed = self.seed.clone();
            let (value, _) = cx.use_state(move || seed);
            Ok(HostElement::new("sticky").attr("value", value).into())
        }
    }

    #[test]
    fn same_key_preserves_node_state_across_prop_changes() {
        let mut engine = test_engine();
        engine.render(Element::component(Sticky {
            id: "a".into(),
            seed: "first".into(),
        }));
        engine.settle_sync();
        assert!(engine.to_serialized_form().contains("value=\"first\""));

        // Same (type, key): the node and its state slot are reused.
        engine.render(Element::component(Sticky {
            id: "a".into(),
            seed: "second".into(),
        }));
        engine.settle_sync();
        assert!(engine.to_serialized_form().contains("value=\"first\""));

        // Different key: old node unmounts, fresh state.
        engine.render(Element::component(Sticky {
            id: "b".into(),
            seed: "third".into(),
        }));
        engine.settle_sync();
        assert!(engine.to_serialized_form().contains("value=\"third\""));
    }

    struct Logged {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        child: Option<Box<Logged>>,
    }

    impl Component for Logged {
        fn type_name(&self) -> &'static str {
            "Logged"
        }

        fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
            let name = self.name;
            {
                let log = Rc::clone(&self.log);
                cx.use_mount(move || log.borrow_mut().push(format!("mount:{}", name)));
            }
            {
                let log = Rc::clone(&self.log);
                cx.use_unmount(move || log.borrow_mut().push(format!("unmount:{}", name)));
            }
            {
                let log = Rc::clone(&self.log);
                cx.use_unmount(move || log.borrow_mut().push(format!("unmount2:{}", name)));
            }
            Ok(match &self.child {
                Some(child) => Element::component(Logged {
                    name: child.name,
                    log: Rc::clone(&child.log),
                    child: None,
                }),
                None => Element::Empty,
            })
        }
    }

    #[test]
    fn mount_effects_run_children_first_and_unmount_reverses() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut engine = test_engine();
        engine.render(Element::component(Logged {
            name: "parent",
            log: Rc::clone(&log),
            child: Some(Box::new(Logged {
                name: "child",
                log: Rc::clone(&log),
                child: None,
            })),
        }));
        engine.settle_sync();
        assert_eq!(*log.borrow(), vec!["mount:child", "mount:parent"]);

        log.borrow_mut().clear();
        engine.dispose();
        // Children unmount before parents; within a node, cleanups run in
        // reverse declaration order.
        assert_eq!(
            *log.borrow(),
            vec![
                "unmount2:child",
                "unmount:child",
                "unmount2:parent",
                "unmount:parent"
            ]
        );
    }

    struct Boom;

    impl Component for Boom {
        fn type_name(&self) -> &'static str {
            "Boom"
        }

        fn render(&self, _cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
            Err(RenderError::author("Boom", "kaboom"))
        }
    }

    #[test]
    fn render_error_unmounts_the_subtree_and_skips_later_siblings() {
        let errors: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let errors_cb = Rc::clone(&errors);
        let store = Rc::new(Store::open_in_memory().unwrap());
        let options = EngineOptions::default()
            .with_on_error(move |e| errors_cb.borrow_mut().push(e.to_string()));
        let mut engine = Engine::new(store, options).unwrap();

        engine.render(Element::fragment(vec![
            HostElement::new("before").into(),
            Element::component(Boom),
            HostElement::new("after").into(),
        ]));
        engine.settle_sync();

        let errors = errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("kaboom"), "{}", errors[0]);

        let serialized = engine.to_serialized_form();
        assert!(serialized.contains("<before/>"));
        assert!(!serialized.contains("<after/>"));
    }

    struct Watcher;

    impl Component for Watcher {
        fn type_name(&self) -> &'static str {
            "Watcher"
        }

        fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError> {
            let rows = cx.use_subscription(
                "SELECT value FROM state WHERE key = 'watched'",
                vec![],
            )?;
            let value = rows
                .first()
                .and_then(|row| row.get("value"))
                .and_then(|v| v.as_str())
                .unwrap_or("unset")
                .to_string();
            Ok(HostElement::new("watcher").attr("value", value).into())
        }
    }

    #[test]
    fn subscription_change_re_renders_the_node() {
        let mut engine = test_engine();
        let store = engine.store();
        engine.render(Element::component(Watcher));
        engine.settle_sync();
        assert!(engine.to_serialized_form().contains("unset"));

        store.state().set("watched", &"hello", "test").unwrap();
        engine.settle_sync();
        assert!(engine.to_serialized_form().contains("hello"));

        // An unrelated key leaves the cached result (and the tree) alone.
        let before = engine.to_serialized_form();
        store.state().set("other", &1, "test").unwrap();
        engine.settle_sync();
        assert_eq!(before, engine.to_serialized_form());
    }

    #[test]
    fn text_and_empty_children_serialize_canonically() {
        let mut engine = test_engine();
        engine.render(Element::fragment(vec![
            Element::text("hi & <bye>"),
            Element::Empty,
            HostElement::new("leaf").attr("flag", true).attr("n", 7).into(),
        ]));
        engine.settle_sync();
        assert_eq!(
            engine.to_serialized_form(),
            "<root><TEXT value=\"hi &amp; &lt;bye&gt;\"/><leaf flag=\"true\" n=\"7\"/></root>"
        );
    }

    #[test]
    fn engine_startup_opens_a_running_execution() {
        let engine = test_engine();
        let store = engine.store();
        let execution = store.executions().current().unwrap().unwrap();
        assert_eq!(execution.status, "running");
        assert_eq!(execution.name, "workflow");
    }

    #[test]
    fn dispose_twice_is_harmless() {
        let mut engine = test_engine();
        engine.render(Element::component(Watcher));
        engine.settle_sync();
        engine.dispose();
        engine.dispose();
        assert_eq!(engine.to_serialized_form(), "");
    }
}
