//! Per-node state slots and the render context handed to components.
//!
//! Slots are keyed by render-order call index: a component must call its
//! hooks unconditionally and in a fixed order, the same discipline a
//! closure-based implementation would enforce implicitly. Slot values
//! survive re-renders; they are dropped when the node unmounts.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use super::{Node, NodeId};
use crate::engine::{Env, EngineHandle};
use crate::errors::RenderError;
use crate::store::{Rows, SubscriptionId};

pub(crate) enum Slot {
    State(Rc<dyn Any>),
    Ref(Rc<dyn Any>),
    Mount { done: bool },
    Unmount { cleanup: Option<Box<dyn FnOnce()>> },
    Effect { deps: Option<Value> },
    Subscription(SubSlot),
}

pub(crate) struct SubSlot {
    pub id: SubscriptionId,
    pub sql: String,
    pub params: Vec<Value>,
    pub skip: bool,
}

/// Writes a state slot and schedules a re-render of its node.
pub struct Setter<T> {
    cell: Rc<RefCell<T>>,
    node: NodeId,
    handle: EngineHandle,
}

impl<T> Clone for Setter<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
            node: self.node,
            handle: self.handle.clone(),
        }
    }
}

impl<T: 'static> Setter<T> {
    pub fn set(&self, value: T) {
        *self.cell.borrow_mut() = value;
        self.handle.mark_dirty(self.node);
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.cell.borrow_mut());
        self.handle.mark_dirty(self.node);
    }
}

/// The context a component renders against: its node's slots, the context
/// chain above it, and the engine environment.
pub struct RenderCtx<'a> {
    pub(crate) nodes: &'a mut HashMap<u64, Node>,
    pub(crate) node: NodeId,
    pub(crate) cursor: usize,
    pub(crate) env: &'a Env,
    /// Effects queued by this render, appended to the commit queue after the
    /// node's children have rendered (children-first commit order).
    pub(crate) pending: Vec<Box<dyn FnOnce()>>,
}

impl RenderCtx<'_> {
    /// The engine environment (store, handle, options), cloneable into
    /// effects and spawned futures.
    pub fn env(&self) -> Env {
        self.env.clone()
    }

    pub fn store(&self) -> Rc<crate::store::Store> {
        Rc::clone(&self.env.store)
    }

    pub fn handle(&self) -> EngineHandle {
        self.env.handle.clone()
    }

    fn node_mut(&mut self) -> &mut Node {
        self.nodes
            .get_mut(&self.node.0)
            .unwrap_or_else(|| unreachable!("render context for unmounted node"))
    }

    fn next_slot(&mut self) -> usize {
        let idx = self.cursor;
        self.cursor += 1;
        idx
    }

    /// A per-node value preserved across renders. Writing through the setter
    /// schedules a re-render.
    pub fn use_state<T: Clone + 'static>(&mut self, init: impl FnOnce() -> T) -> (T, Setter<T>) {
        let idx = self.next_slot();
        let node_id = self.node;
        let handle = self.env.handle.clone();
        let node = self.node_mut();
        let mut init = Some(init);
        let mut init = move || (init.take().expect("init called more than once"))();

        if idx >= node.slots.len() {
            node.slots
                .push(Slot::State(Rc::new(RefCell::new(init())) as Rc<dyn Any>));
        }
        let cell = match &node.slots[idx] {
            Slot::State(any) => Rc::downcast::<RefCell<T>>(Rc::clone(any)).ok(),
            _ => None,
        };
        let cell = match cell {
            Some(cell) => cell,
            None => {
                // Type changed across renders; reset the slot.
                let fresh = Rc::new(RefCell::new(init()));
                node.slots[idx] = Slot::State(Rc::clone(&fresh) as Rc<dyn Any>);
                fresh
            }
        };
        let value = cell.borrow().clone();
        (
            value,
            Setter {
                cell,
                node: node_id,
                handle,
            },
        )
    }

    /// Like `use_state`, but writes never trigger a re-render.
    pub fn use_ref<T: 'static>(&mut self, init: impl FnOnce() -> T) -> Rc<RefCell<T>> {
        let idx = self.next_slot();
        let node = self.node_mut();
        let mut init = Some(init);
        let mut init = move || (init.take().expect("init called more than once"))();
        if idx >= node.slots.len() {
            node.slots
                .push(Slot::Ref(Rc::new(RefCell::new(init())) as Rc<dyn Any>));
        }
        match &node.slots[idx] {
            Slot::Ref(any) => {
                if let Ok(cell) = Rc::downcast::<RefCell<T>>(Rc::clone(any)) {
                    return cell;
                }
            }
            _ => {}
        }
        let fresh = Rc::new(RefCell::new(init()));
        node.slots[idx] = Slot::Ref(Rc::clone(&fresh) as Rc<dyn Any>);
        fresh
    }

    /// Queue `f` to run once, after the first commit of this node.
    pub fn use_mount(&mut self, f: impl FnOnce() + 'static) {
        let idx = self.next_slot();
        let node = self.node_mut();
        if idx >= node.slots.len() {
            node.slots.push(Slot::Mount { done: false });
        }
        let run = match &mut node.slots[idx] {
            Slot::Mount { done } => {
                let run = !*done;
                *done = true;
                run
            }
            _ => false,
        };
        if run {
            self.pending.push(Box::new(f));
        }
    }

    /// Register the cleanup to run when this node unmounts. The latest
    /// registration wins, so closures capture current props.
    pub fn use_unmount(&mut self, f: impl FnOnce() + 'static) {
        let idx = self.next_slot();
        let node = self.node_mut();
        if idx >= node.slots.len() {
            node.slots.push(Slot::Unmount { cleanup: None });
        }
        if let Slot::Unmount { cleanup } = &mut node.slots[idx] {
            *cleanup = Some(Box::new(f));
        }
    }

    /// Queue `f` whenever `deps` differs (by equality) from the previous
    /// render. Runs on first render too.
    pub fn use_effect(&mut self, deps: Value, f: impl FnOnce() + 'static) {
        let idx = self.next_slot();
        let node = self.node_mut();
        if idx >= node.slots.len() {
            node.slots.push(Slot::Effect { deps: None });
        }
        let run = match &mut node.slots[idx] {
            Slot::Effect { deps: previous } => {
                let changed = previous.as_ref() != Some(&deps);
                *previous = Some(deps);
                changed
            }
            _ => false,
        };
        if run {
            self.pending.push(Box::new(f));
        }
    }

    /// Bind a reactive-layer subscription to this node; the node re-renders
    /// whenever the query result changes. The cached result is returned.
    pub fn use_subscription(
        &mut self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Rc<Rows>, RenderError> {
        self.use_subscription_opt(sql, params, false)
    }

    /// Subscription with a `skip` switch: while skipped, evaluation is
    /// suspended and the cached result keeps being served.
    pub fn use_subscription_opt(
        &mut self,
        sql: &str,
        params: Vec<Value>,
        skip: bool,
    ) -> Result<Rc<Rows>, RenderError> {
        let idx = self.next_slot();
        let node_id = self.node;
        let env = self.env.clone();

        let existing = {
            let node = self.node_mut();
            match node.slots.get(idx) {
                Some(Slot::Subscription(sub)) => {
                    Some((sub.id, sub.sql == sql && sub.params == params, sub.skip))
                }
                _ => None,
            }
        };

        match existing {
            // Re-enabling a skipped subscription falls through to the
            // resubscribe path below, so it serves fresh rows instead of the
            // cache it stopped maintaining.
            Some((id, true, was_skipped)) if !(was_skipped && !skip) => {
                if skip && !was_skipped {
                    env.store.reactive().set_skip(id, true);
                    if let Slot::Subscription(sub) = &mut self.node_mut().slots[idx] {
                        sub.skip = true;
                    }
                }
                let rows = env
                    .store
                    .reactive()
                    .cached(id)
                    .unwrap_or_else(|| Rc::new(Rows::new()));
                Ok(rows)
            }
            other => {
                if let Some((stale, _, _)) = other {
                    env.store.reactive().unsubscribe(stale);
                }
                let handle = env.handle.clone();
                let notify: Rc<dyn Fn(Rc<Rows>)> =
                    Rc::new(move |_rows| handle.mark_dirty(node_id));
                let (id, rows) =
                    env.store
                        .reactive()
                        .subscribe(&env.store, sql, params.clone(), notify)?;
                if skip {
                    env.store.reactive().set_skip(id, true);
                }
                let slot = Slot::Subscription(SubSlot {
                    id,
                    sql: sql.to_string(),
                    params,
                    skip,
                });
                let node = self.node_mut();
                if idx >= node.slots.len() {
                    node.slots.push(slot);
                } else {
                    node.slots[idx] = slot;
                }
                Ok(rows)
            }
        }
    }

    /// Walk the parent chain for a context value of type `T`.
    pub fn use_context<T: 'static>(&self) -> Option<Rc<T>> {
        let wanted = TypeId::of::<T>();
        let mut current = Some(self.node);
        while let Some(id) = current {
            let node = self.nodes.get(&id.0)?;
            // A node's own provisions are visible to itself only when it is
            // an ancestor in a later render; during its own render the chain
            // starts at the parent.
            if id != self.node {
                for (type_id, value) in &node.provided {
                    if *type_id == wanted {
                        return Rc::clone(value).downcast::<T>().ok();
                    }
                }
            }
            current = node.parent;
        }
        None
    }

    /// Make `value` visible to this node's descendants for the rest of the
    /// tree's lifetime (re-provided on every render).
    pub fn provide_context<T: 'static>(&mut self, value: Rc<T>) {
        self.node_mut()
            .provided
            .push((TypeId::of::<T>(), value as Rc<dyn Any>));
    }

    pub(crate) fn take_pending(&mut self) -> Vec<Box<dyn FnOnce()>> {
        std::mem::take(&mut self.pending)
    }
}
