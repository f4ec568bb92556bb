//! Diffing engine: expands elements into nodes, reuses nodes by
//! `(type, key)`, and commits mount/effect/unmount callbacks.
//!
//! Renders are synchronous within a tick. The engine marks nodes dirty (from
//! state setters and subscription callbacks) and calls `flush_dirty` until
//! the tree settles; queued effects run after the render that produced them,
//! children before parents.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

use super::element::{Element, HostElement, normalize};
use super::hooks::{RenderCtx, Slot};
use super::{Node, NodeId, NodeKind};
use crate::engine::Env;
use crate::errors::RenderError;

/// A render failure, located by the element path from the root.
pub struct RenderFailure {
    pub path: String,
    pub error: RenderError,
}

pub struct Reconciler {
    nodes: HashMap<u64, Node>,
    next_id: u64,
    root: Option<NodeId>,
    dirty: BTreeSet<(usize, u64)>,
    effects: VecDeque<Box<dyn FnOnce()>>,
    /// Needed to detach node subscriptions on unmount.
    store: Rc<crate::store::Store>,
}

impl Reconciler {
    pub fn new(store: Rc<crate::store::Store>) -> Self {
        Self {
            nodes: HashMap::new(),
            next_id: 0,
            root: None,
            dirty: BTreeSet::new(),
            effects: VecDeque::new(),
            store,
        }
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn nodes(&self) -> &HashMap<u64, Node> {
        &self.nodes
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn has_effects(&self) -> bool {
        !self.effects.is_empty()
    }

    /// Schedule a re-render of one node.
    pub fn mark_dirty(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get(&id.0) {
            self.dirty.insert((node.depth, id.0));
        }
    }

    /// Mount or update the authored tree under an implicit root node.
    pub fn render_root(&mut self, el: Element, env: &Env) -> Result<(), RenderFailure> {
        let root = match self.root {
            Some(root) => root,
            None => {
                let id = self.alloc(Node::new(
                    None,
                    NodeKind::Host {
                        tag: "root".to_string(),
                        attrs: Default::default(),
                    },
                    None,
                    0,
                ));
                self.root = Some(id);
                id
            }
        };
        self.reconcile_children(root, normalize(el), env)
    }

    /// Re-render every dirty component, parents before descendants.
    pub fn flush_dirty(&mut self, env: &Env) -> Result<(), RenderFailure> {
        while let Some(&(depth, raw)) = self.dirty.iter().next() {
            self.dirty.remove(&(depth, raw));
            if !self.nodes.contains_key(&raw) {
                continue;
            }
            let id = NodeId(raw);
            if matches!(
                self.nodes.get(&raw).map(|n| &n.kind),
                Some(NodeKind::Component { .. })
            ) {
                self.render_component(id, env).map_err(|error| {
                    let path = self.node_path(id);
                    self.unmount(id, true);
                    self.detach_from_parent(id);
                    RenderFailure { path, error }
                })?;
            }
        }
        Ok(())
    }

    /// Run every queued effect, in commit order.
    pub fn run_effects(&mut self) -> usize {
        let mut ran = 0;
        while let Some(effect) = self.effects.pop_front() {
            effect();
            ran += 1;
        }
        ran
    }

    /// Unmount everything. Safe to call twice.
    pub fn dispose(&mut self) {
        if let Some(root) = self.root.take() {
            self.unmount(root, true);
        }
        self.dirty.clear();
        self.effects.clear();
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn alloc(&mut self, node: Node) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.nodes.insert(id.0, node);
        id
    }

    /// Slash-joined type/tag path from the root to `id`.
    fn node_path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let Some(node) = self.nodes.get(&node_id.0) else {
                break;
            };
            let label = match &node.kind {
                NodeKind::Component { type_name, .. } => (*type_name).to_string(),
                NodeKind::Host { tag, .. } => tag.clone(),
                NodeKind::Text { .. } => "TEXT".to_string(),
                NodeKind::Empty => "()".to_string(),
            };
            match &node.key {
                Some(key) => parts.push(format!("{}[{}]", label, key)),
                None => parts.push(label),
            }
            current = node.parent;
        }
        parts.reverse();
        parts.join("/")
    }

    fn render_component(&mut self, id: NodeId, env: &Env) -> Result<(), RenderError> {
        let component = match self.nodes.get_mut(&id.0) {
            Some(node) => {
                node.provided.clear();
                match &node.kind {
                    NodeKind::Component { component, .. } => Rc::clone(component),
                    _ => return Ok(()),
                }
            }
            None => return Ok(()),
        };
        if let Some(node) = self.nodes.get(&id.0) {
            self.dirty.remove(&(node.depth, id.0));
        }

        let (output, pending) = {
            let mut cx = RenderCtx {
                nodes: &mut self.nodes,
                node: id,
                cursor: 0,
                env,
                pending: Vec::new(),
            };
            let output = component.render(&mut cx);
            let pending = cx.take_pending();
            (output, pending)
        };

        let child = output?;
        self.reconcile_children(id, normalize(child), env)
            .map_err(|failure| failure.error)?;
        // The node's own effects commit after its children's (children-first).
        self.effects.extend(pending);
        Ok(())
    }

    fn reconcile_children(
        &mut self,
        parent: NodeId,
        elements: Vec<Element>,
        env: &Env,
    ) -> Result<(), RenderFailure> {
        let old_children = self
            .nodes
            .get(&parent.0)
            .map(|n| n.children.clone())
            .unwrap_or_default();

        // Split the previous children into keyed and positional pools.
        let mut keyed: HashMap<String, NodeId> = HashMap::new();
        let mut positional: VecDeque<NodeId> = VecDeque::new();
        for child in &old_children {
            match self.nodes.get(&child.0).and_then(|n| n.key.clone()) {
                Some(key) => {
                    keyed.insert(key, *child);
                }
                None => positional.push_back(*child),
            }
        }

        let mut new_children = Vec::with_capacity(elements.len());
        for el in elements {
            let old = match el.key() {
                Some(key) => keyed.remove(key),
                None => positional.pop_front(),
            };
            match self.reconcile(parent, old, el, env) {
                Ok(child) => new_children.push(child),
                Err(error) => {
                    // Siblings after the failing element do not render this
                    // pass; leftovers stay mounted (and reachable) for the
                    // next attempt.
                    new_children.extend(keyed.into_values());
                    new_children.extend(positional);
                    if let Some(node) = self.nodes.get_mut(&parent.0) {
                        node.children = new_children;
                    }
                    return Err(error);
                }
            }
        }

        for leftover in keyed.into_values().chain(positional) {
            self.unmount(leftover, true);
        }
        if let Some(node) = self.nodes.get_mut(&parent.0) {
            node.children = new_children;
        }
        Ok(())
    }

    fn reconcile(
        &mut self,
        parent: NodeId,
        old: Option<NodeId>,
        el: Element,
        env: &Env,
    ) -> Result<NodeId, RenderFailure> {
        let depth = self.nodes.get(&parent.0).map(|n| n.depth + 1).unwrap_or(1);
        match el {
            Element::Component(component) => {
                let type_name = component.type_name();
                let key = component.key().map(|k| k.to_string());
                let id = match old {
                    Some(old_id) if self.is_same_component(old_id, type_name, &key) => {
                        if let Some(node) = self.nodes.get_mut(&old_id.0) {
                            node.kind = NodeKind::Component {
                                component: Rc::clone(&component),
                                type_name,
                            };
                        }
                        old_id
                    }
                    other => {
                        if let Some(stale) = other {
                            self.unmount(stale, true);
                        }
                        self.alloc(Node::new(
                            Some(parent),
                            NodeKind::Component {
                                component: Rc::clone(&component),
                                type_name,
                            },
                            key,
                            depth,
                        ))
                    }
                };
                self.render_component(id, env).map_err(|error| {
                    let path = self.node_path(id);
                    self.unmount(id, true);
                    RenderFailure { path, error }
                })?;
                Ok(id)
            }
            Element::Host(host) => {
                let id = match old {
                    Some(old_id) if self.is_same_host(old_id, &host) => {
                        if let Some(node) = self.nodes.get_mut(&old_id.0) {
                            node.kind = NodeKind::Host {
                                tag: host.tag.clone(),
                                attrs: host.attrs.clone(),
                            };
                        }
                        old_id
                    }
                    other => {
                        if let Some(stale) = other {
                            self.unmount(stale, true);
                        }
                        self.alloc(Node::new(
                            Some(parent),
                            NodeKind::Host {
                                tag: host.tag.clone(),
                                attrs: host.attrs.clone(),
                            },
                            host.key.clone(),
                            depth,
                        ))
                    }
                };
                self.reconcile_children(id, host.children.clone(), env)?;
                Ok(id)
            }
            Element::Text(value) => match old {
                Some(old_id)
                    if matches!(
                        self.nodes.get(&old_id.0).map(|n| &n.kind),
                        Some(NodeKind::Text { .. })
                    ) =>
                {
                    if let Some(node) = self.nodes.get_mut(&old_id.0) {
                        node.kind = NodeKind::Text { value };
                    }
                    Ok(old_id)
                }
                other => {
                    if let Some(stale) = other {
                        self.unmount(stale, true);
                    }
                    Ok(self.alloc(Node::new(
                        Some(parent),
                        NodeKind::Text { value },
                        None,
                        depth,
                    )))
                }
            },
            Element::Empty => match old {
                Some(old_id)
                    if matches!(
                        self.nodes.get(&old_id.0).map(|n| &n.kind),
                        Some(NodeKind::Empty)
                    ) =>
                {
                    Ok(old_id)
                }
                other => {
                    if let Some(stale) = other {
                        self.unmount(stale, true);
                    }
                    Ok(self.alloc(Node::new(Some(parent), NodeKind::Empty, None, depth)))
                }
            },
            Element::Fragment(children) => {
                // Fragments are flattened by `normalize` before reaching
                // here; a stray one behaves as an anonymous host.
                let host = HostElement {
                    tag: "fragment".to_string(),
                    key: None,
                    attrs: Default::default(),
                    children,
                };
                self.reconcile(parent, old, Element::Host(Rc::new(host)), env)
            }
        }
    }

    fn is_same_component(&self, id: NodeId, type_name: &str, key: &Option<String>) -> bool {
        match self.nodes.get(&id.0) {
            Some(node) => {
                matches!(&node.kind, NodeKind::Component { type_name: existing, .. } if *existing == type_name)
                    && node.key == *key
            }
            None => false,
        }
    }

    fn is_same_host(&self, id: NodeId, host: &HostElement) -> bool {
        match self.nodes.get(&id.0) {
            Some(node) => {
                matches!(&node.kind, NodeKind::Host { tag, .. } if *tag == host.tag)
                    && node.key == host.key
            }
            None => false,
        }
    }

    /// Tear down a subtree: children first, then this node's cleanups in
    /// reverse declaration order, then drop the node.
    fn unmount(&mut self, id: NodeId, run_cleanups: bool) {
        let children = self
            .nodes
            .get(&id.0)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        for child in children {
            self.unmount(child, run_cleanups);
        }

        if let Some(mut node) = self.nodes.remove(&id.0) {
            self.dirty.remove(&(node.depth, id.0));
            for slot in node.slots.iter_mut().rev() {
                match slot {
                    Slot::Unmount { cleanup } => {
                        if run_cleanups {
                            if let Some(cleanup) = cleanup.take() {
                                cleanup();
                            }
                        }
                    }
                    Slot::Subscription(sub) => {
                        self.store.reactive().unsubscribe(sub.id);
                    }
                    _ => {}
                }
            }
        }
    }

    fn detach_from_parent(&mut self, id: NodeId) {
        let parent = self.nodes.values_mut().find(|n| n.children.contains(&id));
        if let Some(parent) = parent {
            parent.children.retain(|c| *c != id);
        }
    }
}
