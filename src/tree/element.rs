//! The element model: what authors hand to the engine.
//!
//! An element is a description, not a live object. Components expand to a
//! child element when rendered; host elements become passive placeholder
//! nodes with serializable attributes; fragments splice; `Empty` renders
//! nothing while keeping its position identity.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;

use crate::errors::RenderError;
use crate::tree::hooks::RenderCtx;

/// Serializable attributes of a host element, ordered by key.
pub type Attrs = BTreeMap<String, Value>;

/// A renderable component. Implementations hold their props and expand to a
/// child element; per-node state lives in hook slots owned by the tree, so
/// replacing a component instance with fresh props preserves its state.
pub trait Component {
    /// Stable name used for node identity and the serialized form.
    fn type_name(&self) -> &'static str;

    /// Explicit diffing key, overriding positional identity.
    fn key(&self) -> Option<&str> {
        None
    }

    fn render(&self, cx: &mut RenderCtx<'_>) -> Result<Element, RenderError>;
}

/// A node description in the authored tree.
#[derive(Clone)]
pub enum Element {
    Component(Rc<dyn Component>),
    Host(Rc<HostElement>),
    Text(String),
    Fragment(Vec<Element>),
    Empty,
}

impl Element {
    /// Wrap a component value.
    pub fn component(c: impl Component + 'static) -> Self {
        Self::Component(Rc::new(c))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn fragment(children: Vec<Element>) -> Self {
        Self::Fragment(children)
    }

    /// The diffing key of this element, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Component(c) => c.key(),
            Self::Host(h) => h.key.as_deref(),
            _ => None,
        }
    }
}

impl From<HostElement> for Element {
    fn from(host: HostElement) -> Self {
        Self::Host(Rc::new(host))
    }
}

/// An intrinsic element: a tag, attributes, children. Host nodes carry no
/// behavior; they exist for structural visibility and serialization.
#[derive(Clone)]
pub struct HostElement {
    pub tag: String,
    pub key: Option<String>,
    pub attrs: Attrs,
    pub children: Vec<Element>,
}

impl HostElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            key: None,
            attrs: Attrs::new(),
            children: Vec::new(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
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
}

/// Flatten fragments into a positional child list. `Empty` survives as a
/// placeholder so siblings keep stable positions.
pub fn normalize(el: Element) -> Vec<Element> {
    match el {
        Element::Fragment(children) => children.into_iter().flat_map(normalize).collect(),
        other => vec![other],
    }
}

/// Canonical string form of an attribute value: bare strings stay as-is,
/// booleans and integers use their decimal/text forms, everything else is
/// JSON text.
pub fn canonical_attr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_flattens_nested_fragments() {
        let el = Element::fragment(vec![
            Element::text("a"),
            Element::fragment(vec![Element::text("b"), Element::Empty]),
            Element::text("c"),
        ]);
        let flat = normalize(el);
        assert_eq!(flat.len(), 4);
        assert!(matches!(flat[2], Element::Empty));
    }

    #[test]
    fn canonical_attr_forms() {
        assert_eq!(canonical_attr(&Value::from("x")), "x");
        assert_eq!(canonical_attr(&Value::from(true)), "true");
        assert_eq!(canonical_attr(&Value::from(42)), "42");
        assert_eq!(canonical_attr(&Value::Null), "null");
        assert_eq!(canonical_attr(&serde_json::json!([1, 2])), "[1,2]");
    }

    #[test]
    fn host_builder_orders_attrs_by_key() {
        let host = HostElement::new("phase").attr("z", 1).attr("a", 2);
        let keys: Vec<&String> = host.attrs.keys().collect();
        assert_eq!(keys, vec!["a", "z"]);
    }
}
