//! Tag-and-attribute serialization of the mounted tree.
//!
//! Component nodes are transparent: the serialized form shows only host
//! placeholders, text, and structure, which is what inspection and tests
//! compare. Attributes render in key order with canonical string forms, so
//! two serializations of an unchanged tree are byte-equal.

use serde_json::{Value, json};

use super::element::canonical_attr;
use super::reconciler::Reconciler;
use super::{NodeId, NodeKind};

/// Render the tree as an XML-like string.
pub fn to_serialized_form(rec: &Reconciler) -> String {
    let mut out = String::new();
    if let Some(root) = rec.root() {
        write_node(rec, root, &mut out);
    }
    out
}

/// Render the tree as a JSON snapshot: `{tag, attrs, children}`.
pub fn to_tree_snapshot(rec: &Reconciler) -> Value {
    match rec.root() {
        Some(root) => node_snapshot(rec, root).unwrap_or(Value::Null),
        None => Value::Null,
    }
}

fn write_node(rec: &Reconciler, id: NodeId, out: &mut String) {
    let Some(node) = rec.nodes().get(&id.0) else {
        return;
    };
    match &node.kind {
        NodeKind::Component { .. } => {
            for child in &node.children {
                write_node(rec, *child, out);
            }
        }
        NodeKind::Empty => {}
        NodeKind::Text { value } => {
            out.push_str("<TEXT value=\"");
            out.push_str(&escape(value));
            out.push_str("\"/>");
        }
        NodeKind::Host { tag, attrs } => {
            out.push('<');
            out.push_str(tag);
            for (name, value) in attrs {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&escape(&canonical_attr(value)));
                out.push('"');
            }
            if node.children.is_empty() {
                out.push_str("/>");
            } else {
                out.push('>');
                for child in &node.children {
                    write_node(rec, *child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn node_snapshot(rec: &Reconciler, id: NodeId) -> Option<Value> {
    let node = rec.nodes().get(&id.0)?;
    match &node.kind {
        NodeKind::Component { .. } => {
            let children = children_snapshots(rec, &node.children);
            // A component with a single child collapses to it.
            match children.len() {
                0 => None,
                1 => Some(children.into_iter().next().unwrap_or(Value::Null)),
                _ => Some(json!({ "tag": "fragment", "attrs": {}, "children": children })),
            }
        }
        NodeKind::Empty => None,
        NodeKind::Text { value } => Some(json!({
            "tag": "TEXT",
            "attrs": { "value": value },
            "children": [],
        })),
        NodeKind::Host { tag, attrs } => {
            let attr_map: serde_json::Map<String, Value> = attrs
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(canonical_attr(v))))
                .collect();
            Some(json!({
                "tag": tag,
                "attrs": attr_map,
                "children": children_snapshots(rec, &node.children),
            }))
        }
    }
}

fn children_snapshots(rec: &Reconciler, children: &[NodeId]) -> Vec<Value> {
    children
        .iter()
        .filter_map(|child| node_snapshot(rec, *child))
        .collect()
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
