//! Vertex and edge model.
//!
//! Decoded resources become a [`Vertex`] with multi-valued properties and
//! `parent`/`ref` edges on both sides. Edge identity is the
//! `(out_v, in_v, label)` triple; labels on the far endpoints are carried
//! when the source row provided them.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::value::PropValue;

/// A directed, labeled edge between two vertices.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Edge {
    pub label: String,
    pub out_v: Uuid,
    pub out_v_label: Option<String>,
    pub in_v: Uuid,
    pub in_v_label: Option<String>,
    pub properties: BTreeMap<String, PropValue>,
}

impl Edge {
    /// Logical identity of the edge.
    pub fn identity(&self) -> (Uuid, Uuid, &str) {
        (self.out_v, self.in_v, self.label.as_str())
    }

    /// True when both edges denote the same `(out_v, in_v, label)` triple.
    pub fn same_identity(&self, other: &Edge) -> bool {
        self.identity() == other.identity()
    }

    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<PropValue>) {
        self.properties.entry(name.into()).or_insert_with(|| value.into());
    }
}

/// A config resource decoded into graph form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vertex {
    pub id: Uuid,
    pub label: String,
    pub properties: BTreeMap<String, Vec<PropValue>>,
    pub in_e: BTreeMap<String, Vec<Edge>>,
    pub out_e: BTreeMap<String, Vec<Edge>>,
}

impl Vertex {
    pub fn new(id: Uuid) -> Self {
        Vertex { id, ..Default::default() }
    }

    /// Append a value to the property's list (multi-property semantics).
    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<PropValue>) {
        self.properties.entry(name.into()).or_default().push(value.into());
    }

    /// Set a single-valued property, replacing any existing values.
    pub fn set_single_property(&mut self, name: impl Into<String>, value: impl Into<PropValue>) {
        self.properties.insert(name.into(), vec![value.into()]);
    }

    pub fn has_prop(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// True when the property exists either as `name` or flattened under
    /// `name.` — the decoder stores most objects as dotted paths.
    pub fn has_prop_or_child(&self, name: &str) -> bool {
        if self.has_prop(name) {
            return true;
        }
        let prefix = format!("{name}.");
        self.properties.keys().any(|k| k.starts_with(&prefix))
    }

    /// Look up a value by dotted path.
    ///
    /// Most properties are stored flattened under their full dotted name,
    /// so the exact key wins. Otherwise the longest property-name prefix is
    /// taken and the remaining components descend into its nested (opaque)
    /// map value.
    pub fn property_value(&self, path: &str) -> Option<&PropValue> {
        if let Some(values) = self.properties.get(path) {
            return values.first();
        }
        let mut split = path.len();
        while let Some(pos) = path[..split].rfind('.') {
            split = pos;
            let (head, rest) = (&path[..pos], &path[pos + 1..]);
            if let Some(values) = self.properties.get(head) {
                let mut current = values.first()?;
                for key in rest.split('.') {
                    current = current.get(key)?;
                }
                return Some(current);
            }
        }
        None
    }

    pub fn add_in_edge(&mut self, edge: Edge) {
        self.in_e.entry(edge.label.clone()).or_default().push(edge);
    }

    pub fn add_out_edge(&mut self, edge: Edge) {
        self.out_e.entry(edge.label.clone()).or_default().push(edge);
    }

    /// All edges of the vertex, both directions, in label order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.out_e.values().flatten().chain(self.in_e.values().flatten())
    }

    /// True when the decoder marked the resource as missing required fields.
    pub fn is_incomplete(&self) -> bool {
        self.has_prop("_incomplete")
    }
}
