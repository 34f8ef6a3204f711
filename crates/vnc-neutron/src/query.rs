//! Traversal assembly for the translator.
//!
//! Queries accumulate step by step with whitespace stripped, so templates
//! can be written readably; every caller-provided value goes through a
//! named binding, never into the query string.

use std::collections::BTreeMap;

use serde_json::Value as Json;
use tracing::warn;

use vnc_graph::client::Bindings;

/// A compiled traversal: query text plus bindings.
#[derive(Debug, Clone, Default)]
pub struct Query {
    text: String,
    pub bindings: Bindings,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    /// Append a step with all whitespace stripped.
    pub fn add(&mut self, step: &str) {
        self.text.extend(step.split_whitespace());
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Json) {
        self.bindings.insert(name.into(), value);
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Bind a filter's values: a scalar binding for one value, `within(...)`
/// over indexed bindings for several. Binding names are `_f<key>` with
/// colons mapped to underscores.
pub fn filter_values(key: &str, values: &[Json], bindings: &mut Bindings) -> Option<String> {
    let safe = key.replace(':', "_");
    match values {
        [] => None,
        [value] => {
            let name = format!("_f{safe}");
            bindings.insert(name.clone(), value.clone());
            Some(name)
        }
        values => {
            let names: Vec<String> = values
                .iter()
                .enumerate()
                .map(|(i, value)| {
                    let name = format!("_f{safe}_{i}");
                    bindings.insert(name.clone(), value.clone());
                    name
                })
                .collect();
            Some(format!("within({})", names.join(",")))
        }
    }
}

/// Apply the filters common to every resource; resource-specific keys go
/// to the callback, which logs and ignores unknowns.
pub fn apply_filters<F>(
    query: &mut Query,
    filters: &BTreeMap<String, Vec<Json>>,
    mut resource: F,
) where
    F: FnMut(&mut Query, &str, &str),
{
    for (key, values) in filters {
        let Some(value) = filter_values(key, values, &mut query.bindings) else {
            continue;
        };
        match key.as_str() {
            "id" => query.add(&format!(".has(id, {value})")),
            "name" => query.add(&format!(".has('display_name', {value})")),
            "description" => query.add(&format!(
                ".where(values('id_perms').select('description').is({value}))"
            )),
            "admin_state_up" => query.add(&format!(
                ".where(values('id_perms').select('enable').is({value}))"
            )),
            _ => resource(query, key, &value),
        }
    }
}

/// Validate requested fields against the resource's allow-list; unknown
/// fields are dropped with a warning. An empty request means all fields.
pub fn validate_fields(wanted: &[String], allowed: &[&str]) -> Vec<String> {
    if wanted.is_empty() {
        return allowed.iter().map(|s| s.to_string()).collect();
    }
    wanted
        .iter()
        .filter(|field| {
            let known = allowed.contains(&field.as_str());
            if !known {
                warn!(field = %field, "No implementation for field");
            }
            known
        })
        .cloned()
        .collect()
}

/// Emit `.project(...)` and one `.by(...)` per field in request order.
/// Fields common to all resources are handled here; the rest go to the
/// callback.
pub fn apply_projection<F>(query: &mut Query, fields: &[String], mut resource: F)
where
    F: FnMut(&mut Query, &str),
{
    let quoted: Vec<String> = fields.iter().map(|f| format!("'{f}'")).collect();
    query.add(&format!(".project({})", quoted.join(",")));
    for field in fields {
        match field.as_str() {
            "id" => query.add(".by(id)"),
            "name" => query.add(
                ".by(
                    coalesce(
                        values('display_name'),
                        constant('')
                    )
                )",
            ),
            "description" => query.add(
                ".by(
                    coalesce(
                        values('id_perms').select('description'),
                        constant('')
                    )
                )",
            ),
            "created_at" => query.add(".by(values('id_perms').select('created'))"),
            "updated_at" => query.add(".by(values('id_perms').select('last_modified'))"),
            "admin_state_up" => query.add(".by(values('id_perms').select('enable'))"),
            other => resource(query, other),
        }
    }
}
