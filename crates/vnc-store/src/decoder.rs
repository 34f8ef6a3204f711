//! Resource decoder: row-set to vertex.
//!
//! `column1` has a colon-delimited shape classifying each fact. Property
//! JSON flattens into dotted paths except for the opaque whitelist, which
//! keeps nested structure intact for transforms and edge-level traversals.

use std::collections::BTreeMap;

use serde_json::Value as Json;
use tracing::warn;
use uuid::Uuid;

use vnc_graph::model::{Edge, Vertex};
use vnc_graph::transform::transform_vertex;
use vnc_graph::value::PropValue;

use crate::{Row, Store, StoreError};

/// Property paths whose JSON sub-structure is retained instead of being
/// flattened into dotted keys.
const OPAQUE_PATHS: &[&str] = &[
    "access_control_list_entries",
    "security_group_entries",
    "vrf_assign_table",
    "attr.ipam_subnets",
    "virtual_machine_interface_allowed_address_pairs",
];

/// Read and decode one resource.
pub async fn get_resource<S: Store + ?Sized>(store: &S, uuid: Uuid) -> Result<Vertex, StoreError> {
    let rows = store.resource_rows(uuid).await?;
    decode_resource(uuid, &rows)
}

/// Decode a row-set into a vertex. An empty row-set is a missing resource.
pub fn decode_resource(uuid: Uuid, rows: &[Row]) -> Result<Vertex, StoreError> {
    if rows.is_empty() {
        return Err(StoreError::ResourceNotFound(uuid));
    }

    let mut vertex = Vertex::new(uuid);
    let mut map_props: BTreeMap<String, BTreeMap<String, Json>> = BTreeMap::new();
    let mut list_props: BTreeMap<String, BTreeMap<usize, Json>> = BTreeMap::new();

    for row in rows {
        let parts: Vec<&str> = row.column1.split(':').collect();
        match parts[0] {
            "type" => {
                if let Some(label) = parse_json(uuid, &row.value).and_then(|v| match v {
                    Json::String(s) => Some(s),
                    _ => None,
                }) {
                    vertex.label = label;
                }
            }
            "fq_name" => {
                if let Some(value) = parse_json(uuid, &row.value) {
                    vertex.set_single_property("fq_name", PropValue::from(value));
                }
            }
            "prop" if parts.len() >= 2 => {
                if let Some(value) = parse_json(uuid, &row.value) {
                    add_properties(&mut vertex, parts[1], &value);
                }
            }
            "propm" if parts.len() >= 3 => {
                // Map entries arrive as `{"value": <v>}` keyed by the third
                // column1 component.
                if let Some(Json::Object(mut obj)) = parse_json(uuid, &row.value) {
                    if let Some(value) = obj.remove("value") {
                        map_props
                            .entry(parts[1].to_string())
                            .or_default()
                            .insert(parts[2].to_string(), value);
                    }
                }
            }
            "propl" if parts.len() >= 3 => {
                let Ok(idx) = parts[2].parse::<usize>() else {
                    warn!(uuid = %uuid, column1 = %row.column1, "propl without index");
                    continue;
                };
                if let Some(value) = parse_json(uuid, &row.value) {
                    list_props.entry(parts[1].to_string()).or_default().insert(idx, value);
                }
            }
            "ref" | "parent" if parts.len() >= 3 => {
                let Ok(in_v) = Uuid::parse_str(parts[2]) else {
                    warn!(uuid = %uuid, column1 = %row.column1, "edge column without UUID");
                    continue;
                };
                vertex.add_out_edge(Edge {
                    label: parts[0].to_string(),
                    out_v: uuid,
                    out_v_label: None,
                    in_v,
                    in_v_label: Some(parts[1].to_string()),
                    properties: edge_properties(&row.value),
                });
            }
            "backref" | "children" if parts.len() >= 3 => {
                let label = if parts[0] == "backref" { "ref" } else { "parent" };
                let Ok(out_v) = Uuid::parse_str(parts[2]) else {
                    warn!(uuid = %uuid, column1 = %row.column1, "edge column without UUID");
                    continue;
                };
                vertex.add_in_edge(Edge {
                    label: label.to_string(),
                    out_v,
                    out_v_label: Some(parts[1].to_string()),
                    in_v: uuid,
                    in_v_label: None,
                    properties: edge_properties(&row.value),
                });
            }
            _ => {}
        }
    }

    for (name, entries) in map_props {
        let object = Json::Object(entries.into_iter().collect());
        add_properties(&mut vertex, &name, &object);
    }
    for (name, entries) in list_props {
        let list = Json::Array(entries.into_values().collect());
        add_properties(&mut vertex, &name, &list);
    }

    postprocess(&mut vertex);
    transform_vertex(&mut vertex);
    Ok(vertex)
}

/// Flatten a decoded JSON value into dotted property paths, stopping at
/// opaque paths which keep their nested value.
fn add_properties(vertex: &mut Vertex, prefix: &str, value: &Json) {
    if OPAQUE_PATHS.contains(&prefix) {
        vertex.add_property(prefix, PropValue::from(value));
        return;
    }
    match value {
        Json::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                add_properties(vertex, &format!("{prefix}.{idx}"), item);
            }
        }
        Json::Object(map) => {
            for (key, item) in map {
                add_properties(vertex, &format!("{prefix}.{key}"), item);
            }
        }
        scalar => vertex.add_property(prefix, PropValue::from(scalar)),
    }
}

/// Edge properties come from the `attr` submap of a non-empty object value.
fn edge_properties(value: &str) -> BTreeMap<String, PropValue> {
    if value.is_empty() {
        return BTreeMap::new();
    }
    let Ok(Json::Object(obj)) = serde_json::from_str::<Json>(value) else {
        return BTreeMap::new();
    };
    match obj.get("attr") {
        Some(Json::Object(attr)) => {
            attr.iter().map(|(k, v)| (k.clone(), PropValue::from(v))).collect()
        }
        _ => BTreeMap::new(),
    }
}

fn postprocess(vertex: &mut Vertex) {
    if let Some(created) = timestamp_property(vertex, "id_perms.created") {
        vertex.set_single_property("created", created);
    }
    if let Some(updated) = timestamp_property(vertex, "id_perms.last_modified") {
        vertex.set_single_property("updated", updated);
    }

    if vertex.label.is_empty() {
        vertex.label = "_incomplete".to_string();
        vertex.set_single_property("_incomplete", true);
    }
    if !vertex.has_prop("fq_name") || !vertex.has_prop_or_child("id_perms") {
        vertex.set_single_property("_incomplete", true);
    }

    // Incomplete resources are tombstoned at an unknown time.
    if vertex.is_incomplete() {
        vertex.set_single_property("deleted", -1i64);
    } else {
        vertex.set_single_property("deleted", 0i64);
    }
}

/// Parse an `id_perms` timestamp (RFC 3339, naïve strings get a `Z`) into
/// epoch seconds.
fn timestamp_property(vertex: &Vertex, path: &str) -> Option<i64> {
    let raw = vertex.property_value(path)?.as_str()?.to_string();
    let parsed = chrono::DateTime::parse_from_rfc3339(&raw)
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(&format!("{raw}Z")))
        .ok()?;
    Some(parsed.timestamp())
}

fn parse_json(uuid: Uuid, value: &str) -> Option<Json> {
    match serde_json::from_str(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(uuid = %uuid, error = %e, "Failed to parse property value, skipping");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(rows: &[Row]) -> (Uuid, Vertex) {
        let uuid = Uuid::new_v4();
        (uuid, decode_resource(uuid, rows).unwrap())
    }

    fn prop<'a>(v: &'a Vertex, name: &str) -> &'a PropValue {
        &v.properties[name][0]
    }

    #[test]
    fn empty_row_set_is_not_found() {
        let uuid = Uuid::new_v4();
        assert!(matches!(
            decode_resource(uuid, &[]),
            Err(StoreError::ResourceNotFound(u)) if u == uuid
        ));
    }

    #[test]
    fn scalar_and_composite_properties_flatten() {
        let (_, v) = decode(&[
            Row::new("type", r#""virtual_machine""#),
            Row::new("prop:integer", "12"),
            Row::new("prop:string", r#""str""#),
            Row::new("prop:list", r#"["a", "b", "c"]"#),
            Row::new("prop:object", r#"{"bool": false, "subObject": {"foo": "bar"}}"#),
        ]);

        assert_eq!(v.label, "virtual_machine");
        assert_eq!(prop(&v, "integer"), &PropValue::Int(12));
        assert_eq!(prop(&v, "string"), &PropValue::String("str".into()));
        assert_eq!(prop(&v, "list.0"), &PropValue::String("a".into()));
        assert_eq!(prop(&v, "list.2"), &PropValue::String("c".into()));
        assert_eq!(prop(&v, "object.bool"), &PropValue::Bool(false));
        assert_eq!(prop(&v, "object.subObject.foo"), &PropValue::String("bar".into()));
    }

    #[test]
    fn numbers_prefer_int_then_float() {
        let (_, v) = decode(&[
            Row::new("type", r#""t""#),
            Row::new("prop:int", "42"),
            Row::new("prop:float", "1.5"),
        ]);
        assert_eq!(prop(&v, "int"), &PropValue::Int(42));
        assert_eq!(prop(&v, "float"), &PropValue::Float(1.5));
    }

    #[test]
    fn edges_decode_with_attr_properties() {
        let other = Uuid::new_v4();
        let parent = Uuid::new_v4();
        let (uuid, v) = decode(&[
            Row::new("type", r#""virtual_network""#),
            Row::new(
                format!("ref:network_ipam:{other}"),
                r#"{"attr": {"ipam_subnets": [{"subnet_uuid": "s1"}]}, "is_weakref": false}"#,
            ),
            Row::new(format!("children:virtual_machine_interface:{parent}"), ""),
        ]);

        let ref_edge = &v.out_e["ref"][0];
        assert_eq!(ref_edge.out_v, uuid);
        assert_eq!(ref_edge.in_v, other);
        assert_eq!(ref_edge.in_v_label.as_deref(), Some("network_ipam"));
        assert_eq!(
            ref_edge.properties["ipam_subnets"],
            PropValue::from(serde_json::json!([{"subnet_uuid": "s1"}]))
        );
        // Only the attr submap is copied.
        assert!(!ref_edge.properties.contains_key("is_weakref"));

        let parent_edge = &v.in_e["parent"][0];
        assert_eq!(parent_edge.out_v, parent);
        assert_eq!(parent_edge.in_v, uuid);
        assert_eq!(parent_edge.out_v_label.as_deref(), Some("virtual_machine_interface"));
        assert!(parent_edge.properties.is_empty());
    }

    #[test]
    fn backref_maps_to_incoming_ref() {
        let other = Uuid::new_v4();
        let (_, v) = decode(&[
            Row::new("type", r#""security_group""#),
            Row::new(format!("backref:virtual_machine_interface:{other}"), ""),
        ]);
        assert_eq!(v.in_e["ref"][0].out_v, other);
    }

    #[test]
    fn propm_accumulates_into_a_map() {
        let (_, v) = decode(&[
            Row::new("type", r#""project""#),
            Row::new("propm:annotations:color", r#"{"value": "red"}"#),
            Row::new("propm:annotations:size", r#"{"value": 3}"#),
        ]);
        assert_eq!(prop(&v, "annotations.color"), &PropValue::String("red".into()));
        assert_eq!(prop(&v, "annotations.size"), &PropValue::Int(3));
    }

    #[test]
    fn propl_accumulates_in_index_order() {
        let (_, v) = decode(&[
            Row::new("type", r#""project""#),
            Row::new("propl:labels:1", r#""b""#),
            Row::new("propl:labels:0", r#""a""#),
        ]);
        assert_eq!(prop(&v, "labels.0"), &PropValue::String("a".into()));
        assert_eq!(prop(&v, "labels.1"), &PropValue::String("b".into()));
    }

    #[test]
    fn opaque_paths_keep_nested_structure() {
        let (_, v) = decode(&[
            Row::new("type", r#""security_group""#),
            Row::new(
                "prop:security_group_entries",
                r#"{"policy_rule": [{"direction": ">", "protocol": "tcp"}]}"#,
            ),
        ]);
        let entries = prop(&v, "security_group_entries");
        assert_eq!(
            entries.get("policy_rule"),
            Some(&PropValue::from(
                serde_json::json!([{"direction": ">", "protocol": "tcp"}])
            ))
        );
        assert!(!v.has_prop("security_group_entries.policy_rule.0.direction"));
    }

    #[test]
    fn id_perms_timestamps_become_epoch_properties() {
        let (_, v) = decode(&[
            Row::new("type", r#""virtual_machine""#),
            Row::new("fq_name", r#"["default-domain", "vm1"]"#),
            Row::new(
                "prop:id_perms",
                r#"{"created": "2018-03-05T06:21:57.186987",
                    "last_modified": "2018-03-05T06:21:57.186987Z",
                    "enable": true}"#,
            ),
        ]);
        assert_eq!(prop(&v, "created"), &PropValue::Int(1520230917));
        assert_eq!(prop(&v, "updated"), &PropValue::Int(1520230917));
        assert!(!v.is_incomplete());
        assert_eq!(prop(&v, "deleted"), &PropValue::Int(0));
    }

    #[test]
    fn missing_type_marks_incomplete() {
        let (_, v) = decode(&[Row::new("fq_name", r#"["x"]"#)]);
        assert_eq!(v.label, "_incomplete");
        assert_eq!(prop(&v, "_incomplete"), &PropValue::Bool(true));
        assert_eq!(prop(&v, "deleted"), &PropValue::Int(-1));
    }

    #[test]
    fn missing_fq_name_or_id_perms_marks_incomplete() {
        let (_, v) = decode(&[Row::new("type", r#""foo""#)]);
        assert!(v.is_incomplete());
        assert_eq!(prop(&v, "deleted"), &PropValue::Int(-1));
    }

    #[test]
    fn unparseable_property_is_skipped() {
        let (_, v) = decode(&[
            Row::new("type", r#""foo""#),
            Row::new("prop:bad", "{not json"),
            Row::new("prop:good", "1"),
        ]);
        assert!(!v.has_prop("bad"));
        assert_eq!(prop(&v, "good"), &PropValue::Int(1));
    }

    #[test]
    fn vmi_transform_runs_after_decode() {
        let (_, v) = decode(&[
            Row::new("type", r#""virtual_machine_interface""#),
            Row::new(
                "prop:virtual_machine_interface_allowed_address_pairs",
                r#"{"allowed_address_pair": [
                    {"ip": {"ip_prefix": "15.15.15.5", "ip_prefix_len": 32},
                     "mac": "02:aa:bb:cc:dd:ee"}
                ]}"#,
            ),
        ]);
        let pairs = v.property_value("neutron.allowed_address_pairs").unwrap();
        let PropValue::List(pairs) = pairs else { panic!("expected list") };
        assert_eq!(pairs[0].get("ip_address"), Some(&PropValue::String("15.15.15.5/32".into())));
    }
}
