//! Per-label vertex transforms applied after decoding.
//!
//! Transforms derive Neutron-friendly properties from raw config structures
//! so that translator traversals can project them directly.

use crate::model::Vertex;
use crate::value::PropValue;

const AAP_PROP: &str = "virtual_machine_interface_allowed_address_pairs.allowed_address_pair";

/// Apply the transform registered for the vertex label, if any.
pub fn transform_vertex(vertex: &mut Vertex) {
    if vertex.label == "virtual_machine_interface" {
        transform_vmi(vertex);
    }
}

/// Project allowed-address-pair entries into `neutron.allowed_address_pairs`
/// as `[{ip_address: "<prefix>/<len>", mac_address: <mac>}, ...]`.
fn transform_vmi(vertex: &mut Vertex) {
    let Some(PropValue::List(pairs)) = vertex.property_value(AAP_PROP) else {
        return;
    };
    let mut neutron_pairs = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let prefix = pair
            .get("ip")
            .and_then(|ip| ip.get("ip_prefix"))
            .and_then(PropValue::as_str)
            .unwrap_or_default();
        let len = pair
            .get("ip")
            .and_then(|ip| ip.get("ip_prefix_len"))
            .and_then(PropValue::as_i64)
            .unwrap_or_default();
        let mac = pair.get("mac").cloned().unwrap_or(PropValue::Null);
        let mut entry = std::collections::BTreeMap::new();
        entry.insert("ip_address".to_string(), PropValue::String(format!("{prefix}/{len}")));
        entry.insert("mac_address".to_string(), mac);
        neutron_pairs.push(PropValue::Map(entry));
    }
    vertex.set_single_property("neutron.allowed_address_pairs", PropValue::List(neutron_pairs));
}
