//! READALL compiler for ports (virtual machine interfaces).

use std::collections::BTreeMap;

use serde_json::Value as Json;
use tracing::warn;

use crate::query::{apply_filters, apply_projection, validate_fields, Query};
use crate::request::Request;

const PORT_FIELDS: &[&str] = &[
    "id",
    "tenant_id",
    "network_id",
    "name",
    "description",
    "security_groups",
    "fixed_ips",
    "mac_address",
    "allowed_address_pairs",
    "device_id",
    "device_owner",
    "status",
    "admin_state_up",
    "binding:vif_details",
    "binding:vif_type",
    "binding:vnic_type",
    "binding:host_id",
    "created_at",
    "updated_at",
];

/// Compile a port listing. `None` means the request short-circuits to an
/// empty result (DHCP ports are not modeled in the graph).
pub fn compile(request: &Request) -> Option<Query> {
    if let Some(owners) = request.data.filters.get("device_owner") {
        if owners.iter().any(|v| v == "network:dhcp") {
            return None;
        }
    }

    let filters = rewrite_fixed_ips(&request.data.filters);

    let mut query = Query::new();
    if request.context.is_admin {
        query.add("g.V().hasLabel('virtual_machine_interface').hasNot('_missing')");
    } else {
        query.add(
            "g.V(_tenant_id).in('parent').hasLabel('virtual_machine_interface')
             .hasNot('_missing')
             .where(values('id_perms').select('user_visible').is(true))",
        );
        query.bind("_tenant_id", Json::String(request.context.tenant_id.to_string()));
    }

    apply_filters(&mut query, &filters, |query, key, value| match key {
        "network_id" => query.add(&format!(
            ".where(__.out('ref').hasLabel('virtual_network').has(id, {value}))"
        )),
        // A device can be a VM (out ref) or a logical router (in ref).
        "device_id" => query.add(&format!(".where(__.both('ref').has(id, {value}))")),
        "device_owner" => query.add(&format!(
            ".has('virtual_machine_interface_device_owner', {value})"
        )),
        "ip_address" => query.add(&format!(
            ".where(__.in('ref').hasLabel('instance_ip').has('instance_ip_address', {value}))"
        )),
        "subnet_id" => query.add(&format!(
            ".where(__.in('ref').hasLabel('instance_ip').has('subnet_uuid', {value}))"
        )),
        other => warn!(filter = other, "No implementation for port filter"),
    });

    let fields = validate_fields(&request.data.fields, PORT_FIELDS);
    apply_projection(&mut query, &fields, |query, field| match field {
        "tenant_id" => {
            query.add(".by(__.out('parent').id().map{ it.get().toString().replace('-', '') })");
        }
        "network_id" => query.add(".by(__.out('ref').hasLabel('virtual_network').id())"),
        "security_groups" => query.add(
            ".by(
                __.out('ref').hasLabel('security_group')
                    .not(has('fq_name', ['default-domain', 'default-project', '__no_rule__']))
                    .id().fold()
            )",
        ),
        "fixed_ips" => query.add(
            ".by(
                __.in('ref').hasLabel('instance_ip')
                    .project('ip_address', 'subnet_id')
                        .by('instance_ip_address')
                        .by(coalesce(values('subnet_uuid'), constant('')))
                    .fold()
            )",
        ),
        "mac_address" => query.add(
            ".by(
                coalesce(
                    values('virtual_machine_interface_mac_addresses.mac_address.0'),
                    constant('')
                )
            )",
        ),
        "allowed_address_pairs" => query.add(
            ".by(
                coalesce(
                    values('neutron.allowed_address_pairs'),
                    constant([])
                )
            )",
        ),
        "device_id" => query.add(
            ".by(
                coalesce(
                    __.out('ref').hasLabel('virtual_machine').id(),
                    __.in('ref').hasLabel('logical_router').id(),
                    constant('')
                )
            )",
        ),
        "device_owner" => query.add(
            ".by(
                coalesce(
                    values('virtual_machine_interface_device_owner'),
                    constant('')
                )
            )",
        ),
        "status" => query.add(
            ".by(
                choose(
                    __.has('virtual_machine_interface_device_owner'),
                    constant('ACTIVE'),
                    constant('DOWN'),
                )
            )",
        ),
        "binding:vif_details" => query.add(".by(constant([ port_filter : true ]))"),
        "binding:vif_type" => query.add(".by(constant('vrouter'))"),
        "binding:vnic_type" => query.add(".by(constant('normal'))"),
        "binding:host_id" => query.add(".by(constant('none'))"),
        other => warn!(field = other, "No implementation for port field"),
    });

    Some(query)
}

/// Flatten `fixed_ips` filter entries of the form `ip_address=X` or
/// `subnet_id=Y` into their own filters before compilation.
fn rewrite_fixed_ips(
    filters: &BTreeMap<String, Vec<Json>>,
) -> BTreeMap<String, Vec<Json>> {
    let mut rewritten = filters.clone();
    let Some(entries) = rewritten.remove("fixed_ips") else {
        return rewritten;
    };
    for entry in entries {
        let Some(entry) = entry.as_str() else {
            warn!(?entry, "Unexpected fixed_ips filter entry");
            continue;
        };
        match entry.split_once('=') {
            Some((key @ ("ip_address" | "subnet_id"), value)) => {
                rewritten
                    .entry(key.to_string())
                    .or_default()
                    .push(Json::String(value.to_string()));
            }
            _ => warn!(entry, "Unexpected fixed_ips filter entry"),
        }
    }
    rewritten
}
