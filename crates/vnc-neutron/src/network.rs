//! READALL compiler for virtual networks.

use serde_json::json;
use tracing::warn;

use crate::query::{apply_filters, apply_projection, validate_fields, Query};
use crate::request::Request;

const NETWORK_FIELDS: &[&str] = &[
    "id",
    "tenant_id",
    "name",
    "description",
    "router:external",
    "shared",
    "subnets",
    "status",
    "admin_state_up",
    "port_security_enabled",
    "created_at",
    "updated_at",
];

/// Compile a network listing into a traversal.
pub fn compile(request: &Request) -> Query {
    let mut query = Query::new();

    if request.context.is_admin {
        query.add("g.V().hasLabel('virtual_network').hasNot('_missing')");
    } else {
        query.add(
            "g.V(_tenant_id).in('parent').hasLabel('virtual_network').hasNot('_missing')
             .where(values('id_perms').select('user_visible').is(true))",
        );
        query.bind("_tenant_id", json!(request.context.tenant_id.to_string()));
    }

    let is_admin = request.context.is_admin;
    apply_filters(&mut query, &request.data.filters, |query, key, value| match key {
        // In user context the collection is already tenant-scoped.
        "tenant_id" if is_admin => {
            query.add(&format!(".where(__.out('parent').has(id, {value}))"));
        }
        "tenant_id" => {}
        "router:external" => query.add(&format!(".has('router_external', {value})")),
        "shared" => query.add(&format!(".has('is_shared', {value})")),
        other => warn!(filter = other, "No implementation for network filter"),
    });

    let fields = validate_fields(&request.data.fields, NETWORK_FIELDS);
    apply_projection(&mut query, &fields, |query, field| match field {
        "tenant_id" => {
            query.add(".by(__.out('parent').id().map{ it.get().toString().replace('-', '') })");
        }
        "router:external" => query.add(
            ".by(
                coalesce(
                    values('router_external'),
                    constant(false)
                )
            )",
        ),
        "shared" => query.add(
            ".by(
                coalesce(
                    values('is_shared'),
                    constant(false)
                )
            )",
        ),
        "port_security_enabled" => query.add(
            ".by(
                coalesce(
                    values('port_security_enabled'),
                    constant(false)
                )
            )",
        ),
        "subnets" => query.add(
            ".by(
                coalesce(
                    __.outE('ref').where(__.otherV().hasLabel('network_ipam'))
                      .values('ipam_subnets').unfold().select('subnet_uuid').fold(),
                    constant([])
                )
            )",
        ),
        "status" => query.add(
            ".by(
                choose(
                    values('id_perms').select('enable'),
                    constant('ACTIVE'),
                    constant('DOWN'),
                )
            )",
        ),
        other => warn!(field = other, "No implementation for network field"),
    });

    query
}
