//! Incoming request model for the Neutron plugin API.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value as Json;
use uuid::Uuid;

/// The context of an incoming request.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestContext {
    #[serde(rename = "type")]
    pub kind: String,
    pub operation: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// The data of an incoming request. Filters map a filter name to a list of
/// scalar values; an ordered map keeps compiled queries deterministic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestData {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<Json>>,
}

/// A request from the Neutron plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub context: RequestContext,
    #[serde(default)]
    pub data: RequestData,
}

impl Request {
    /// Dispatch key into the method table.
    pub fn method_key(&self) -> String {
        format!("{}_{}", self.context.operation, self.context.kind)
    }
}
