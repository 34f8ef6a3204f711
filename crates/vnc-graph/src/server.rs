//! Gremlin server backend.
//!
//! Every mutation is a template traversal with named bindings; no value from
//! a decoded resource is ever interpolated into the query string. Vertex
//! updates drop and re-apply properties, then reconcile edges against the
//! server's current view with an add/update/remove diff.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Value as Json;
use tracing::error;
use uuid::Uuid;

use crate::backend::GraphBackend;
use crate::client::{Bindings, Client, Request};
use crate::error::{Error, Result};
use crate::gson::parse_gson_value;
use crate::model::{Edge, Vertex};
use crate::value::PropValue;

/// Transport for Gremlin request frames. The seam exists so backend query
/// sequencing can be exercised without a running server.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Bytes>;
}

#[async_trait::async_trait]
impl Transport for Client {
    async fn send(&self, request: Request) -> Result<Bytes> {
        Client::send(self, request).await
    }
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, request: Request) -> Result<Bytes> {
        (**self).send(request).await
    }
}

/// Backend writing to a live Gremlin server through the reconnecting client.
pub struct ServerBackend<T = Client> {
    client: T,
}

impl ServerBackend {
    pub fn new(uri: impl Into<String>) -> Self {
        ServerBackend { client: Client::new(uri) }
    }

    /// Start the underlying client.
    pub fn start(&self) {
        self.client.start();
    }

    /// Stop the underlying client.
    pub fn stop(&self) {
        self.client.stop();
    }

    pub fn connected(&self) -> bool {
        self.client.connected()
    }

    pub fn on_connected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.client.on_connected(handler);
    }

    pub fn on_disconnected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.client.on_disconnected(handler);
    }

    /// The raw client, for callers building their own traversals.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl<T: Transport> ServerBackend<T> {
    /// Build a backend over any transport.
    pub fn with_transport(client: T) -> Self {
        ServerBackend { client }
    }

    async fn send(&self, gremlin: &str, bindings: Bindings) -> Result<Bytes> {
        let result = self.client.send(Request::eval(gremlin, bindings.clone())).await;
        if matches!(result, Err(Error::InvalidRequestArguments)) {
            error!(query = gremlin, bindings = %Json::Object(
                bindings.into_iter().collect()
            ), "Invalid request arguments");
        }
        result
    }

    async fn current_edges(&self, id: Uuid) -> Result<Vec<Edge>> {
        let mut bindings = Bindings::new();
        bindings.insert("_id".into(), Json::String(id.to_string()));
        let data = self.send("g.V(_id).bothE()", bindings).await?;
        decode_edges(&data)
    }

    async fn update_vertex_edges(&self, vertex: &Vertex) -> Result<()> {
        let current = self.current_edges(vertex.id).await?;
        let desired: Vec<&Edge> = vertex.edges().collect();
        let (to_add, to_update, to_remove) = diff_edges(&desired, &current);

        for edge in to_add {
            self.create_edge(edge).await?;
        }
        for edge in to_update {
            self.update_edge(edge).await?;
        }
        for edge in &to_remove {
            self.delete_edge(edge).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: Transport> GraphBackend for ServerBackend<T> {
    async fn create_vertex(&self, vertex: &Vertex) -> Result<()> {
        if vertex.label.is_empty() {
            return Err(Error::IncompleteVertex);
        }
        let (props, mut bindings) = vertex_properties_query(&vertex.properties);
        bindings.insert("_id".into(), Json::String(vertex.id.to_string()));
        bindings.insert("_type".into(), Json::String(vertex.label.clone()));
        let query = format!("g.addV(_type).property(id, _id){props}.iterate()");
        self.send(&query, bindings).await?;

        for edge in vertex.out_e.values().flatten() {
            self.create_edge(edge).await?;
        }
        for edge in vertex.in_e.values().flatten() {
            self.create_edge(edge).await?;
        }
        Ok(())
    }

    async fn update_vertex(&self, vertex: &Vertex) -> Result<()> {
        if vertex.label.is_empty() {
            return Err(Error::IncompleteVertex);
        }
        let mut bindings = Bindings::new();
        bindings.insert("_id".into(), Json::String(vertex.id.to_string()));
        self.send("g.V(_id).properties().drop()", bindings).await?;

        let (props, mut bindings) = vertex_properties_query(&vertex.properties);
        bindings.insert("_id".into(), Json::String(vertex.id.to_string()));
        let query = format!("g.V(_id){props}.iterate()");
        self.send(&query, bindings).await?;

        self.update_vertex_edges(vertex).await
    }

    async fn delete_vertex(&self, vertex: &Vertex) -> Result<()> {
        let mut bindings = Bindings::new();
        bindings.insert("_id".into(), Json::String(vertex.id.to_string()));
        self.send("g.V(_id).drop()", bindings).await?;
        Ok(())
    }

    async fn create_edge(&self, edge: &Edge) -> Result<()> {
        let (props, mut bindings) = edge_properties_query(&edge.properties);
        bindings.insert("_outv".into(), Json::String(edge.out_v.to_string()));
        bindings.insert("_inv".into(), Json::String(edge.in_v.to_string()));
        bindings.insert("_label".into(), Json::String(edge.label.clone()));
        let query =
            format!("g.V(_outv).as('outv').V(_inv).addE(_label).from('outv'){props}.iterate()");
        self.send(&query, bindings).await?;
        Ok(())
    }

    async fn update_edge(&self, edge: &Edge) -> Result<()> {
        let (props, mut bindings) = edge_properties_query(&edge.properties);
        bindings.insert("_inv".into(), Json::String(edge.in_v.to_string()));
        bindings.insert("_outv".into(), Json::String(edge.out_v.to_string()));
        let base = "g.V(_inv).bothE().where(otherV().hasId(_outv))";
        self.send(&format!("{base}.properties().drop()"), bindings.clone()).await?;
        self.send(&format!("{base}{props}.iterate()"), bindings).await?;
        Ok(())
    }

    async fn delete_edge(&self, edge: &Edge) -> Result<()> {
        let mut bindings = Bindings::new();
        bindings.insert("_inv".into(), Json::String(edge.in_v.to_string()));
        bindings.insert("_outv".into(), Json::String(edge.out_v.to_string()));
        self.send("g.V(_inv).bothE().where(otherV().hasId(_outv)).drop()", bindings).await?;
        Ok(())
    }

    async fn update_vertex_property(
        &self,
        vertex: &Vertex,
        name: &str,
        value: &PropValue,
    ) -> Result<()> {
        let mut bindings = Bindings::new();
        bindings.insert("_id".into(), Json::String(vertex.id.to_string()));
        bindings.insert("_val".into(), value.to_json());
        let query = format!("g.V(_id).property('{name}', _val)");
        self.send(&query, bindings).await?;
        Ok(())
    }
}

/// `.property(...)` chain and bindings for a vertex property map.
///
/// Property names iterate in ascending order so identical vertices always
/// produce identical query strings. Multi-valued properties use the `list`
/// cardinality; binding names carry a positional suffix.
pub fn vertex_properties_query(
    properties: &BTreeMap<String, Vec<PropValue>>,
) -> (String, Bindings) {
    let mut query = String::new();
    let mut bindings = Bindings::new();
    for (name, values) in properties {
        for (idx, value) in values.iter().enumerate() {
            let bind = format!("_{}_{idx}", name.replace('.', "_"));
            query.push_str(".property(");
            if values.len() > 1 {
                query.push_str("list,");
            }
            query.push_str(&format!("'{name}',{bind})"));
            bindings.insert(bind, value.to_json());
        }
    }
    (query, bindings)
}

/// `.property(...)` chain and bindings for a flat edge property map.
pub fn edge_properties_query(properties: &BTreeMap<String, PropValue>) -> (String, Bindings) {
    let mut query = String::new();
    let mut bindings = Bindings::new();
    for (name, value) in properties {
        let bind = format!("_{}", name.replace('.', "_"));
        query.push_str(&format!(".property('{name}',{bind})"));
        bindings.insert(bind, value.to_json());
    }
    (query, bindings)
}

/// Compare desired edges against the server's current view by the
/// `(out_v, in_v, label)` identity triple. Property maps are compared by
/// deep structural equality.
pub fn diff_edges<'a>(
    desired: &[&'a Edge],
    current: &'a [Edge],
) -> (Vec<&'a Edge>, Vec<&'a Edge>, Vec<Edge>) {
    let mut to_add = Vec::new();
    let mut to_update = Vec::new();
    let mut to_remove = Vec::new();

    for edge in desired {
        match current.iter().find(|c| c.same_identity(edge)) {
            None => to_add.push(*edge),
            Some(c) if c.properties != edge.properties => to_update.push(*edge),
            Some(_) => {}
        }
    }
    for edge in current {
        if !desired.iter().any(|d| d.same_identity(edge)) {
            to_remove.push(edge.clone());
        }
    }
    (to_add, to_update, to_remove)
}

/// Decode a `bothE()` response into edges. Endpoint IDs arrive either bare
/// or GraphSON-wrapped depending on the server serializer.
pub fn decode_edges(data: &Bytes) -> Result<Vec<Edge>> {
    let parsed: Json = serde_json::from_slice(data)?;
    let Json::Array(items) = parsed else {
        return Err(Error::Protocol("expected an edge list".to_string()));
    };
    let mut edges = Vec::with_capacity(items.len());
    for item in &items {
        let label = item
            .get("label")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::Protocol("edge without label".to_string()))?;
        let edge = Edge {
            label: label.to_string(),
            out_v: decode_uuid(item.get("outV"))?,
            out_v_label: item.get("outVLabel").and_then(Json::as_str).map(String::from),
            in_v: decode_uuid(item.get("inV"))?,
            in_v_label: item.get("inVLabel").and_then(Json::as_str).map(String::from),
            properties: item
                .get("properties")
                .and_then(Json::as_object)
                .map(|props| {
                    props.iter().map(|(k, v)| (k.clone(), parse_gson_value(v))).collect()
                })
                .unwrap_or_default(),
        };
        edges.push(edge);
    }
    Ok(edges)
}

fn decode_uuid(value: Option<&Json>) -> Result<Uuid> {
    let raw = match value {
        Some(Json::String(s)) => s.as_str(),
        Some(Json::Object(obj)) => obj
            .get("@value")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::Protocol("unexpected endpoint encoding".to_string()))?,
        _ => return Err(Error::Protocol("edge without endpoint".to_string())),
    };
    Uuid::parse_str(raw).map_err(|e| Error::Protocol(format!("bad endpoint uuid: {e}")))
}
