//! GraphSON file backend.
//!
//! Writes one vertex per line, UTF-8, newline-terminated. A single writer
//! task owns the output stream; callers submit vertices over a channel and
//! await the writer's reply. The writer keeps the `written`/`pending` sets
//! that close the graph over dangling references: a referenced-but-never-seen
//! endpoint is materialized as a `_missing` placeholder when the stream ends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use serde_json::{json, Map as JsonMap, Value as Json};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::GraphBackend;
use crate::error::{Error, Result};
use crate::model::{Edge, Vertex};
use crate::value::PropValue;

/// Wrap a property value in its GraphSON typed form.
///
/// Strings and booleans stay bare; maps become the flat alternating
/// key/value list GraphSON uses for `g:Map`.
pub fn gson_value(value: &PropValue) -> Json {
    match value {
        PropValue::Null => Json::Null,
        PropValue::Bool(b) => Json::Bool(*b),
        PropValue::String(s) => Json::String(s.clone()),
        PropValue::Int(n) => json!({"@type": "g:Int64", "@value": n}),
        PropValue::Float(f) => json!({"@type": "g:Float64", "@value": f}),
        PropValue::List(items) => {
            let wrapped: Vec<Json> = items.iter().map(gson_value).collect();
            json!({"@type": "g:List", "@value": wrapped})
        }
        PropValue::Map(m) => {
            let mut flat = Vec::with_capacity(m.len() * 2);
            for (k, v) in m {
                flat.push(Json::String(k.clone()));
                flat.push(gson_value(v));
            }
            json!({"@type": "g:Map", "@value": flat})
        }
    }
}

fn uuid_value(id: Uuid) -> Json {
    json!({"@type": "g:UUID", "@value": id.to_string()})
}

fn int64_value(n: i64) -> Json {
    json!({"@type": "g:Int64", "@value": n})
}

/// Decode a GraphSON value back into a [`PropValue`].
///
/// Unknown `@type` tags keep their raw `@value`; plain objects decode as
/// maps so the same function serves server responses that skip wrapping.
pub fn parse_gson_value(value: &Json) -> PropValue {
    match value {
        Json::Object(obj) => match (obj.get("@type").and_then(Json::as_str), obj.get("@value")) {
            (Some("g:Int64") | Some("g:Int32"), Some(v)) => {
                v.as_i64().map(PropValue::Int).unwrap_or(PropValue::Null)
            }
            (Some("g:Float64") | Some("g:Double"), Some(v)) => {
                v.as_f64().map(PropValue::Float).unwrap_or(PropValue::Null)
            }
            (Some("g:UUID"), Some(v)) => PropValue::from(v),
            (Some("g:List"), Some(Json::Array(items))) => {
                PropValue::List(items.iter().map(parse_gson_value).collect())
            }
            (Some("g:Map"), Some(Json::Array(flat))) => {
                let mut m = std::collections::BTreeMap::new();
                for pair in flat.chunks(2) {
                    if let [Json::String(k), v] = pair {
                        m.insert(k.clone(), parse_gson_value(v));
                    }
                }
                PropValue::Map(m)
            }
            (Some(_), Some(v)) => PropValue::from(v),
            _ => PropValue::Map(
                obj.iter().map(|(k, v)| (k.clone(), parse_gson_value(v))).collect(),
            ),
        },
        Json::Array(items) => PropValue::List(items.iter().map(parse_gson_value).collect()),
        other => PropValue::from(other),
    }
}

/// Shared ID allocation: monotonically increasing property IDs and stable
/// per-extract edge IDs keyed by the undirected endpoint pair plus label.
#[derive(Default)]
struct IdAllocator {
    prop_id: AtomicI64,
    edge_id: AtomicI64,
    edge_ids: Mutex<HashMap<String, i64>>,
}

impl IdAllocator {
    fn next_prop_id(&self) -> i64 {
        self.prop_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn edge_id(&self, a: Uuid, b: Uuid, label: &str) -> i64 {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let key = format!("{lo}-{hi}:{label}");
        let mut ids = self.edge_ids.lock().expect("edge id table poisoned");
        if let Some(id) = ids.get(&key) {
            return *id;
        }
        let id = self.edge_id.fetch_add(1, Ordering::Relaxed) + 1;
        ids.insert(key, id);
        id
    }
}

struct WriteOp {
    vertex: Vertex,
    reply: oneshot::Sender<Result<()>>,
}

/// The GraphSON writer backend. Cheap to share behind an `Arc`; submissions
/// funnel into the single writer task.
pub struct GsonBackend {
    tx: mpsc::Sender<WriteOp>,
    writer: JoinHandle<Result<()>>,
}

impl GsonBackend {
    /// Spawn the writer task over the given output stream.
    pub fn start<W>(output: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        let writer = Writer {
            output,
            ids: Arc::new(IdAllocator::default()),
            written: HashSet::new(),
            pending: HashMap::new(),
        };
        let handle = tokio::spawn(writer.run(rx));
        GsonBackend { tx, writer: handle }
    }

    /// Submit a vertex and wait for the writer's verdict.
    pub async fn create(&self, vertex: Vertex) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteOp { vertex, reply })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Close the write channel, flush pending placeholders and the stream.
    pub async fn stop(self) -> Result<()> {
        drop(self.tx);
        self.writer.await.map_err(|e| Error::Protocol(format!("writer task failed: {e}")))?
    }
}

#[async_trait::async_trait]
impl GraphBackend for GsonBackend {
    async fn create_vertex(&self, vertex: &Vertex) -> Result<()> {
        self.create(vertex.clone()).await
    }

    // A snapshot file is write-once; an update is only meaningful as the
    // first (and only) write of the vertex.
    async fn update_vertex(&self, vertex: &Vertex) -> Result<()> {
        self.create(vertex.clone()).await
    }

    async fn delete_vertex(&self, _vertex: &Vertex) -> Result<()> {
        Err(Error::Unsupported("DeleteVertex on GraphSON file backend"))
    }

    async fn create_edge(&self, _edge: &Edge) -> Result<()> {
        Err(Error::Unsupported("CreateEdge on GraphSON file backend"))
    }

    async fn update_edge(&self, _edge: &Edge) -> Result<()> {
        Err(Error::Unsupported("UpdateEdge on GraphSON file backend"))
    }

    async fn delete_edge(&self, _edge: &Edge) -> Result<()> {
        Err(Error::Unsupported("DeleteEdge on GraphSON file backend"))
    }

    async fn update_vertex_property(
        &self,
        _vertex: &Vertex,
        _name: &str,
        _value: &PropValue,
    ) -> Result<()> {
        Err(Error::Unsupported("UpdateVertexProperty on GraphSON file backend"))
    }
}

struct Writer<W> {
    output: W,
    ids: Arc<IdAllocator>,
    written: HashSet<Uuid>,
    pending: HashMap<Uuid, Vertex>,
}

impl<W: AsyncWrite + Unpin + Send> Writer<W> {
    async fn run(mut self, mut rx: mpsc::Receiver<WriteOp>) -> Result<()> {
        while let Some(op) = rx.recv().await {
            self.stage_pending(&op.vertex);
            let res = self.write_vertex(&op.vertex).await;
            let _ = op.reply.send(res);
        }
        // Channel closed: everything still pending was referenced but never
        // seen. Emit the placeholders so the graph is closed.
        let missing: Vec<Uuid> = self.pending.keys().copied().collect();
        for id in missing {
            if let Some(v) = self.pending.remove(&id) {
                self.write_vertex(&v).await?;
            }
        }
        self.output.flush().await?;
        Ok(())
    }

    /// Record placeholders for every edge endpoint not yet written. The
    /// placeholder carries the reverse edge so both sides of the identity
    /// triple appear in the output.
    fn stage_pending(&mut self, vertex: &Vertex) {
        // A resubmitted vertex is about to be rejected as a duplicate; its
        // reverse edges were already staged on the first pass.
        if self.written.contains(&vertex.id) {
            return;
        }
        for (label, edges) in &vertex.out_e {
            for edge in edges {
                if self.written.contains(&edge.in_v) || edge.in_v == vertex.id {
                    continue;
                }
                let pending = self.pending.entry(edge.in_v).or_insert_with(|| {
                    missing_vertex(edge.in_v, edge.in_v_label.clone())
                });
                pending.add_in_edge(Edge {
                    label: label.clone(),
                    out_v: vertex.id,
                    out_v_label: Some(vertex.label.clone()),
                    in_v: edge.in_v,
                    in_v_label: edge.in_v_label.clone(),
                    properties: edge.properties.clone(),
                });
            }
        }
        for (label, edges) in &vertex.in_e {
            for edge in edges {
                if self.written.contains(&edge.out_v) || edge.out_v == vertex.id {
                    continue;
                }
                let pending = self.pending.entry(edge.out_v).or_insert_with(|| {
                    missing_vertex(edge.out_v, edge.out_v_label.clone())
                });
                pending.add_out_edge(Edge {
                    label: label.clone(),
                    out_v: edge.out_v,
                    out_v_label: edge.out_v_label.clone(),
                    in_v: vertex.id,
                    in_v_label: Some(vertex.label.clone()),
                    properties: edge.properties.clone(),
                });
            }
        }
    }

    async fn write_vertex(&mut self, vertex: &Vertex) -> Result<()> {
        if self.written.contains(&vertex.id) {
            return Err(Error::DuplicateVertex);
        }
        let record = render_vertex(vertex, &self.ids);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.output.write_all(&line).await?;
        self.written.insert(vertex.id);
        self.pending.remove(&vertex.id);
        Ok(())
    }
}

fn missing_vertex(id: Uuid, label: Option<String>) -> Vertex {
    let mut v = Vertex::new(id);
    v.label = label.unwrap_or_default();
    v.set_single_property("fq_name", PropValue::List(vec!["_missing".into()]));
    v.set_single_property("_missing", true);
    v
}

fn render_vertex(vertex: &Vertex, ids: &IdAllocator) -> Json {
    let mut record = JsonMap::new();
    record.insert("id".into(), uuid_value(vertex.id));
    record.insert("label".into(), Json::String(vertex.label.clone()));

    if !vertex.properties.is_empty() {
        let mut props = JsonMap::new();
        for (name, values) in &vertex.properties {
            let rendered: Vec<Json> = values
                .iter()
                .map(|v| json!({"id": int64_value(ids.next_prop_id()), "value": gson_value(v)}))
                .collect();
            props.insert(name.clone(), Json::Array(rendered));
        }
        record.insert("properties".into(), Json::Object(props));
    }
    if !vertex.in_e.is_empty() {
        record.insert("inE".into(), render_edges(&vertex.in_e, vertex, ids, false));
    }
    if !vertex.out_e.is_empty() {
        record.insert("outE".into(), render_edges(&vertex.out_e, vertex, ids, true));
    }
    Json::Object(record)
}

fn render_edges(
    edges: &std::collections::BTreeMap<String, Vec<Edge>>,
    vertex: &Vertex,
    ids: &IdAllocator,
    outgoing: bool,
) -> Json {
    let mut by_label = JsonMap::new();
    for (label, list) in edges {
        let rendered: Vec<Json> = list
            .iter()
            .map(|e| {
                let far = if outgoing { e.in_v } else { e.out_v };
                let mut record = JsonMap::new();
                record.insert("id".into(), int64_value(ids.edge_id(vertex.id, far, label)));
                if far != vertex.id && !far.is_nil() {
                    let key = if outgoing { "inV" } else { "outV" };
                    record.insert(key.into(), uuid_value(far));
                }
                let props: JsonMap<String, Json> = e
                    .properties
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), gson_value(v)))
                    .collect();
                if !props.is_empty() {
                    record.insert("properties".into(), Json::Object(props));
                }
                Json::Object(record)
            })
            .collect();
        by_label.insert(label.clone(), Json::Array(rendered));
    }
    Json::Object(by_label)
}
