//! Reconnecting Gremlin WebSocket client.
//!
//! Requests are `op: "eval"` frames with named bindings; responses are
//! matched to in-flight requests by `requestId`. The connection task owns
//! the socket and the in-flight table: on any transport error every waiting
//! caller fails with [`Error::ConnectionClosed`] and the task reconnects
//! after a short backoff. `connected` is observable as an atomic flag and
//! through registered handlers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MIME_TYPE: &str = "application/json";

/// Named bindings attached to a traversal. Values are plain JSON; the
/// server coerces them, so no GraphSON wrapping happens on this path.
pub type Bindings = BTreeMap<String, Json>;

/// A Gremlin request frame.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    pub op: String,
    pub processor: String,
    pub args: RequestArgs,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestArgs {
    pub gremlin: String,
    pub language: String,
    pub bindings: Bindings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<BTreeMap<String, String>>,
}

impl Request {
    /// An `eval` request for the given traversal and bindings.
    pub fn eval(gremlin: impl Into<String>, bindings: Bindings) -> Self {
        Request {
            request_id: Uuid::new_v4(),
            op: "eval".to_string(),
            processor: String::new(),
            args: RequestArgs {
                gremlin: gremlin.into(),
                language: "gremlin-groovy".to_string(),
                bindings,
                aliases: None,
            },
        }
    }

    /// Alias the traversal source `g` to another configured graph.
    pub fn with_alias(mut self, graph: impl Into<String>) -> Self {
        let mut aliases = BTreeMap::new();
        aliases.insert("g".to_string(), graph.into());
        self.args.aliases = Some(aliases);
        self
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "requestId")]
    request_id: Uuid,
    status: ResponseStatus,
    #[serde(default)]
    result: ResponseResult,
}

#[derive(Debug, Deserialize)]
struct ResponseStatus {
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseResult {
    #[serde(default)]
    data: Json,
}

type Handler = Arc<dyn Fn() + Send + Sync>;

struct Submission {
    request: Request,
    reply: oneshot::Sender<Result<Bytes>>,
}

struct Inner {
    uri: String,
    connected: AtomicBool,
    shutdown: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Submission>>>,
    connected_handlers: Mutex<Vec<Handler>>,
    disconnected_handlers: Mutex<Vec<Handler>>,
}

/// Handle to the reconnecting client. Clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(uri: impl Into<String>) -> Self {
        Client {
            inner: Arc::new(Inner {
                uri: uri.into(),
                connected: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                outbound: Mutex::new(None),
                connected_handlers: Mutex::new(Vec::new()),
                disconnected_handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a handler run on every successful connect.
    pub fn on_connected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.connected_handlers.lock().expect("handlers poisoned").push(Arc::new(handler));
    }

    /// Register a handler run on every disconnect.
    pub fn on_disconnected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner
            .disconnected_handlers
            .lock()
            .expect("handlers poisoned")
            .push(Arc::new(handler));
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Spawn the connection task. Reconnects until [`Client::stop`].
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            connection_loop(inner).await;
        });
    }

    /// Stop reconnecting and drop the current connection.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.outbound.lock().expect("outbound poisoned").take();
    }

    /// Send a request and wait for the full response data.
    ///
    /// Fails immediately with [`Error::ConnectionClosed`] when disconnected.
    pub async fn send(&self, request: Request) -> Result<Bytes> {
        let (reply, rx) = oneshot::channel();
        {
            let outbound = self.inner.outbound.lock().expect("outbound poisoned");
            let tx = outbound.as_ref().ok_or(Error::ConnectionClosed)?;
            tx.send(Submission { request, reply }).map_err(|_| Error::ConnectionClosed)?;
        }
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }
}

async fn connection_loop(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match connect_async(inner.uri.as_str()).await {
            Ok((socket, _)) => {
                info!(uri = %inner.uri, "Connected to gremlin server");
                let (tx, rx) = mpsc::unbounded_channel();
                *inner.outbound.lock().expect("outbound poisoned") = Some(tx);
                inner.connected.store(true, Ordering::SeqCst);
                let handlers: Vec<Handler> =
                    inner.connected_handlers.lock().expect("handlers poisoned").clone();
                for handler in &handlers {
                    handler();
                }

                if let Err(e) = pump(socket, rx).await {
                    warn!(error = %e, "Gremlin connection lost");
                }

                inner.connected.store(false, Ordering::SeqCst);
                inner.outbound.lock().expect("outbound poisoned").take();
                let handlers: Vec<Handler> =
                    inner.disconnected_handlers.lock().expect("handlers poisoned").clone();
                for handler in &handlers {
                    handler();
                }
            }
            Err(e) => {
                debug!(uri = %inner.uri, error = %e, "Gremlin connect failed");
            }
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

struct InFlight {
    reply: oneshot::Sender<Result<Bytes>>,
    partial: Vec<Json>,
}

impl InFlight {
    fn absorb(&mut self, data: Json) {
        match data {
            Json::Array(items) => self.partial.extend(items),
            Json::Null => {}
            other => self.partial.push(other),
        }
    }
}

async fn pump<S>(socket: S, mut submissions: mpsc::UnboundedReceiver<Submission>) -> Result<()>
where
    S: futures::Stream<Item = tokio_tungstenite::tungstenite::Result<Message>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let mut in_flight: HashMap<Uuid, InFlight> = HashMap::new();

    let result = loop {
        tokio::select! {
            submission = submissions.recv() => {
                let Some(Submission { request, reply }) = submission else {
                    // Client was stopped; close the socket cleanly.
                    let _ = sink.send(Message::Close(None)).await;
                    break Ok(());
                };
                let frame = match request_frame(&request) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        continue;
                    }
                };
                in_flight.insert(request.request_id, InFlight { reply, partial: Vec::new() });
                if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                    break Err(Error::Protocol(e.to_string()));
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_response(text.as_bytes(), &mut in_flight);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_response(&data, &mut in_flight);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            break Err(Error::Protocol(e.to_string()));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Err(Error::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break Err(Error::Protocol(e.to_string()));
                    }
                }
            }
        }
    };

    for (_, flight) in in_flight.drain() {
        let _ = flight.reply.send(Err(Error::ConnectionClosed));
    }
    result
}

/// Binary frame: one length byte, the mime type, then the JSON payload.
fn request_frame(request: &Request) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(request)?;
    let mut frame = Vec::with_capacity(1 + MIME_TYPE.len() + payload.len());
    frame.push(MIME_TYPE.len() as u8);
    frame.extend_from_slice(MIME_TYPE.as_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn handle_response(data: &[u8], in_flight: &mut HashMap<Uuid, InFlight>) {
    let response: Response = match serde_json::from_slice(data) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Unparseable gremlin response frame");
            return;
        }
    };
    let Some(mut flight) = in_flight.remove(&response.request_id) else {
        debug!(request_id = %response.request_id, "Response for unknown request");
        return;
    };
    match response.status.code {
        200 => {
            flight.absorb(response.result.data);
            let body = serde_json::to_vec(&Json::Array(flight.partial))
                .unwrap_or_else(|_| b"[]".to_vec());
            let _ = flight.reply.send(Ok(Bytes::from(body)));
        }
        204 => {
            let _ = flight.reply.send(Ok(Bytes::from_static(b"[]")));
        }
        206 => {
            flight.absorb(response.result.data);
            in_flight.insert(response.request_id, flight);
        }
        499 => {
            let _ = flight.reply.send(Err(Error::InvalidRequestArguments));
        }
        code => {
            let _ = flight.reply.send(Err(Error::Server {
                code,
                message: response.status.message,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flight() -> (oneshot::Receiver<Result<Bytes>>, InFlight) {
        let (reply, rx) = oneshot::channel();
        (rx, InFlight { reply, partial: Vec::new() })
    }

    #[test]
    fn frame_carries_mime_prefix() {
        let request = Request::eval("g.V()", Bindings::new());
        let frame = request_frame(&request).unwrap();
        assert_eq!(frame[0] as usize, MIME_TYPE.len());
        assert_eq!(&frame[1..=MIME_TYPE.len()], MIME_TYPE.as_bytes());
        let payload: Json = serde_json::from_slice(&frame[1 + MIME_TYPE.len()..]).unwrap();
        assert_eq!(payload["op"], json!("eval"));
        assert_eq!(payload["args"]["language"], json!("gremlin-groovy"));
    }

    #[test]
    fn alias_is_attached_when_requested() {
        let request = Request::eval("g.V()", Bindings::new()).with_alias("graph2");
        let payload = serde_json::to_value(&request).unwrap();
        assert_eq!(payload["args"]["aliases"]["g"], json!("graph2"));
    }

    #[tokio::test]
    async fn partial_responses_accumulate() {
        let request_id = Uuid::new_v4();
        let mut in_flight = HashMap::new();
        let (rx, entry) = flight();
        in_flight.insert(request_id, entry);

        let partial = json!({
            "requestId": request_id,
            "status": {"code": 206, "message": ""},
            "result": {"data": [1, 2]}
        });
        handle_response(partial.to_string().as_bytes(), &mut in_flight);
        assert!(in_flight.contains_key(&request_id));

        let fin = json!({
            "requestId": request_id,
            "status": {"code": 200, "message": ""},
            "result": {"data": [3]}
        });
        handle_response(fin.to_string().as_bytes(), &mut in_flight);
        let body = rx.await.unwrap().unwrap();
        let data: Json = serde_json::from_slice(&body).unwrap();
        assert_eq!(data, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn no_content_yields_empty_list() {
        let request_id = Uuid::new_v4();
        let mut in_flight = HashMap::new();
        let (rx, entry) = flight();
        in_flight.insert(request_id, entry);

        let response = json!({
            "requestId": request_id,
            "status": {"code": 204, "message": ""},
            "result": {}
        });
        handle_response(response.to_string().as_bytes(), &mut in_flight);
        assert_eq!(&rx.await.unwrap().unwrap()[..], b"[]");
    }

    #[tokio::test]
    async fn invalid_arguments_status_maps_to_distinguished_error() {
        let request_id = Uuid::new_v4();
        let mut in_flight = HashMap::new();
        let (rx, entry) = flight();
        in_flight.insert(request_id, entry);

        let response = json!({
            "requestId": request_id,
            "status": {"code": 499, "message": "bad bindings"},
            "result": {}
        });
        handle_response(response.to_string().as_bytes(), &mut in_flight);
        assert!(matches!(rx.await.unwrap(), Err(Error::InvalidRequestArguments)));
    }
}
