//! Neutron API translator.
//!
//! Translates Neutron plugin read requests into Gremlin traversals against
//! the config graph. When the graph server is unreachable every request is
//! proxied unchanged to the legacy contrail API.

pub mod network;
pub mod port;
pub mod query;
pub mod request;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{OriginalUri, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use vnc_graph::client::Request as GremlinRequest;
use vnc_graph::server::ServerBackend;

use crate::query::Query;
use crate::request::Request;

const PROXY_TIMEOUT: Duration = Duration::from_secs(15);
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);

/// Shared translator state.
pub struct App {
    backend: Arc<ServerBackend>,
    graph_name: String,
    contrail_api_url: String,
    http: reqwest::Client,
}

pub type AppState = Arc<App>;

impl App {
    pub fn new(
        gremlin_uri: impl Into<String>,
        contrail_api: &str,
        graph_name: impl Into<String>,
    ) -> AppState {
        let backend = Arc::new(ServerBackend::new(gremlin_uri));
        backend.on_connected(|| info!("Connected to gremlin-server"));
        backend.on_disconnected(|| warn!("Disconnected from gremlin-server"));
        Arc::new(App {
            backend,
            graph_name: graph_name.into(),
            contrail_api_url: format!("http://{contrail_api}"),
            http: reqwest::Client::builder()
                .timeout(PROXY_TIMEOUT)
                .build()
                .expect("reqwest client"),
        })
    }

    /// Start the gremlin client.
    pub fn start(&self) {
        self.backend.start();
    }

    pub fn stop(&self) {
        self.backend.stop();
    }

    /// Send a compiled traversal; empty responses normalize to `[]`.
    async fn execute(&self, query: Query) -> Result<Bytes, vnc_graph::Error> {
        debug!(query = query.text(), "Sending traversal");
        let text = query.text().to_string();
        let mut request = GremlinRequest::eval(text, query.bindings);
        if self.graph_name != "g" {
            request = request.with_alias(&self.graph_name);
        }
        let data = self.backend.client().send(request).await?;
        if data.is_empty() {
            Ok(Bytes::from_static(b"[]"))
        } else {
            Ok(data)
        }
    }

    /// Proxy the request body unchanged to the legacy contrail API.
    async fn forward(&self, path: &str, headers: &HeaderMap, body: Bytes) -> Response {
        let url = format!("{}{}", self.contrail_api_url, path);
        debug!(url = %url, "Forwarding to contrail API");

        let mut proxied = self.http.post(&url).body(body);
        for (name, value) in headers {
            if name != &header::HOST {
                proxied = proxied.header(name, value);
            }
        }
        let response = match proxied.send().await {
            Ok(response) => response,
            Err(e) => {
                error!(url = %url, error = %e, "Proxy request failed");
                return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
            }
        };

        let mut builder = Response::builder().status(response.status());
        for (name, value) in response.headers() {
            builder = builder.header(name, value);
        }
        match response.bytes().await {
            Ok(bytes) => builder
                .body(Body::from(bytes))
                .unwrap_or_else(|e| {
                    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                }),
            Err(e) => {
                error!(url = %url, error = %e, "Failed to read proxied response");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

/// Build the translator router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/neutron/{resource}", post(handle))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(WRITE_TIMEOUT))
        .with_state(state)
}

async fn handle(
    State(app): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !app.backend.connected() {
        return app.forward(uri.path(), &headers, body).await;
    }

    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse request");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    debug!(method = %request.method_key(), "Request");

    let compiled = match request.method_key().as_str() {
        "READALL_network" => network::compile(&request),
        "READALL_port" => match port::compile(&request) {
            Some(query) => query,
            None => return json_response(Bytes::from_static(b"[]")),
        },
        // No graph implementation for this request.
        _ => return app.forward(uri.path(), &headers, body).await,
    };

    match app.execute(compiled).await {
        Ok(data) => json_response(data),
        Err(e) => {
            error!(error = %e, "Handler hit an error");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn json_response(data: Bytes) -> Response {
    ([(header::CONTENT_TYPE, "application/json; charset=utf-8")], data).into_response()
}

/// Run the HTTP server until SIGINT.
pub async fn run_server(app: AppState, addr: &str) -> anyhow::Result<()> {
    let router = create_router(Arc::clone(&app));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Starting HTTP server");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Stopping HTTP server");
        })
        .await?;
    app.stop();
    Ok(())
}
