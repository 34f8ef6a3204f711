//! Graph data model and backends for the VNC config graph.
//!
//! A [`Vertex`] is the canonical decoded form of a config resource; the two
//! [`GraphBackend`] implementations write vertices either to a GraphSON file
//! ([`gson::GsonBackend`]) or to a live Gremlin server
//! ([`server::ServerBackend`]) through the reconnecting WebSocket
//! [`client::Client`].

pub mod backend;
pub mod client;
pub mod error;
pub mod gson;
pub mod model;
pub mod server;
pub mod transform;
pub mod value;

pub use backend::GraphBackend;
pub use error::{Error, Result};
pub use model::{Edge, Vertex};
pub use value::PropValue;
