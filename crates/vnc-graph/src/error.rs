//! Error types shared by the graph backends and the Gremlin client.

use thiserror::Error;

/// Errors produced by graph backends and the Gremlin client.
#[derive(Error, Debug)]
pub enum Error {
    /// The vertex has no label and will not be written to the graph.
    #[error("vertex is incomplete")]
    IncompleteVertex,

    /// A vertex with the same ID has already been written.
    #[error("duplicate vertex")]
    DuplicateVertex,

    /// The connection to the Gremlin server is closed; callers may re-queue.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server rejected the request arguments (status 499).
    #[error("invalid request arguments")]
    InvalidRequestArguments,

    /// Any other non-success status from the Gremlin server.
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    /// A malformed frame or response from the server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backend does not implement this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, Error>;
