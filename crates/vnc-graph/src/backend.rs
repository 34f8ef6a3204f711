//! The common write contract implemented by both graph backends.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Edge, Vertex};
use crate::value::PropValue;

/// Write operations shared by the GraphSON file backend and the Gremlin
/// server backend.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    async fn create_vertex(&self, vertex: &Vertex) -> Result<()>;
    async fn update_vertex(&self, vertex: &Vertex) -> Result<()>;
    async fn delete_vertex(&self, vertex: &Vertex) -> Result<()>;
    async fn create_edge(&self, edge: &Edge) -> Result<()>;
    async fn update_edge(&self, edge: &Edge) -> Result<()>;
    async fn delete_edge(&self, edge: &Edge) -> Result<()>;
    async fn update_vertex_property(
        &self,
        vertex: &Vertex,
        name: &str,
        value: &PropValue,
    ) -> Result<()>;
}
