//! Wide-column store access for VNC config resources.
//!
//! The [`Store`] trait is the seam the engines depend on; [`CqlStore`] is
//! the Cassandra/CQL implementation. A resource is a row-set in
//! `obj_uuid_table` keyed by UUID; the full resource listing comes from a
//! paged scan of `obj_fq_name_table`.

pub mod decoder;

use async_trait::async_trait;
use futures::TryStreamExt;
use scylla::client::execution_profile::ExecutionProfile;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::Consistency;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub use decoder::{decode_resource, get_resource};

const KEYSPACE: &str = "config_db_uuid";
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

const RESOURCE_QUERY: &str = "SELECT key, column1, value FROM obj_uuid_table WHERE key=?";
const SCAN_QUERY: &str = "SELECT column1 FROM obj_fq_name_table";

/// Errors from the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The resource has no rows in the store.
    #[error("resource {0} not found")]
    ResourceNotFound(Uuid),

    /// Driver-level failure, including request timeouts.
    #[error("store query failed: {0}")]
    Query(String),
}

/// One `(column1, value)` cell of a resource row-set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub column1: String,
    pub value: String,
}

impl Row {
    pub fn new(column1: impl Into<String>, value: impl Into<String>) -> Self {
        Row { column1: column1.into(), value: value.into() }
    }
}

/// Read access to the config store.
#[async_trait]
pub trait Store: Send + Sync {
    /// The ordered row-set for one resource UUID.
    async fn resource_rows(&self, uuid: Uuid) -> Result<Vec<Row>, StoreError>;

    /// Scan every resource UUID from the fq-name table into the channel.
    /// UUIDs are the last colon-delimited component of `column1`.
    async fn scan_uuids(&self, uuids: mpsc::Sender<Uuid>) -> Result<(), StoreError>;
}

/// Cassandra-backed [`Store`] with quorum reads and a 2 s request timeout.
pub struct CqlStore {
    session: Session,
}

impl CqlStore {
    /// Connect to the cluster and switch to the config keyspace.
    pub async fn connect(nodes: &[String]) -> Result<Self, StoreError> {
        info!(?nodes, "Connecting to Cassandra");
        let profile = ExecutionProfile::builder()
            .consistency(Consistency::Quorum)
            .request_timeout(Some(REQUEST_TIMEOUT))
            .build();
        let session = SessionBuilder::new()
            .known_nodes(nodes)
            .default_execution_profile_handle(profile.into_handle())
            .build()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        session
            .use_keyspace(KEYSPACE, false)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        info!("Connected to Cassandra");
        Ok(CqlStore { session })
    }
}

#[async_trait]
impl Store for CqlStore {
    async fn resource_rows(&self, uuid: Uuid) -> Result<Vec<Row>, StoreError> {
        // The row key is the textual UUID stored as a blob.
        let key = uuid.to_string().into_bytes();
        let result = self
            .session
            .query_unpaged(RESOURCE_QUERY, (key,))
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
            .into_rows_result()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut rows = Vec::new();
        for row in result
            .rows::<(Vec<u8>, String, String)>()
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            let (_, column1, value) = row.map_err(|e| StoreError::Query(e.to_string()))?;
            rows.push(Row { column1, value });
        }
        Ok(rows)
    }

    async fn scan_uuids(&self, uuids: mpsc::Sender<Uuid>) -> Result<(), StoreError> {
        let pager = self
            .session
            .query_iter(SCAN_QUERY, ())
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let mut stream = pager
            .rows_stream::<(String,)>()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        while let Some((column1,)) =
            stream.try_next().await.map_err(|e| StoreError::Query(e.to_string()))?
        {
            let tail = column1.rsplit(':').next().unwrap_or_default();
            match Uuid::parse_str(tail) {
                Ok(uuid) => {
                    if uuids.send(uuid).await.is_err() {
                        // Consumers are gone; stop scanning.
                        return Ok(());
                    }
                }
                Err(_) => warn!(column1 = %column1, "fq_name row without a UUID tail"),
            }
        }
        Ok(())
    }
}
