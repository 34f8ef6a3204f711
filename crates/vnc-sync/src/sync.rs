//! The replication state machine.
//!
//! While the backend is connected, notifications apply directly. On
//! disconnect they buffer into the coalescing pending queue; reconnection
//! drains the queue FIFO before new notifications are handled again. A
//! DELETE tombstones the vertex immediately and verifies the outcome
//! against the store after a grace period.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vnc_graph::{Error as GraphError, GraphBackend, PropValue, Vertex};
use vnc_store::{get_resource, Store, StoreError};

use crate::pending::PendingQueue;
use crate::{Notification, Oper};

/// Poll interval while a pending drain is in progress. The only polling in
/// the system; everything else is event-driven.
pub const PENDING_POLL: Duration = Duration::from_millis(200);

/// Grace period between a DELETE tombstone and its verification read.
pub const DELETE_CHECK_DELAY: Duration = Duration::from_secs(3);

/// Failure while applying one notification.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl ApplyError {
    fn is_connection_closed(&self) -> bool {
        matches!(self, ApplyError::Graph(GraphError::ConnectionClosed))
    }
}

/// Wait-group for spawn-and-forget verification tasks so shutdown can
/// flush them.
#[derive(Default)]
struct TaskGroup {
    count: AtomicUsize,
    done: Notify,
}

struct TaskGuard(Arc<TaskGroup>);

impl TaskGroup {
    fn enter(self: &Arc<Self>) -> TaskGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        TaskGuard(Arc::clone(self))
    }

    async fn wait(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.done.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::SeqCst);
        self.0.done.notify_waiters();
    }
}

/// The sync engine over a store and a graph backend.
pub struct Syncer<S, B> {
    store: Arc<S>,
    backend: Arc<B>,
    pending: Mutex<PendingQueue>,
    connected: AtomicBool,
    pending_processing: AtomicBool,
    deferred: Arc<TaskGroup>,
    delete_check_delay: Duration,
}

impl<S, B> Syncer<S, B>
where
    S: Store + 'static,
    B: GraphBackend + 'static,
{
    pub fn new(store: Arc<S>, backend: Arc<B>) -> Self {
        Syncer {
            store,
            backend,
            pending: Mutex::new(PendingQueue::default()),
            connected: AtomicBool::new(false),
            pending_processing: AtomicBool::new(false),
            deferred: Arc::new(TaskGroup::default()),
            delete_check_delay: DELETE_CHECK_DELAY,
        }
    }

    /// Shorten the delete-verification grace period (tests).
    pub fn with_delete_check_delay(mut self, delay: Duration) -> Self {
        self.delete_check_delay = delay;
        self
    }

    /// Hook for the backend's connected event: start draining pending.
    pub fn handle_connected(self: &Arc<Self>) {
        self.connected.store(true, Ordering::SeqCst);
        self.pending_processing.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drain_pending().await;
        });
    }

    /// Hook for the backend's disconnected event.
    pub fn handle_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Handle one notification; the return value is the ack decision.
    pub async fn handle_notification(self: &Arc<Self>, notification: Notification) -> bool {
        // Wait for a pending drain to finish before handling anything new.
        while self.pending_processing.load(Ordering::SeqCst) {
            tokio::time::sleep(PENDING_POLL).await;
        }

        if notification.oper == Oper::Unknown {
            error!(kind = %notification.kind, uuid = %notification.uuid,
                   "Notification not handled");
            return false;
        }

        if !self.connected.load(Ordering::SeqCst) {
            self.pending.lock().await.push(notification);
            return true;
        }

        debug!(oper = ?notification.oper, kind = %notification.kind,
               uuid = %notification.uuid, "Applying notification");
        match self.apply(&notification).await {
            Ok(()) => true,
            Err(e) => {
                error!(oper = ?notification.oper, kind = %notification.kind,
                       uuid = %notification.uuid, error = %e, "Notification failed");
                if e.is_connection_closed() {
                    self.pending.lock().await.push(notification);
                }
                false
            }
        }
    }

    /// Drain the pending queue FIFO. On connection loss mid-drain the
    /// failed entry goes back to the head and the tail stays intact.
    pub async fn drain_pending(self: &Arc<Self>) {
        self.pending_processing.store(true, Ordering::SeqCst);
        debug!("Processing pending notifications");
        loop {
            let next = { self.pending.lock().await.pop_front() };
            let Some(notification) = next else { break };
            if let Err(e) = self.apply(&notification).await {
                if e.is_connection_closed() {
                    self.pending.lock().await.push_front(notification);
                    warn!("Connection lost while draining pending notifications");
                    break;
                }
                // Best-effort replication: anything else is logged and dropped.
                error!(oper = ?notification.oper, uuid = %notification.uuid,
                       error = %e, "Pending notification failed");
            }
        }
        debug!("Done processing pending notifications");
        self.pending_processing.store(false, Ordering::SeqCst);
    }

    async fn apply(self: &Arc<Self>, notification: &Notification) -> Result<(), ApplyError> {
        match notification.oper {
            Oper::Create => {
                let vertex = get_resource(self.store.as_ref(), notification.uuid).await?;
                self.backend.create_vertex(&vertex).await?;
            }
            Oper::Update => {
                let vertex = get_resource(self.store.as_ref(), notification.uuid).await?;
                self.backend.update_vertex(&vertex).await?;
            }
            Oper::Delete => {
                let tombstone = chrono::Utc::now().timestamp();
                let mut vertex = Vertex::new(notification.uuid);
                vertex.label = notification.kind.clone();
                self.backend
                    .update_vertex_property(&vertex, "deleted", &PropValue::Int(tombstone))
                    .await?;
                self.schedule_delete_check(notification.uuid, notification.kind.clone(), tombstone);
            }
            Oper::Unknown => {}
        }
        Ok(())
    }

    /// Verify a DELETE after the grace period: a resource gone from the
    /// store is dropped from the graph; a lingering one is rewritten with
    /// its tombstone preserved.
    fn schedule_delete_check(self: &Arc<Self>, uuid: Uuid, kind: String, tombstone: i64) {
        let this = Arc::clone(self);
        let guard = self.deferred.enter();
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::time::sleep(this.delete_check_delay).await;
                match get_resource(this.store.as_ref(), uuid).await {
                    Err(StoreError::ResourceNotFound(_)) => {
                        let mut vertex = Vertex::new(uuid);
                        vertex.label = kind.clone();
                        match this.backend.delete_vertex(&vertex).await {
                            Ok(()) => debug!(uuid = %uuid, "Vertex dropped after delete check"),
                            Err(e) => error!(uuid = %uuid, error = %e,
                                             "Failed to drop deleted vertex"),
                        }
                    }
                    Err(e) => {
                        warn!(uuid = %uuid, error = %e, "Delete check failed, re-scheduling");
                        continue;
                    }
                    Ok(mut vertex) if vertex.is_incomplete() => {
                        vertex.set_single_property("deleted", tombstone);
                        if let Err(e) = this.backend.update_vertex(&vertex).await {
                            error!(uuid = %uuid, error = %e,
                                   "Failed to overwrite incomplete deleted vertex");
                        }
                    }
                    Ok(vertex) => {
                        info!(uuid = %uuid, kind = %kind,
                              "Resource still present after DELETE, updating");
                        if let Err(e) = this.backend.update_vertex(&vertex).await {
                            error!(uuid = %uuid, error = %e,
                                   "Failed to update surviving vertex");
                        }
                    }
                }
                break;
            }
        });
    }

    /// Number of buffered notifications (diagnostics and tests).
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Wait for in-flight delete verifications to finish.
    pub async fn flush_deferred(&self) {
        self.deferred.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use vnc_graph::model::Edge;
    use vnc_store::Row;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        CreateVertex(Uuid, String),
        UpdateVertex(Uuid, Option<PropValue>),
        DeleteVertex(Uuid),
        VertexProperty(Uuid, String, PropValue),
    }

    #[derive(Default)]
    struct MockBackend {
        ops: StdMutex<Vec<Op>>,
        closed: AtomicBool,
    }

    impl MockBackend {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn guard(&self) -> Result<(), GraphError> {
            if self.closed.load(Ordering::SeqCst) {
                Err(GraphError::ConnectionClosed)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl GraphBackend for MockBackend {
        async fn create_vertex(&self, v: &Vertex) -> Result<(), GraphError> {
            self.guard()?;
            self.ops.lock().unwrap().push(Op::CreateVertex(v.id, v.label.clone()));
            Ok(())
        }

        async fn update_vertex(&self, v: &Vertex) -> Result<(), GraphError> {
            self.guard()?;
            self.ops
                .lock()
                .unwrap()
                .push(Op::UpdateVertex(v.id, v.property_value("deleted").cloned()));
            Ok(())
        }

        async fn delete_vertex(&self, v: &Vertex) -> Result<(), GraphError> {
            self.guard()?;
            self.ops.lock().unwrap().push(Op::DeleteVertex(v.id));
            Ok(())
        }

        async fn create_edge(&self, _e: &Edge) -> Result<(), GraphError> {
            self.guard()
        }

        async fn update_edge(&self, _e: &Edge) -> Result<(), GraphError> {
            self.guard()
        }

        async fn delete_edge(&self, _e: &Edge) -> Result<(), GraphError> {
            self.guard()
        }

        async fn update_vertex_property(
            &self,
            v: &Vertex,
            name: &str,
            value: &PropValue,
        ) -> Result<(), GraphError> {
            self.guard()?;
            self.ops
                .lock()
                .unwrap()
                .push(Op::VertexProperty(v.id, name.to_string(), value.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockStore {
        rows: StdMutex<HashMap<Uuid, Vec<Row>>>,
        fail: AtomicBool,
    }

    impl MockStore {
        fn insert(&self, uuid: Uuid, rows: Vec<Row>) {
            self.rows.lock().unwrap().insert(uuid, rows);
        }

        fn remove(&self, uuid: Uuid) {
            self.rows.lock().unwrap().remove(&uuid);
        }
    }

    #[async_trait]
    impl Store for MockStore {
        async fn resource_rows(&self, uuid: Uuid) -> Result<Vec<Row>, StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Query("store down".into()));
            }
            Ok(self.rows.lock().unwrap().get(&uuid).cloned().unwrap_or_default())
        }

        async fn scan_uuids(
            &self,
            _uuids: tokio::sync::mpsc::Sender<Uuid>,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn resource_rows() -> Vec<Row> {
        vec![
            Row::new("type", r#""virtual_machine""#),
            Row::new("fq_name", r#"["foo"]"#),
            Row::new("prop:id_perms", r#"{"created": "2018-03-05T06:21:57.186987"}"#),
        ]
    }

    fn notification(oper: Oper, uuid: Uuid) -> Notification {
        Notification { oper, kind: "virtual_machine".into(), uuid }
    }

    fn syncer(
        store: Arc<MockStore>,
        backend: Arc<MockBackend>,
    ) -> Arc<Syncer<MockStore, MockBackend>> {
        Arc::new(
            Syncer::new(store, backend).with_delete_check_delay(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn create_applies_while_connected() {
        let store = Arc::new(MockStore::default());
        let backend = Arc::new(MockBackend::default());
        let s = syncer(Arc::clone(&store), Arc::clone(&backend));
        let u = Uuid::new_v4();
        store.insert(u, resource_rows());

        s.handle_connected();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(s.handle_notification(notification(Oper::Create, u)).await);
        assert_eq!(backend.ops(), vec![Op::CreateVertex(u, "virtual_machine".into())]);
    }

    #[tokio::test]
    async fn disconnected_notifications_buffer_and_ack() {
        let store = Arc::new(MockStore::default());
        let backend = Arc::new(MockBackend::default());
        let s = syncer(store, Arc::clone(&backend));
        let u = Uuid::new_v4();

        assert!(s.handle_notification(notification(Oper::Create, u)).await);
        assert!(s.handle_notification(notification(Oper::Update, u)).await);
        assert!(s.handle_notification(notification(Oper::Update, u)).await);

        // Coalesced to CREATE + one UPDATE, nothing applied yet.
        assert_eq!(s.pending_len().await, 2);
        assert!(backend.ops().is_empty());
    }

    #[tokio::test]
    async fn reconnect_drains_then_delete_drops_the_vertex() {
        let store = Arc::new(MockStore::default());
        let backend = Arc::new(MockBackend::default());
        let s = syncer(Arc::clone(&store), Arc::clone(&backend));
        let u = Uuid::new_v4();
        store.insert(u, resource_rows());

        // Outage: buffer CREATE, UPDATE, UPDATE.
        for oper in [Oper::Create, Oper::Update, Oper::Update] {
            assert!(s.handle_notification(notification(oper, u)).await);
        }

        s.handle_connected();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.pending_len().await, 0);

        // Store forgets the resource; DELETE tombstones then drops.
        store.remove(u);
        assert!(s.handle_notification(notification(Oper::Delete, u)).await);
        s.flush_deferred().await;

        let ops = backend.ops();
        assert_eq!(ops[0], Op::CreateVertex(u, "virtual_machine".into()));
        assert!(matches!(ops[1], Op::UpdateVertex(id, _) if id == u));
        assert!(matches!(&ops[2], Op::VertexProperty(id, name, PropValue::Int(_))
                         if *id == u && name == "deleted"));
        assert_eq!(*ops.last().unwrap(), Op::DeleteVertex(u));
    }

    #[tokio::test]
    async fn connection_loss_mid_drain_keeps_the_tail() {
        let store = Arc::new(MockStore::default());
        let backend = Arc::new(MockBackend::default());
        let s = syncer(Arc::clone(&store), Arc::clone(&backend));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert(a, resource_rows());
        store.insert(b, resource_rows());

        assert!(s.handle_notification(notification(Oper::Create, a)).await);
        assert!(s.handle_notification(notification(Oper::Create, b)).await);

        backend.closed.store(true, Ordering::SeqCst);
        s.drain_pending().await;

        // The failed head went back; nothing was lost.
        assert_eq!(s.pending_len().await, 2);
        let front = s.pending.lock().await.pop_front().unwrap();
        assert_eq!(front.uuid, a);
    }

    #[tokio::test]
    async fn delete_check_preserves_tombstone_on_incomplete_resource() {
        let store = Arc::new(MockStore::default());
        let backend = Arc::new(MockBackend::default());
        let s = syncer(Arc::clone(&store), Arc::clone(&backend));
        let u = Uuid::new_v4();
        // A partial resource: no fq_name, no id_perms.
        store.insert(u, vec![Row::new("type", r#""virtual_machine""#)]);

        s.handle_connected();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(s.handle_notification(notification(Oper::Delete, u)).await);
        s.flush_deferred().await;

        let ops = backend.ops();
        let Op::VertexProperty(_, _, PropValue::Int(tombstone)) = &ops[0] else {
            panic!("expected tombstone write, got {:?}", ops[0]);
        };
        // The incomplete snapshot is rewritten with the tombstone epoch, not
        // the decoder's -1 marker.
        assert_eq!(
            ops.last().unwrap(),
            &Op::UpdateVertex(u, Some(PropValue::Int(*tombstone)))
        );
    }

    #[tokio::test]
    async fn transient_delete_check_errors_reschedule() {
        let store = Arc::new(MockStore::default());
        let backend = Arc::new(MockBackend::default());
        let s = syncer(Arc::clone(&store), Arc::clone(&backend));
        let u = Uuid::new_v4();

        s.handle_connected();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.fail.store(true, Ordering::SeqCst);
        assert!(s.handle_notification(notification(Oper::Delete, u)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Still retrying; nothing resolved yet.
        assert_eq!(backend.ops().len(), 1);

        store.fail.store(false, Ordering::SeqCst);
        s.flush_deferred().await;
        assert_eq!(*backend.ops().last().unwrap(), Op::DeleteVertex(u));
    }

    #[tokio::test]
    async fn unknown_oper_is_nacked() {
        let store = Arc::new(MockStore::default());
        let backend = Arc::new(MockBackend::default());
        let s = syncer(store, Arc::clone(&backend));
        assert!(!s.handle_notification(notification(Oper::Unknown, Uuid::new_v4())).await);
        assert!(backend.ops().is_empty());
    }
}
