//! Extract engine: dump every config resource as line-delimited GraphSON.
//!
//! A producer task scans the fq-name table for UUIDs, a fixed pool of
//! decoder tasks reads and decodes row-sets, and the GraphSON writer task
//! owns the output file. A reporter renders a single-line progress
//! indicator on stdout while logs go to stderr.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::BufWriter;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use vnc_graph::gson::GsonBackend;
use vnc_graph::Error as GraphError;
use vnc_store::{get_resource, Store};

/// Number of concurrent resource decoders.
pub const READERS: usize = 10;

/// Progress events consumed by the reporter task.
#[derive(Debug, Clone, Copy)]
pub enum Progress {
    ScanStarted,
    ResourceRead,
    VertexWritten,
    DuplicateVertex,
    ScanDone,
}

/// Final counters for one extract run.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DumpStats {
    pub read: u64,
    pub written: u64,
    pub duplicates: u64,
}

/// Run a full extract of the store into the GraphSON file at `path`.
pub async fn dump<S: Store + 'static>(store: Arc<S>, path: &Path) -> anyhow::Result<DumpStats> {
    let output = tokio::fs::File::create(path).await?;
    let backend = Arc::new(GsonBackend::start(BufWriter::new(output)));
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(report(progress_rx));

    let (uuid_tx, uuid_rx) = mpsc::channel(READERS * 2);
    let uuid_rx = Arc::new(Mutex::new(uuid_rx));

    let started = Instant::now();
    let producer = {
        let store = Arc::clone(&store);
        let progress = progress_tx.clone();
        tokio::spawn(async move {
            let _ = progress.send(Progress::ScanStarted);
            if let Err(e) = store.scan_uuids(uuid_tx).await {
                error!(error = %e, "Resource scan failed");
                return Err(e);
            }
            Ok(())
        })
    };

    let mut decoders = JoinSet::new();
    for _ in 0..READERS {
        let store = Arc::clone(&store);
        let backend = Arc::clone(&backend);
        let uuid_rx = Arc::clone(&uuid_rx);
        let progress = progress_tx.clone();
        decoders.spawn(async move {
            loop {
                let uuid = { uuid_rx.lock().await.recv().await };
                let Some(uuid) = uuid else { break };
                let vertex = match get_resource(store.as_ref(), uuid).await {
                    Ok(vertex) => vertex,
                    Err(e) => {
                        warn!(uuid = %uuid, error = %e, "Failed to read resource");
                        continue;
                    }
                };
                let _ = progress.send(Progress::ResourceRead);
                match backend.create(vertex).await {
                    Ok(()) => {
                        let _ = progress.send(Progress::VertexWritten);
                    }
                    Err(GraphError::DuplicateVertex) => {
                        let _ = progress.send(Progress::DuplicateVertex);
                    }
                    Err(e) => error!(uuid = %uuid, error = %e, "Failed to write vertex"),
                }
            }
        });
    }

    // Teardown order matters: decoders first, then the writer flushes its
    // pending placeholders, then the reporter drains.
    let scan = producer.await?;
    while decoders.join_next().await.is_some() {}
    let backend = Arc::into_inner(backend).expect("decoders still hold the backend");
    backend.stop().await?;
    let _ = progress_tx.send(Progress::ScanDone);
    drop(progress_tx);
    let stats = reporter.await?;

    scan?;
    info!(
        read = stats.read,
        written = stats.written,
        duplicates = stats.duplicates,
        "Dump done in {:.2}s",
        started.elapsed().as_secs_f64()
    );
    Ok(stats)
}

/// Render a carriage-returned status line until the progress channel closes.
async fn report(mut progress: mpsc::UnboundedReceiver<Progress>) -> DumpStats {
    use std::io::Write;

    let mut stats = DumpStats::default();
    let mut status = 'W';
    while let Some(event) = progress.recv().await {
        match event {
            Progress::ScanStarted => status = 'R',
            Progress::ResourceRead => stats.read += 1,
            Progress::VertexWritten => stats.written += 1,
            Progress::DuplicateVertex => stats.duplicates += 1,
            Progress::ScanDone => status = 'D',
        }
        print!(
            "\rProcessing resources [read:{} write:{} dup:{}] {}",
            stats.read, stats.written, stats.duplicates, status
        );
        let _ = std::io::stdout().flush();
    }
    println!();
    stats
}
