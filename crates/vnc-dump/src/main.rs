//! Dump the VNC config DB as a line-delimited GraphSON snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use vnc_store::CqlStore;
use vnc_utils::LogArgs;

/// Dump the VNC config DB into a GraphSON file loadable by gremlin-server.
#[derive(Parser, Debug)]
#[command(name = "vnc-dump", version, about)]
struct Args {
    /// List of cassandra nodes, using CQL port 9042
    #[arg(
        long = "cassandra",
        env = "GREMLIN_DUMP_CASSANDRA_SERVERS",
        value_delimiter = ',',
        default_value = "localhost"
    )]
    cassandra: Vec<String>,

    /// Output file path
    #[arg(value_name = "DST")]
    dst: PathBuf,

    #[command(flatten)]
    log: LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    vnc_utils::init_tracing(&args.log);

    let store = CqlStore::connect(&args.cassandra)
        .await
        .context("Failed to connect to Cassandra")?;

    vnc_dump::dump(Arc::new(store), &args.dst).await?;
    Ok(())
}
