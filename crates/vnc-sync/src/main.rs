//! Keep the Gremlin server synchronized with the VNC config DB.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use vnc_graph::server::ServerBackend;
use vnc_store::CqlStore;
use vnc_sync::rabbit::{self, RabbitConfig};
use vnc_sync::sync::Syncer;
use vnc_utils::LogArgs;

/// Sync VNC config resources into a Gremlin server.
#[derive(Parser, Debug)]
#[command(name = "vnc-sync", version, about)]
struct Args {
    /// host:port of the gremlin server
    #[arg(long = "gremlin", env = "GREMLIN_SYNC_GREMLIN_SERVER", default_value = "localhost:8182")]
    gremlin: String,

    /// List of cassandra nodes, using CQL port 9042
    #[arg(
        long = "cassandra",
        env = "GREMLIN_SYNC_CASSANDRA_SERVERS",
        value_delimiter = ',',
        default_value = "localhost"
    )]
    cassandra: Vec<String>,

    /// host:port of the rabbitmq server
    #[arg(long = "rabbit", env = "GREMLIN_SYNC_RABBIT_SERVER", default_value = "localhost:5672")]
    rabbit: String,

    /// vhost of the rabbitmq server
    #[arg(long = "rabbit-vhost", env = "GREMLIN_SYNC_RABBIT_VHOST", default_value = "opencontrail")]
    rabbit_vhost: String,

    /// user for the rabbitmq server
    #[arg(long = "rabbit-user", env = "GREMLIN_SYNC_RABBIT_USER", default_value = "opencontrail")]
    rabbit_user: String,

    /// password for the rabbitmq server
    #[arg(long = "rabbit-password", env = "GREMLIN_SYNC_RABBIT_PASSWORD", default_value = "")]
    rabbit_password: String,

    /// name of the rabbitmq queue
    #[arg(
        long = "rabbit-queue",
        env = "GREMLIN_SYNC_RABBIT_QUEUE",
        default_value = rabbit::DEFAULT_QUEUE
    )]
    rabbit_queue: String,

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

    let backend = Arc::new(ServerBackend::new(format!("ws://{}/gremlin", args.gremlin)));
    let syncer = Arc::new(Syncer::new(Arc::new(store), Arc::clone(&backend)));

    {
        let syncer = Arc::clone(&syncer);
        backend.on_connected(move || syncer.handle_connected());
    }
    {
        let syncer = Arc::clone(&syncer);
        backend.on_disconnected(move || syncer.handle_disconnected());
    }
    backend.start();

    let config = RabbitConfig {
        server: args.rabbit,
        vhost: args.rabbit_vhost,
        user: args.rabbit_user,
        password: args.rabbit_password,
        queue: args.rabbit_queue,
    };
    let (_connection, consumer) =
        rabbit::consume(&config).await.context("Failed to set up RabbitMQ consumer")?;

    info!("Listening for updates. To exit press CTRL+C");
    tokio::select! {
        _ = rabbit::run(Arc::clone(&syncer), consumer) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    // Flush in-flight delete verifications before dropping the connection.
    syncer.flush_deferred().await;
    backend.stop();
    Ok(())
}
