//! Serve Neutron read requests from the config graph.

use clap::Parser;

use vnc_neutron::App;
use vnc_utils::LogArgs;

/// Translate Neutron list requests into Gremlin traversals.
#[derive(Parser, Debug)]
#[command(name = "vnc-neutron", version, about)]
struct Args {
    /// host:port of the gremlin server
    #[arg(
        long = "gremlin",
        env = "GREMLIN_NEUTRON_GREMLIN_SERVER",
        default_value = "localhost:8182"
    )]
    gremlin: String,

    /// host:port of the contrail-api server
    #[arg(
        long = "contrail-api",
        env = "GREMLIN_NEUTRON_CONTRAIL_API_SERVER",
        default_value = "localhost:8082"
    )]
    contrail_api: String,

    /// Name of the traversal source to alias g to
    #[arg(long = "graph-name", env = "GREMLIN_NEUTRON_GRAPH_NAME", default_value = "g")]
    graph_name: String,

    #[command(flatten)]
    log: LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    vnc_utils::init_tracing(&args.log);

    let app = App::new(
        format!("ws://{}/gremlin", args.gremlin),
        &args.contrail_api,
        args.graph_name,
    );
    app.start();

    vnc_neutron::run_server(app, "0.0.0.0:8080").await
}
