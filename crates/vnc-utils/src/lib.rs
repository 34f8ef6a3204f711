//! Shared CLI plumbing for the three executables.

use clap::Args;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Logging flags common to every binary.
#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log-level", env = "GREMLIN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Disable colored log output
    #[arg(long = "log-no-color", env = "GREMLIN_LOG_NO_COLOR")]
    pub log_no_color: bool,
}

/// Initialize tracing to stderr.
///
/// Logs go to stderr so stdout stays free for data output (the extract
/// progress line in particular). `RUST_LOG` overrides `--log-level`.
pub fn init_tracing(args: &LogArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!args.log_no_color),
        )
        .init();
}
