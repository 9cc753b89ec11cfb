#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use unified_memory::{config::Config, run_thread_server, telemetry::init_tracing};

/// Command-line overrides; everything else comes from the environment.
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "unified-memory", version, about = "Shared memory and coordination server")]
struct Args {
    /// SQLite database file (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<std::path::PathBuf>,

    /// Bind address (overrides API_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut cfg = Config::from_env()?;
    if let Some(db_path) = args.db_path {
        cfg.db_path = db_path;
    }
    if let Some(host) = args.host {
        cfg.api_host = host;
    }
    if let Some(port) = args.port {
        cfg.api_port = port;
    }
    cfg.validate()?;

    run_thread_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
