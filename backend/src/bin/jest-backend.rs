//! Jest backend binary
//!
//! Loads the configuration, opens the metadata store, discovers the managed
//! root and serves the API on a unix socket.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use jest_backend::Jest;
use jest_backend::config::JestConfig;
use jest_backend::server::SocketServer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "jest-backend", version, about = "ZFS-backed FreeBSD jail provisioning service")]
struct Args {
    /// Configuration file (defaults to the standard search locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unix socket to listen on, overriding the configuration
    #[arg(short, long)]
    socket: Option<String>,

    /// Metadata database path, overriding the configuration
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => JestConfig::load(path)?,
        None => JestConfig::load_defaults()?,
    };
    if let Some(socket) = args.socket {
        config.storage.socket_path = socket;
    }
    if let Some(database) = args.database {
        config.storage.database_path = database;
    }

    // RUST_LOG wins over the configured filter
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.logging.filter))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Jest - ZFS jail provisioning service");

    #[cfg(unix)]
    if unsafe { libc::getuid() } != 0 {
        tracing::warn!("Not running as root. Dataset, chroot and jail operations require root privileges.");
    }

    let socket_path = config.storage.socket_path.clone();
    let jest = Arc::new(Jest::for_host(config)?);

    let server = SocketServer::new(socket_path, jest);
    tracing::info!("Starting Jest API server...");
    server.run().await?;

    Ok(())
}
