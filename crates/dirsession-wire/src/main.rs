//! Directory server binary.
//!
//! Serves an in-memory directory over a Unix domain socket.

use std::path::PathBuf;

use clap::Parser;
use dirsession_wire::{Directory, DirectoryServer};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dirsession-server", about = "In-memory directory server over a Unix socket")]
struct Cli {
    /// Socket path [default: <data dir>/dirsession/server.sock]
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Naming context created at startup. May be repeated.
    #[arg(long = "suffix", default_value = "dc=example,dc=com")]
    suffixes: Vec<String>,
}

fn default_socket_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dirsession")
        .join("server.sock")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let socket_path = cli.socket.unwrap_or_else(default_socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let directory = Directory::new();
    for suffix in &cli.suffixes {
        directory.add_suffix(suffix)?;
    }
    info!(socket = %socket_path.display(), suffixes = ?cli.suffixes, "starting");

    let server = DirectoryServer::new(directory, socket_path);
    server.run().await?;

    Ok(())
}
