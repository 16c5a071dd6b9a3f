//! poglets CLI
//!
//! Expose a local HTTP service through a public poglets server.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "poglets",
    author,
    version,
    about = "Reverse tunnel for exposing local HTTP services",
    long_about = "poglets relays public HTTP traffic from a server to a client over a \
                  single WebSocket connection.\n\n\
                  Run `poglets server` on a public host and `poglets client` next to the \
                  service you want to expose.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server
    Server(commands::server::ServerArgs),

    /// Run the tunnel client
    Client(commands::client::ClientArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // rustls needs a process-wide provider before the first wss:// dial
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Commands::Server(args) => commands::server::run(args).await,
        Commands::Client(args) => commands::client::run(args).await,
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}
