//! Server subcommand implementation

use super::{shutdown_signal, version::git_commit, LogArgs};
use anyhow::{bail, Result};
use clap::Args;
use poglets::Server;
use poglets_common::token::{load_token, with_env_override};
use poglets_common::{DEFAULT_BIND_ADDR, DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT, TOKEN_ENV_VAR};
use poglets_http::RouteScheme;
use poglets_observability::{init_observability, shutdown_tracing};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Port for public HTTP traffic
    #[arg(short, long, default_value_t = DEFAULT_DATA_PORT)]
    port: u16,

    /// Port clients connect to
    #[arg(short, long, default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Address for public HTTP traffic
    #[arg(long, default_value = DEFAULT_BIND_ADDR)]
    data_addr: IpAddr,

    /// Address clients connect to
    #[arg(long, default_value = DEFAULT_BIND_ADDR)]
    control_addr: IpAddr,

    /// Authentication token. TOKEN in the environment takes precedence.
    #[arg(short, long)]
    token: Option<String>,

    /// Read the token from a file
    #[arg(short = 'f', long)]
    token_from: Option<PathBuf>,

    /// Log the token in use
    #[arg(long)]
    print_token: bool,

    /// Do not ask clients to strip cross-origin response headers
    #[arg(long)]
    disable_transport_wrapping: bool,

    /// Derive route keys from: none, host or path
    #[arg(long, default_value_t = RouteScheme::None)]
    route_by: RouteScheme,

    #[command(flatten)]
    log: LogArgs,
}

pub async fn run(args: ServerArgs) -> Result<()> {
    init_observability("poglets-server", args.log.config())?;

    if args.port == args.control_port {
        bail!("--port and --control-port must differ (both {})", args.port);
    }

    let mut token = load_token(args.token.as_deref(), args.token_from.as_deref())?;
    if let Ok(value) = std::env::var(TOKEN_ENV_VAR) {
        if !value.is_empty() {
            info!("Token read from environment variable {}", TOKEN_ENV_VAR);
        }
        token = with_env_override(token, Some(value));
    }

    info!(
        "Starting poglets server v{} ({})",
        env!("CARGO_PKG_VERSION"),
        git_commit()
    );
    if args.print_token {
        info!("Server token: {:?}", token);
    }

    let mut server = Server::builder()
        .data_addr(SocketAddr::new(args.data_addr, args.port))
        .control_addr(SocketAddr::new(args.control_addr, args.control_port))
        .token(token)
        .transport_wrapping(!args.disable_transport_wrapping)
        .route_scheme(args.route_by)
        .build()?;
    server.start().await?;

    let result = tokio::select! {
        result = server.wait() => {
            if let Err(e) = &result {
                error!("Server stopped: {}", e);
            }
            result
        }
        () = shutdown_signal() => {
            info!("Draining sessions");
            server.shutdown().await
        }
    };

    shutdown_tracing();
    Ok(result?)
}
