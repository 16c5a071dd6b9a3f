//! Client subcommand implementation

use super::{shutdown_signal, version::git_commit, LogArgs};
use anyhow::{bail, Result};
use clap::Args;
use poglets::Client;
use poglets_common::token::load_token;
use poglets_observability::{init_observability, shutdown_tracing};
use std::path::PathBuf;
use tracing::{info, warn};

const PLAINTEXT_WARNING: &str = "\
[================================= Warning =================================]
 The control URL uses ws://, so tunnel traffic and the token cross the network
 in plain text. Use a wss:// URL, or pass --insecure if the link is trusted.
[===========================================================================]";

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server control URL, ws://host:port or wss://host
    #[arg(short = 'r', long)]
    url: Option<String>,

    /// Upstream to expose: 127.0.0.1:3000, https://host, or key=target
    #[arg(short, long)]
    upstream: Option<String>,

    /// Authentication token
    #[arg(short, long)]
    token: Option<String>,

    /// Read the token from a file
    #[arg(short = 'f', long)]
    token_from: Option<PathBuf>,

    /// Log the token in use
    #[arg(long)]
    print_token: bool,

    /// Only accept requests for the advertised route key
    #[arg(
        long,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    strict_forwarding: bool,

    /// Allow ws:// control URLs without encryption
    #[arg(long)]
    insecure: bool,

    #[command(flatten)]
    log: LogArgs,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    init_observability("poglets-client", args.log.config())?;

    let Some(url) = args.url.filter(|url| !url.is_empty()) else {
        bail!("--url is required");
    };
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        bail!("--url should be prefixed with ws:// (insecure) or wss:// (secure)");
    }
    if url.starts_with("ws://") {
        if !args.insecure {
            eprintln!("{PLAINTEXT_WARNING}");
            bail!("refusing to connect without encryption");
        }
        warn!("Running in insecure mode, without encryption");
    }
    let Some(upstream) = args.upstream.filter(|spec| !spec.is_empty()) else {
        bail!("--upstream is required");
    };

    let token = load_token(args.token.as_deref(), args.token_from.as_deref())?;
    if args.print_token {
        info!("Token: {:?}", token);
    }

    info!(
        "Starting poglets client v{} ({})",
        env!("CARGO_PKG_VERSION"),
        git_commit()
    );

    let mut client = Client::builder()
        .url(url)
        .token(token)
        .upstream(upstream)
        .strict_forwarding(args.strict_forwarding)
        .insecure(args.insecure)
        .build()?;

    let result = tokio::select! {
        started = client.start() => match started {
            Ok(info) => {
                info!("Connected, session {}", info.session_id);
                tokio::select! {
                    result = client.wait() => result,
                    () = shutdown_signal() => client.shutdown().await,
                }
            }
            Err(e) => Err(e),
        },
        () = shutdown_signal() => client.shutdown().await,
    };

    shutdown_tracing();
    Ok(result?)
}
