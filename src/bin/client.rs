//! muxtun client
//!
//! Acceptor-side tunnel endpoint: dials the server's main channel, logs in
//! with the shared key, and relays every connection accepted on the local
//! listening socket across the tunnel.

use anyhow::Result;
use clap::Parser;
use muxtun::config::Config;
use muxtun::relay::{
    drive_group, run_dispatch, spawn_main_channel, Acceptor, ChannelRole, ClientKind, FrameRouter,
};
use muxtun::transport::transport_for;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// muxtun client - acceptor-side tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "muxtun-client")]
#[command(about = "muxtun client - acceptor-side tunnel endpoint")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server main-channel address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local listen address for user connections (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Endpoint kind announced at login (proxy, reverse-proxy)
    #[arg(short, long, default_value = "proxy")]
    kind: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    Ok(run(args).await?)
}

async fn run(args: Args) -> muxtun::Result<()> {
    let config = Config::load(&args.config).unwrap_or_else(|err| {
        warn!(%err, path = %args.config, "config not loaded, using defaults");
        Config::default()
    });
    let client = config.client.clone().unwrap_or_default();
    let tunnel = config.tunnel.clone();

    let server_addr = args.server.unwrap_or(client.server);
    let listen = args.listen.unwrap_or(client.listen);
    let kind = match args.kind.as_str() {
        "proxy" => ClientKind::Proxy,
        "reverse-proxy" => ClientKind::ReverseProxy,
        other => {
            return Err(muxtun::Error::Config(format!(
                "unknown endpoint kind: {}",
                other
            )));
        }
    };

    info!("muxtun client v{}", muxtun::VERSION);
    info!(server = %server_addr, %listen, proto = %tunnel.proto, "starting");

    let transport = transport_for(&tunnel.proto)?;
    let stream = transport.dial(&server_addr, tunnel.connect_timeout).await?;
    info!(peer = %stream.info(), "main channel connected");

    let root = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let main = spawn_main_channel(&mut tasks, &root, stream, &tunnel);
    let acceptor = Acceptor::new(
        &mut tasks,
        root.clone(),
        &tunnel.proto,
        &listen,
        tunnel.clone(),
        main.record.clone(),
    )
    .await?;

    let router: Arc<dyn FrameRouter> = acceptor.clone();
    tasks.spawn(run_dispatch(
        root.clone(),
        main.record.clone(),
        main.inbound_rx,
        router,
        ChannelRole::Initiator,
        kind,
        tunnel,
    ));

    let shutdown = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown.cancel();
        }
    });

    let result = drive_group(root, tasks).await;
    acceptor.close();
    result?;

    Ok(())
}
