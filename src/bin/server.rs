//! muxtun server
//!
//! Dialer-side tunnel endpoint: listens for peer main channels, verifies
//! the login key, and re-originates every relayed sub-connection toward the
//! configured target address.

use anyhow::Result;
use clap::Parser;
use muxtun::config::Config;
use muxtun::relay::{
    drive_group, run_dispatch, spawn_main_channel, ChannelRole, ClientKind, Dialer, FrameRouter,
    RelayError,
};
use muxtun::transport::{transport_for, BoxedStream};
use muxtun::TunnelConfig;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// muxtun server - dialer-side tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "muxtun-server")]
#[command(about = "muxtun server - dialer-side tunnel endpoint")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Main-channel listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Target address dialed for each sub-connection (overrides config)
    #[arg(short, long)]
    target: Option<String>,

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
    let server = config.server.clone().unwrap_or_default();
    let tunnel = config.tunnel.clone();

    let listen = args.listen.unwrap_or(server.listen);
    let target = args.target.unwrap_or(server.target);

    info!("muxtun server v{}", muxtun::VERSION);
    info!(%listen, %target, proto = %tunnel.proto, "starting");

    let transport = transport_for(&tunnel.proto)?;
    let mut listener = transport.listen(&listen).await?;
    info!(addr = %listener.info(), "main channel listening");

    let root = CancellationToken::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                root.cancel();
                break;
            }
            res = listener.accept() => match res {
                Ok(stream) => {
                    info!(peer = %stream.info(), "main channel accepted");
                    let token = root.child_token();
                    let tunnel = tunnel.clone();
                    let target = target.clone();
                    tokio::spawn(async move {
                        match run_session(token, stream, tunnel, target).await {
                            Ok(()) => info!("session ended"),
                            Err(err) => error!(%err, "session ended"),
                        }
                    });
                }
                Err(err) => warn!(%err, "main channel accept failed"),
            },
        }
    }

    Ok(())
}

/// Run one main channel and its dialer-side multiplexer to completion.
async fn run_session(
    token: CancellationToken,
    stream: BoxedStream,
    config: TunnelConfig,
    target: String,
) -> Result<(), RelayError> {
    let mut tasks = JoinSet::new();

    let main = spawn_main_channel(&mut tasks, &token, stream, &config);
    let dialer = Dialer::new(
        token.clone(),
        &config.proto,
        &target,
        config.clone(),
        main.record.clone(),
    )?;

    let router: Arc<dyn FrameRouter> = dialer.clone();
    tasks.spawn(run_dispatch(
        token.clone(),
        main.record.clone(),
        main.inbound_rx,
        router,
        ChannelRole::Responder,
        ClientKind::Proxy,
        config,
    ));

    let result = drive_group(token, tasks).await;
    dialer.close();
    result
}
