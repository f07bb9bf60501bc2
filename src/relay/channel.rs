//! Main-channel bring-up, login, and frame dispatch
//!
//! The main channel is a single framed stream shared by both multiplexers.
//! Its record gets framed pumps, the ping watchdog, and the forced-close
//! watcher; a dispatch task consumes the inbound queue, drives the login
//! exchange, answers pings, and hands everything else to the endpoint's
//! router. Sub-connection task groups are spawned from here as well so both
//! multiplexers share one teardown path.

use super::{
    monotonic_ns, pump, watchdog, ClientKind, ConnRecord, ConnRegistry, Frame, FrameCodec,
    RelayError,
};
use crate::config::TunnelConfig;
use crate::relay::record::ConnQueues;
use crate::transport::BoxedStream;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which side of the login exchange this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Sends LOGIN on startup and waits for the verdict.
    Initiator,
    /// Verifies the key from the peer's LOGIN and replies.
    Responder,
}

/// Endpoint-specific frame routing (OPEN, OPEN_RSP, DATA, CLOSE).
#[async_trait]
pub trait FrameRouter: Send + Sync {
    async fn route(&self, frame: Frame) -> Result<(), RelayError>;
}

/// A main channel ready for dispatch: its record plus the inbound queue.
pub struct MainChannel {
    pub record: Arc<ConnRecord>,
    pub inbound_rx: mpsc::Receiver<Frame>,
}

/// Create the main-channel record and spawn its pumps and watchdogs into
/// the caller's task group.
pub fn spawn_main_channel(
    tasks: &mut JoinSet<Result<(), RelayError>>,
    token: &CancellationToken,
    stream: BoxedStream,
    config: &TunnelConfig,
) -> MainChannel {
    let info = stream.info();
    let (record, queues) = ConnRecord::new(String::new(), info, config.main_buffer);
    let (rd, wr) = tokio::io::split(stream);
    let codec = FrameCodec::new(config.compress, &config.encrypt);

    tasks.spawn(pump::framed_recv(
        token.clone(),
        record.clone(),
        rd,
        codec.clone(),
        config.max_msg_size,
    ));
    tasks.spawn(pump::framed_send(
        token.clone(),
        record.clone(),
        queues.outbound_rx,
        wr,
        codec,
        config.max_msg_size,
    ));
    tasks.spawn(watchdog::check_main_active(
        token.clone(),
        record.clone(),
        config.established_timeout,
        config.ping_interval,
        config.ping_timeout_count,
    ));
    tasks.spawn(watchdog::check_needs_close(token.clone(), record.clone()));

    MainChannel {
        record,
        inbound_rx: queues.inbound_rx,
    }
}

/// Drive the main channel: login exchange, ping/pong, endpoint routing.
///
/// Runs until cancellation, a queue closes, or a fatal protocol event. A
/// rejected peer login is flushed through the send pump and then torn down
/// via the forced-close watcher rather than by killing the group before the
/// verdict reaches the wire.
pub async fn run_dispatch(
    token: CancellationToken,
    record: Arc<ConnRecord>,
    mut inbound_rx: mpsc::Receiver<Frame>,
    router: Arc<dyn FrameRouter>,
    role: ChannelRole,
    kind: ClientKind,
    config: TunnelConfig,
) -> Result<(), RelayError> {
    if role == ChannelRole::Initiator {
        let login = Frame::Login {
            kind,
            key: config.key.clone(),
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            res = record.outbound().send(login) => {
                if res.is_err() {
                    return Err(RelayError::QueueClosed);
                }
            }
        }
        info!(info = record.info(), "login sent");
    }

    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            frame = inbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => return Err(RelayError::QueueClosed),
            },
        };

        match frame {
            Frame::Login { kind, key } => {
                if role != ChannelRole::Responder {
                    warn!(info = record.info(), "unexpected LOGIN, ignoring");
                    continue;
                }
                if key == config.key {
                    send_or_bail(&token, &record, Frame::LoginRsp {
                        accepted: true,
                        message: String::new(),
                    })
                    .await?;
                    record.set_established();
                    info!(info = record.info(), ?kind, "login accepted");
                } else {
                    send_or_bail(&token, &record, Frame::LoginRsp {
                        accepted: false,
                        message: "bad key".to_string(),
                    })
                    .await?;
                    record.request_close();
                    error!(info = record.info(), "login rejected: bad key");
                }
            }
            Frame::LoginRsp { accepted, message } => {
                if accepted {
                    record.set_established();
                    info!(info = record.info(), "login accepted by peer");
                } else {
                    error!(info = record.info(), %message, "login rejected by peer");
                    return Err(RelayError::LoginRejected(message));
                }
            }
            Frame::Ping { time } => {
                send_or_bail(&token, &record, Frame::Pong { time }).await?;
            }
            Frame::Pong { time } => {
                record.pong_received();
                debug!(
                    info = record.info(),
                    elapse_ns = monotonic_ns().saturating_sub(time),
                    "pong"
                );
            }
            other => router.route(other).await?,
        }
    }
}

async fn send_or_bail(
    token: &CancellationToken,
    record: &ConnRecord,
    frame: Frame,
) -> Result<(), RelayError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Ok(()),
        res = record.outbound().send(frame) => {
            if res.is_err() {
                Err(RelayError::QueueClosed)
            } else {
                Ok(())
            }
        }
    }
}

/// Await every task of a failure group. The first error cancels the group's
/// token so siblings drain; the error is returned once all tasks exited.
pub async fn drive_group(
    token: CancellationToken,
    mut tasks: JoinSet<Result<(), RelayError>>,
) -> Result<(), RelayError> {
    let mut first_err: Option<RelayError> = None;

    while let Some(res) = tasks.join_next().await {
        let failed = match res {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(join_err) => Some(RelayError::TaskFailed(join_err.to_string())),
        };

        if let Some(err) = failed {
            token.cancel();
            if first_err.is_none() {
                first_err = Some(err);
            } else {
                debug!(%err, "follow-up group error");
            }
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Spawn the five-task group of one sub-connection and its supervisor.
///
/// The supervisor owns the group: it waits for every task to exit, removes
/// the record from the registry, and on an error end notifies the peer with
/// a CLOSE frame so the twin record goes down too.
pub(crate) fn spawn_sub_conn(
    parent: &CancellationToken,
    registry: Arc<ConnRegistry>,
    record: Arc<ConnRecord>,
    queues: ConnQueues,
    stream: BoxedStream,
    main_outbound: mpsc::Sender<Frame>,
    config: &TunnelConfig,
) {
    let token = parent.child_token();
    let mut tasks = JoinSet::new();
    let (rd, wr) = tokio::io::split(stream);

    tasks.spawn(pump::raw_recv(
        token.clone(),
        record.clone(),
        rd,
        config.max_msg_size,
    ));
    tasks.spawn(pump::raw_send(
        token.clone(),
        record.clone(),
        queues.outbound_rx,
        wr,
        config.max_msg_size,
    ));
    tasks.spawn(watchdog::check_conn_active(
        token.clone(),
        record.clone(),
        config.established_timeout,
        config.conn_idle_timeout,
    ));
    tasks.spawn(watchdog::check_needs_close(token.clone(), record.clone()));
    tasks.spawn(pump::forward_to_main(
        token.clone(),
        record.clone(),
        queues.inbound_rx,
        main_outbound.clone(),
    ));

    tokio::spawn(async move {
        info!(id = record.id(), info = record.info(), "sub-connection start");

        let result = drive_group(token, tasks).await;
        registry.remove(record.id());

        match result {
            Ok(()) => info!(id = record.id(), "sub-connection end"),
            Err(err) => {
                let _ = main_outbound.try_send(Frame::Close {
                    id: record.id().to_string(),
                    message: err.to_string(),
                });
                info!(id = record.id(), %err, "sub-connection end");
            }
        }
    });
}
