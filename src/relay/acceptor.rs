//! Acceptor-side multiplexer
//!
//! Owns the listening transport. Every accepted user stream becomes a
//! sub-connection record announced to the peer with an OPEN frame; the
//! record stays unestablished until the peer's OPEN_RSP verdict arrives.

use super::channel::spawn_sub_conn;
use super::{unique_id, ConnRecord, ConnRegistry, Frame, FrameRouter, RelayError};
use crate::config::TunnelConfig;
use crate::transport::{transport_for, Listener};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Acceptor-side multiplexer handle
pub struct Acceptor {
    config: TunnelConfig,
    registry: Arc<ConnRegistry>,
    main: Arc<ConnRecord>,
    token: CancellationToken,
    listen_info: String,
}

impl Acceptor {
    /// Open the listening endpoint and spawn the accept loop into the
    /// caller's task group.
    pub async fn new(
        tasks: &mut JoinSet<Result<(), RelayError>>,
        token: CancellationToken,
        proto: &str,
        listen_addr: &str,
        config: TunnelConfig,
        main: Arc<ConnRecord>,
    ) -> Result<Arc<Self>, RelayError> {
        let transport = transport_for(proto)?;
        let listener = transport.listen(listen_addr).await?;
        let listen_info = listener.info();
        info!(addr = %listen_info, "acceptor listening");

        let acceptor = Arc::new(Self {
            config,
            registry: Arc::new(ConnRegistry::new()),
            main,
            token,
            listen_info,
        });

        let this = acceptor.clone();
        tasks.spawn(this.accept_loop(listener));

        Ok(acceptor)
    }

    /// Live sub-connections.
    pub fn registry(&self) -> &Arc<ConnRegistry> {
        &self.registry
    }

    /// Address the listening endpoint actually bound.
    pub fn listen_info(&self) -> &str {
        &self.listen_info
    }

    /// Close the listening socket and wind down every sub-connection.
    pub fn close(&self) {
        self.token.cancel();
    }

    async fn accept_loop(
        self: Arc<Self>,
        mut listener: Box<dyn Listener>,
    ) -> Result<(), RelayError> {
        loop {
            let stream = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                res = listener.accept() => match res {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                },
            };

            let id = unique_id();
            let info = stream.info();
            info!(%id, %info, "user stream accepted");

            let (record, queues) = ConnRecord::new(id.clone(), info, self.config.conn_buffer);
            if let Err(err) = self.registry.insert(record.clone()) {
                error!(%id, %err, "sub-connection registration failed");
                continue;
            }

            spawn_sub_conn(
                &self.token,
                self.registry.clone(),
                record,
                queues,
                stream,
                self.main.outbound().clone(),
                &self.config,
            );

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                res = self.main.outbound().send(Frame::Open { id }) => {
                    if res.is_err() {
                        return Err(RelayError::QueueClosed);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl FrameRouter for Acceptor {
    async fn route(&self, frame: Frame) -> Result<(), RelayError> {
        match frame {
            Frame::OpenRsp {
                id,
                accepted,
                message,
            } => {
                let Some(record) = self.registry.get(&id) else {
                    debug!(%id, "OPEN_RSP for unknown id");
                    return Ok(());
                };
                if accepted {
                    record.set_established();
                    info!(%id, "sub-connection established");
                } else {
                    record.request_close();
                    info!(%id, %message, "open rejected by peer");
                }
            }
            Frame::Data { .. } => self.deliver_data(frame).await,
            Frame::Close { id, message } => {
                if let Some(record) = self.registry.get(&id) {
                    debug!(%id, %message, "peer close");
                    record.request_close();
                }
            }
            other => {
                warn!(kind = other.kind_name(), "unroutable frame on main channel");
            }
        }
        Ok(())
    }
}

impl Acceptor {
    /// Push a DATA frame onto its record's outbound queue, toward the user
    /// stream. Unknown ids are silently dropped.
    async fn deliver_data(&self, frame: Frame) {
        let Frame::Data { id, .. } = &frame else {
            return;
        };
        let Some(record) = self.registry.get(id) else {
            debug!(%id, "DATA for unknown id");
            return;
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            res = record.outbound().send(frame) => {
                if res.is_ok() {
                    record.touch_activity();
                }
            }
        }
    }
}
