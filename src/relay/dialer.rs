//! Dialer-side multiplexer
//!
//! Owns the transport factory and the target address. Every OPEN frame from
//! the peer triggers a dial; a successful dial registers a sub-connection
//! record that is established from birth.

use super::channel::spawn_sub_conn;
use super::{ConnRecord, ConnRegistry, Frame, FrameRouter, RelayError};
use crate::config::TunnelConfig;
use crate::transport::{transport_for, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Dialer-side multiplexer handle
pub struct Dialer {
    config: TunnelConfig,
    registry: Arc<ConnRegistry>,
    main: Arc<ConnRecord>,
    token: CancellationToken,
    transport: Arc<dyn Transport>,
    target: String,
}

impl Dialer {
    /// Build the dialer for `target`. Work is spawned per OPEN request
    /// under the endpoint token.
    pub fn new(
        token: CancellationToken,
        proto: &str,
        target: &str,
        config: TunnelConfig,
        main: Arc<ConnRecord>,
    ) -> Result<Arc<Self>, RelayError> {
        let transport = transport_for(proto)?;
        Ok(Arc::new(Self {
            config,
            registry: Arc::new(ConnRegistry::new()),
            main,
            token,
            transport,
            target: target.to_string(),
        }))
    }

    /// Live sub-connections.
    pub fn registry(&self) -> &Arc<ConnRegistry> {
        &self.registry
    }

    /// Stop accepting OPEN requests and wind down every sub-connection.
    pub fn close(&self) {
        self.token.cancel();
    }

    fn open_task(&self) -> OpenTask {
        OpenTask {
            config: self.config.clone(),
            registry: self.registry.clone(),
            main: self.main.clone(),
            token: self.token.clone(),
            transport: self.transport.clone(),
            target: self.target.clone(),
        }
    }

    /// Push a DATA frame onto its record's outbound queue, toward the
    /// target stream. Unknown ids are silently dropped.
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

#[async_trait]
impl FrameRouter for Dialer {
    async fn route(&self, frame: Frame) -> Result<(), RelayError> {
        match frame {
            Frame::Open { id } => {
                // A slow dial must not stall dispatch (and the ping loop).
                tokio::spawn(self.open_task().run(id));
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

/// One OPEN request in flight: dial the target and report the verdict.
struct OpenTask {
    config: TunnelConfig,
    registry: Arc<ConnRegistry>,
    main: Arc<ConnRecord>,
    token: CancellationToken,
    transport: Arc<dyn Transport>,
    target: String,
}

impl OpenTask {
    async fn run(self, id: String) {
        let verdict = self.dial_and_register(&id).await;

        let (accepted, message) = match verdict {
            Ok(()) => (true, String::new()),
            Err(err) => (false, open_failure_message(&err)),
        };

        let reply = Frame::OpenRsp {
            id,
            accepted,
            message,
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            _ = self.main.outbound().send(reply) => {}
        }
    }

    async fn dial_and_register(&self, id: &str) -> Result<(), RelayError> {
        if self.token.is_cancelled() {
            return Err(RelayError::ForcedClose);
        }

        let stream = match self
            .transport
            .dial(&self.target, self.config.connect_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                error!(%id, target = %self.target, %err, "dial failed");
                return Err(RelayError::DialFailed("Dial fail".to_string()));
            }
        };

        let info = stream.info();
        let (record, queues) = ConnRecord::new(id.to_string(), info, self.config.conn_buffer);
        record.set_established();

        if let Err(err) = self.registry.insert(record.clone()) {
            error!(%id, %err, "sub-connection registration failed");
            return Err(err);
        }

        info!(%id, info = record.info(), "target dialed");
        spawn_sub_conn(
            &self.token,
            self.registry.clone(),
            record,
            queues,
            stream,
            self.main.outbound().clone(),
            &self.config,
        );

        Ok(())
    }
}

/// Wire message carried back in OPEN_RSP when an open fails.
fn open_failure_message(err: &RelayError) -> String {
    match err {
        RelayError::DialFailed(message) => message.clone(),
        RelayError::DuplicateId(_) => "duplicate id".to_string(),
        RelayError::ForcedClose => "closed".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn main_record() -> (Arc<ConnRecord>, crate::relay::ConnQueues) {
        ConnRecord::new(String::new(), "main".to_string(), 16)
    }

    fn dialer_for(target: &str, main: Arc<ConnRecord>) -> Arc<Dialer> {
        Dialer::new(
            CancellationToken::new(),
            "tcp",
            target,
            TunnelConfig::default(),
            main,
        )
        .unwrap()
    }

    /// An address with nothing listening on it.
    async fn unreachable_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    /// A target that accepts and holds every connection.
    async fn hold_target() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let mut socks = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                socks.push(sock);
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_dial_and_register_reports_dial_failed() {
        let (main, _main_queues) = main_record();
        let dialer = dialer_for(&unreachable_addr().await, main);

        let err = dialer.open_task().dial_and_register("x").await.unwrap_err();
        assert!(matches!(err, RelayError::DialFailed(msg) if msg == "Dial fail"));
        assert!(dialer.registry().is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_replies_dial_fail() {
        let (main, mut main_queues) = main_record();
        let dialer = dialer_for(&unreachable_addr().await, main);

        dialer.open_task().run("x".to_string()).await;

        match main_queues.outbound_rx.recv().await.unwrap() {
            Frame::OpenRsp {
                id,
                accepted,
                message,
            } => {
                assert_eq!(id, "x");
                assert!(!accepted);
                assert_eq!(message, "Dial fail");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(dialer.registry().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_and_existing_record_kept() {
        let (addr, target) = hold_target().await;
        let (main, mut main_queues) = main_record();
        let dialer = dialer_for(&addr, main);

        dialer.open_task().run("dup".to_string()).await;
        match main_queues.outbound_rx.recv().await.unwrap() {
            Frame::OpenRsp { accepted, .. } => assert!(accepted),
            other => panic!("unexpected frame: {:?}", other),
        }
        let existing = dialer.registry().get("dup").unwrap();
        assert!(existing.is_established());

        dialer.open_task().run("dup".to_string()).await;
        match main_queues.outbound_rx.recv().await.unwrap() {
            Frame::OpenRsp {
                id,
                accepted,
                message,
            } => {
                assert_eq!(id, "dup");
                assert!(!accepted);
                assert_eq!(message, "duplicate id");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // The colliding open left the original record untouched.
        assert_eq!(dialer.registry().len(), 1);
        assert!(!existing.needs_close());

        target.abort();
    }

    #[tokio::test]
    async fn test_close_frame_latches_needs_close() {
        let (main, _main_queues) = main_record();
        let dialer = dialer_for("127.0.0.1:1", main);

        let (record, _queues) = ConnRecord::new("abc".to_string(), "target".to_string(), 8);
        dialer.registry().insert(record.clone()).unwrap();

        dialer
            .route(Frame::Close {
                id: "abc".to_string(),
                message: "bye".to_string(),
            })
            .await
            .unwrap();
        assert!(record.needs_close());

        // Unknown ids are ignored.
        dialer
            .route(Frame::Close {
                id: "ghost".to_string(),
                message: String::new(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_data_for_unknown_id_is_dropped() {
        let (main, _main_queues) = main_record();
        let dialer = dialer_for("127.0.0.1:1", main);

        dialer
            .route(Frame::Data {
                id: "ghost".to_string(),
                payload: bytes::Bytes::from_static(b"hi"),
                compressed: false,
            })
            .await
            .unwrap();
        assert!(dialer.registry().is_empty());
    }
}
