//! Raw TCP transport

use super::{BoxedStream, Listener, Stream, Transport, TransportError};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

/// Raw TCP transport
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for TcpStream {
    fn info(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "tcp:?".to_string(),
        }
    }
}

struct TcpStreamListener {
    inner: TcpListener,
}

#[async_trait]
impl Listener for TcpStreamListener {
    async fn accept(&mut self) -> Result<BoxedStream, TransportError> {
        let (stream, _) = self.inner.accept().await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }

    fn info(&self) -> String {
        match self.inner.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "tcp:?".to_string(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpStreamListener { inner }))
    }

    async fn dial(&self, addr: &str, connect_timeout: u64) -> Result<BoxedStream, TransportError> {
        let timeout = std::time::Duration::from_secs(connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        stream.set_nodelay(true).ok();

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_listen_and_dial() {
        let transport = TcpTransport::new();
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.info();

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let mut stream = transport.dial(&addr, 5).await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        let transport = TcpTransport::new();
        // Bind then drop to get an address nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(transport.dial(&addr, 1).await.is_err());
    }
}
