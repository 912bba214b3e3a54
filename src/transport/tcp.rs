//! TCP transport with a pre-flight reachability probe (spec.md §4.1).

use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub struct TcpTransport {
    addr: SocketAddr,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, stream: None }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, deadline: Duration) -> Result<(), TransportError> {
        // Pre-flight reachability probe: a short-timeout connect attempt
        // distinct from the handshake itself, so callers can tell
        // "nothing is listening" apart from "listening but not
        // responding" (spec.md §4.1).
        let probe_timeout = deadline.min(Duration::from_millis(500));
        match tokio::time::timeout(probe_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                self.stream = Some(stream);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(addr = %self.addr, error = %e, "TCP connect refused/failed");
                Err(TransportError::Unreachable(self.addr.to_string()))
            }
            Err(_) => {
                debug!(addr = %self.addr, "TCP connect probe timed out");
                Err(TransportError::HandshakeTimeout(probe_timeout))
            }
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        tokio::time::timeout(deadline, stream.read_exact(buf))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(deadline))?
            .map_err(TransportError::Io)?;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8], deadline: Duration) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        tokio::time::timeout(deadline, stream.write_all(buf))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(deadline))?
            .map_err(TransportError::Io)?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
