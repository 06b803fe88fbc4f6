//! Transport abstraction: a plain or TLS-secured byte stream.

use crate::error::ClientError;
use crate::options::{ServerAddr, TlsConfig};
use crate::tls;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    /// The byte stream under a connection.
    ///
    /// Exactly one transport is current at a time; on reconnect the old one
    /// is discarded wholesale and a new one opened against the next endpoint.
    #[project = TransportProj]
    pub enum Transport {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl Transport {
    /// Opens a transport to `addr`, upgrading to TLS when configured. The
    /// TCP connect is bounded by `timeout`.
    pub async fn connect(
        addr: &ServerAddr,
        tls_config: Option<&TlsConfig>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let tcp = tokio::time::timeout(
            timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(ClientError::Io)?;

        tcp.set_nodelay(true).ok();

        match tls_config {
            Some(cfg) if cfg.enabled => {
                let (connector, server_name) = tls::connector_for(cfg, &addr.host)?;
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                Ok(Transport::Tls { stream })
            }
            _ => Ok(Transport::Plain { stream: tcp }),
        }
    }

    /// Returns whether this transport is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_read(cx, buf),
            TransportProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_write(cx, buf),
            TransportProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_flush(cx),
            TransportProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_shutdown(cx),
            TransportProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_connect_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let addr = ServerAddr::parse(&format!("courier://{local}")).unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut transport = Transport::connect(&addr, None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!transport.is_tls());

        transport.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // 203.0.113.0/24 is reserved for documentation; packets go nowhere
        let addr = ServerAddr::parse("courier://203.0.113.1:4222").unwrap();
        let result = Transport::connect(&addr, None, Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(ClientError::Timeout) | Err(ClientError::Io(_))
        ));
    }
}
