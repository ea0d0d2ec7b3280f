//! Transport plumbing shared by both endpoint roles.
//!
//! Endpoints speak the same framed dialect over plain TCP or TLS; this
//! module erases the difference behind [`BoxedStream`]. TLS contexts
//! arrive fully configured from the application; no certificate or
//! trust construction happens here.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::Result;

/// Object-safe bound for a connected duplex stream.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// A connected stream with any TLS upgrade already applied.
pub type BoxedStream = Box<dyn StreamIo>;

/// Fully configured client-side TLS context.
#[derive(Clone)]
pub struct ClientTls {
    pub config: Arc<rustls::ClientConfig>,
    /// Name presented for SNI and certificate validation.
    pub server_name: ServerName<'static>,
}

/// TCP keepalive settings applied to the underlying socket.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub enable: bool,
    /// Interval between keepalive probes.
    pub interval: Duration,
    /// Idle time before the first probe.
    pub time: Duration,
    /// Probes sent before the connection is considered dead.
    pub retry_count: u32,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            enable: false,
            interval: Duration::from_secs(5),
            time: Duration::from_secs(5),
            retry_count: 5,
        }
    }
}

/// Complete the client side of a connection, performing the TLS
/// handshake when a context is configured.
pub async fn connect_stream(tcp: TcpStream, tls: Option<&ClientTls>) -> Result<BoxedStream> {
    match tls {
        Some(tls) => {
            let connector = TlsConnector::from(tls.config.clone());
            let stream = connector.connect(tls.server_name.clone(), tcp).await?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(tcp)),
    }
}

/// Complete the server side of an accepted connection, performing the
/// TLS handshake when an acceptor is configured.
pub async fn accept_stream(tcp: TcpStream, tls: Option<&TlsAcceptor>) -> Result<BoxedStream> {
    match tls {
        Some(acceptor) => {
            let stream = acceptor.accept(tcp).await?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(tcp)),
    }
}

/// Apply keepalive settings to a connected socket.
pub fn apply_keepalive(tcp: &TcpStream, settings: &KeepAlive) -> std::io::Result<()> {
    if !settings.enable {
        return Ok(());
    }
    let mut keepalive = socket2::TcpKeepalive::new();
    if !settings.time.is_zero() {
        keepalive = keepalive.with_time(settings.time);
    }
    if !settings.interval.is_zero() {
        keepalive = keepalive.with_interval(settings.interval);
    }
    #[cfg(not(windows))]
    {
        keepalive = keepalive.with_retries(settings.retry_count);
    }
    socket2::SockRef::from(tcp).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_defaults_are_disabled() {
        let settings = KeepAlive::default();
        assert!(!settings.enable);
        assert_eq!(settings.interval, Duration::from_secs(5));
        assert_eq!(settings.time, Duration::from_secs(5));
        assert_eq!(settings.retry_count, 5);
    }

    #[tokio::test]
    async fn apply_keepalive_on_live_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();

        let mut settings = KeepAlive::default();
        settings.enable = true;
        apply_keepalive(&client, &settings).unwrap();
    }
}
