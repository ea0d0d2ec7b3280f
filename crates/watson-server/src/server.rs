//! Accept loop, idle sweep, and the server send surface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use watson_common::protocol::codec;
use watson_common::transport;
use watson_common::{Error, Message, Result, Statistics};

use crate::admission;
use crate::connection::{self, Connection};
use crate::handler::ServerHandler;
use crate::options::ServerOptions;

/// Server endpoint for the framed transport.
///
/// Cheaply cloneable; all clones share the listener and connection
/// table, so a handler can hold one to send replies.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) addr: String,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) options: ServerOptions,
    pub(crate) handler: Arc<dyn ServerHandler>,
    pub(crate) stats: Arc<Statistics>,
    /// Admitted connections keyed by remote address string.
    pub(crate) conns: DashMap<String, Arc<Connection>>,
    /// Live connections, counting those still in the TLS handshake.
    /// Checked against the cap by the accept loop.
    pub(crate) conn_count: AtomicUsize,
    /// Shutdown broadcaster, present while the server runs.
    running: Mutex<Option<watch::Sender<bool>>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(
        addr: impl Into<String>,
        tls: Option<TlsAcceptor>,
        handler: Arc<dyn ServerHandler>,
        options: ServerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                addr: addr.into(),
                tls,
                options,
                handler,
                stats: Arc::new(Statistics::new()),
                conns: DashMap::new(),
                conn_count: AtomicUsize::new(0),
                running: Mutex::new(None),
                bound: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &ServerInner {
        &self.inner
    }

    pub(crate) fn stopping(&self) -> bool {
        self.inner.running.lock().is_none()
    }

    /// Runtime counters for this server.
    pub fn statistics(&self) -> Arc<Statistics> {
        self.inner.stats.clone()
    }

    /// The bound listen address, once started. Useful when binding to
    /// port zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock()
    }

    /// Bind the listener and start the accept loop and idle sweep.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut running = inner.running.lock();
            if running.is_some() {
                return Err(Error::AlreadyStarted);
            }
            *running = Some(shutdown_tx);
        }

        let listener = match TcpListener::bind(&inner.addr).await {
            Ok(listener) => listener,
            Err(err) => {
                *inner.running.lock() = None;
                return Err(err.into());
            }
        };
        let local_addr = listener.local_addr()?;
        *inner.bound.lock() = Some(local_addr);
        info!("server listening on {}", local_addr);

        let server = self.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { server.accept_loop(listener, rx).await });

        let server = self.clone();
        tokio::spawn(async move { server.idle_sweep(shutdown_rx).await });
        Ok(())
    }

    /// Stop listening and close every connection. Idempotent. No
    /// callbacks fire after stop.
    pub async fn stop(&self) {
        let Some(shutdown) = self.inner.running.lock().take() else {
            return;
        };
        let _ = shutdown.send(true);
        let conns: Vec<Arc<Connection>> = self
            .inner
            .conns
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.conns.clear();
        for conn in conns {
            conn.close().await;
        }
        info!("server stopped");
    }

    /// Send one message with a buffered payload to the identified
    /// connection.
    pub async fn send(&self, id: &str, mut msg: Message, data: &[u8]) -> Result<()> {
        let conn = self.connection(id)?;
        msg.content_length = data.len() as i64;
        msg.timestamp_utc = Utc::now();
        if self.inner.options.debug_messages {
            debug!(client = %id, status = %msg.status, len = msg.content_length, "sending message");
        }
        let written = {
            let mut writer = conn.writer.lock().await;
            codec::write_frame(&mut *writer, &msg, data).await?
        };
        self.inner.stats.increment_sent_messages();
        self.inner.stats.add_sent_bytes(written as i64);
        Ok(())
    }

    /// Send one message to the identified connection, copying exactly
    /// `length` payload bytes from `reader`.
    ///
    /// The connection's write mutex is held across the whole copy. A
    /// reader that ends early leaves the stream desynchronized; that
    /// connection is closed and the call fails with `StreamTruncated`.
    pub async fn send_stream<R>(
        &self,
        id: &str,
        mut msg: Message,
        reader: &mut R,
        length: i64,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let conn = self.connection(id)?;
        msg.content_length = length;
        msg.timestamp_utc = Utc::now();
        if self.inner.options.debug_messages {
            debug!(client = %id, status = %msg.status, len = length, "sending stream message");
        }
        let header = codec::encode_header(&msg)?;
        let result = async {
            let mut writer = conn.writer.lock().await;
            writer.write_all(&header).await?;
            codec::copy_payload(&mut *writer, reader, length).await
        }
        .await;
        match result {
            Ok(()) => {
                self.inner.stats.increment_sent_messages();
                self.inner.stats.add_sent_bytes(header.len() as i64 + length);
                Ok(())
            }
            Err(err @ Error::StreamTruncated { .. }) => {
                conn.close().await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn connection(&self, id: &str) -> Result<Arc<Connection>> {
        self.inner
            .conns
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownClient(id.to_string()))
    }

    async fn accept_loop(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let inner = &self.inner;
        loop {
            let (tcp, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("failed to accept connection: {}", err);
                        continue;
                    }
                },
            };

            if !admission::ip_allowed(
                peer.ip(),
                &inner.options.permitted_ips,
                &inner.options.blocked_ips,
            ) {
                debug!(peer = %peer, "rejected by IP filter");
                continue;
            }

            let max = inner.options.max_connections;
            if max > 0 && inner.conn_count.load(Ordering::Relaxed) >= max {
                warn!(peer = %peer, "max connections reached, resetting");
                // Linger 0 turns the close into a reset, keeping the
                // rejected peer out of TIME_WAIT.
                let _ = tcp.set_linger(Some(Duration::ZERO));
                continue;
            }

            if let Err(err) = transport::apply_keepalive(&tcp, &inner.options.keep_alive) {
                debug!(peer = %peer, error = %err, "failed to apply keepalive");
            }

            // Only the accept loop increments, so check-then-add cannot
            // overshoot the cap.
            inner.conn_count.fetch_add(1, Ordering::Relaxed);
            let server = self.clone();
            let rx = shutdown.clone();
            tokio::spawn(async move {
                connection::handle_connection(server, tcp, peer, rx).await;
            });
        }
    }

    async fn idle_sweep(&self, mut shutdown: watch::Receiver<bool>) {
        let idle_timeout = self.inner.options.idle_timeout;
        if idle_timeout.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(self.inner.options.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let stale: Vec<(String, Arc<Connection>)> = self
                        .inner
                        .conns
                        .iter()
                        .filter(|entry| entry.value().idle_for() > idle_timeout)
                        .map(|entry| (entry.key().clone(), entry.value().clone()))
                        .collect();
                    for (id, conn) in stale {
                        debug!(client = %id, "closing idle connection");
                        // The handler's exit path removes the record and
                        // fires on_disconnect.
                        conn.close().await;
                    }
                }
            }
        }
    }
}
