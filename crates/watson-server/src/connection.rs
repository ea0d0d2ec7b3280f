//! Per-connection state and the connection handler task.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use watson_common::protocol::codec;
use watson_common::transport::{self, BoxedStream};
use watson_common::{Error, Message, Result, Status};

use crate::server::Server;

pub(crate) type Reader = BufReader<ReadHalf<BoxedStream>>;

/// One admitted connection: the write half behind its mutex, the idle
/// clock, and a close signal observed by the read loop.
pub(crate) struct Connection {
    pub(crate) writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    last_active: parking_lot::Mutex<Instant>,
    closed: watch::Sender<bool>,
}

impl Connection {
    fn new(writer: WriteHalf<BoxedStream>) -> (Self, watch::Receiver<bool>) {
        let (closed, closed_rx) = watch::channel(false);
        let conn = Self {
            writer: tokio::sync::Mutex::new(writer),
            last_active: parking_lot::Mutex::new(Instant::now()),
            closed,
        };
        (conn, closed_rx)
    }

    pub(crate) fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Signal the read loop and shut the write half down. Safe to call
    /// more than once.
    pub(crate) async fn close(&self) {
        let _ = self.closed.send(true);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Write a header-only control frame under the write mutex.
    async fn write_control(&self, status: Status) -> Result<()> {
        let mut msg = Message::with_status(status);
        msg.timestamp_utc = Utc::now();
        let header = codec::encode_header(&msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&header).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Drive one accepted connection from TLS upgrade to teardown.
///
/// The accept loop has already counted this connection toward the cap;
/// the count is released here on every exit path.
pub(crate) async fn handle_connection(
    server: Server,
    tcp: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let inner = server.inner();
    let id = peer.to_string();

    let stream = match transport::accept_stream(tcp, inner.tls.as_ref()).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(peer = %id, error = %err, "TLS accept failed");
            inner.conn_count.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let (conn, mut closed) = Connection::new(write_half);
    let conn = std::sync::Arc::new(conn);
    inner.conns.insert(id.clone(), conn.clone());
    debug!(client = %id, "connection admitted");

    {
        let handler = inner.handler.clone();
        let id = id.clone();
        tokio::spawn(async move { handler.on_connect(&id).await });
    }

    let result = drive(&server, &id, &conn, &mut reader, &mut shutdown, &mut closed).await;
    if let Err(err) = &result {
        debug!(client = %id, error = %err, "connection closed");
    }

    conn.close().await;
    inner.conns.remove(&id);
    inner.conn_count.fetch_sub(1, Ordering::Relaxed);
    if !server.stopping() {
        inner.handler.on_disconnect(&id).await;
    }
}

/// Mirror-side handshake followed by the read loop.
async fn drive(
    server: &Server,
    id: &str,
    conn: &Connection,
    reader: &mut Reader,
    shutdown: &mut watch::Receiver<bool>,
    closed: &mut watch::Receiver<bool>,
) -> Result<()> {
    let inner = server.inner();

    if let Some(key) = &inner.options.preshared_key {
        let (msg, _) = codec::read_frame(reader).await?;
        let presented = msg.preshared_key.as_deref().unwrap_or_default();
        if msg.status != Status::AuthRequested || presented != key.as_bytes() {
            warn!(client = %id, "authentication failed");
            let _ = conn.write_control(Status::AuthFailure).await;
            return Err(Error::AuthFailed);
        }
        conn.write_control(Status::AuthSuccess).await?;
    }
    conn.write_control(Status::RegisterClient).await?;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = closed.changed() => return Ok(()),
            result = read_one(server, id, conn, reader) => result?,
        }
    }
}

/// Parse one frame and dispatch it to the handler.
async fn read_one(server: &Server, id: &str, conn: &Connection, reader: &mut Reader) -> Result<()> {
    let inner = server.inner();
    let msg = codec::read_header(reader).await?;
    if inner.options.debug_messages {
        debug!(client = %id, status = %msg.status, len = msg.content_length, "received header");
    }
    let len = msg.content_length;

    if inner.handler.streaming() && !msg.sync_response {
        inner.stats.increment_received_messages();
        inner.stats.add_received_bytes(len);
        conn.touch();
        let mut body = (&mut *reader).take(len as u64);
        inner.handler.on_stream(id, msg, &mut body).await;
        let leftover = body.limit();
        if leftover > 0 {
            codec::drain(&mut body, leftover).await?;
        }
        return Ok(());
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    inner.stats.increment_received_messages();
    inner.stats.add_received_bytes(payload.len() as i64);
    conn.touch();
    // Awaited inline: a slow handler back-pressures this sender.
    inner.handler.on_message(id, msg, payload).await;
    Ok(())
}
