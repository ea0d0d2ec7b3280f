//! Client endpoint: dial, handshake, read loop, and the send surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::debug;

use watson_common::protocol::codec;
use watson_common::transport::{self, BoxedStream, ClientTls};
use watson_common::{Error, Message, Result, Statistics, Status};

use crate::handler::ClientHandler;
use crate::options::ClientOptions;

type Reader = BufReader<ReadHalf<BoxedStream>>;
type Writer = Arc<tokio::sync::Mutex<WriteHalf<BoxedStream>>>;
type SyncSlot = oneshot::Sender<(Message, Vec<u8>)>;

/// Client endpoint for the framed transport.
///
/// Cheaply cloneable; all clones share one connection. A client can be
/// reconnected after a disconnect.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    addr: String,
    tls: Option<ClientTls>,
    options: ClientOptions,
    handler: Arc<dyn ClientHandler>,
    stats: Arc<Statistics>,
    /// Present while a connection is live.
    active: Mutex<Option<Active>>,
    /// Sync-request waiters keyed by conversation GUID.
    pending: DashMap<String, SyncSlot>,
    last_received: Mutex<Instant>,
}

struct Active {
    writer: Writer,
    shutdown: watch::Sender<bool>,
}

impl Client {
    pub fn new(
        addr: impl Into<String>,
        tls: Option<ClientTls>,
        handler: Arc<dyn ClientHandler>,
        options: ClientOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                addr: addr.into(),
                tls,
                options,
                handler,
                stats: Arc::new(Statistics::new()),
                active: Mutex::new(None),
                pending: DashMap::new(),
                last_received: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Runtime counters for this client.
    pub fn statistics(&self) -> Arc<Statistics> {
        self.inner.stats.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// Dial the server, run the handshake, and start the background
    /// loops.
    ///
    /// With a preshared key configured, the handshake sends an
    /// `AuthRequested` frame and requires an `AuthSuccess` reply before
    /// proceeding. Every connection then waits for the server's
    /// `RegisterClient` frame. All handshake reads observe the connect
    /// timeout.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.active.lock().is_some() {
            return Err(Error::AlreadyConnected);
        }
        let deadline = inner.options.connect_timeout;

        let tcp = timeout(deadline, TcpStream::connect(&inner.addr))
            .await
            .map_err(|_| timed_out())??;
        transport::apply_keepalive(&tcp, &inner.options.keep_alive)?;
        let stream = timeout(deadline, transport::connect_stream(tcp, inner.tls.as_ref()))
            .await
            .map_err(|_| timed_out())??;

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        if let Some(key) = &inner.options.preshared_key {
            let mut auth = Message::with_status(Status::AuthRequested);
            auth.preshared_key = Some(key.clone().into_bytes());
            self.write_message(&mut write_half, auth, &[]).await?;

            let (reply, _) = timeout(deadline, codec::read_frame(&mut reader))
                .await
                .map_err(|_| timed_out())??;
            if reply.status != Status::AuthSuccess {
                return Err(Error::AuthFailed);
            }
        }

        // The registration payload, if any, was consumed with the frame.
        let (registration, _) = timeout(deadline, codec::read_frame(&mut reader))
            .await
            .map_err(|_| timed_out())??;
        if registration.status != Status::RegisterClient {
            return Err(Error::RegistrationFailed);
        }

        *inner.last_received.lock() = Instant::now();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *inner.active.lock() = Some(Active {
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            shutdown: shutdown_tx,
        });
        debug!(addr = %inner.addr, "client connected");

        let handler = inner.handler.clone();
        tokio::spawn(async move { handler.on_connect().await });

        let client = self.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { client.read_loop(reader, rx).await });

        if inner.options.idle_timeout > Duration::ZERO {
            let client = self.clone();
            tokio::spawn(async move { client.idle_monitor(shutdown_rx).await });
        }
        Ok(())
    }

    /// Tear down the connection. Idempotent; `on_disconnect` fires at
    /// most once per connection.
    pub async fn disconnect(&self) {
        let active = self.inner.active.lock().take();
        let Some(active) = active else { return };
        let _ = active.shutdown.send(true);
        {
            let mut writer = active.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        // Wake pending sync waiters; a dropped slot surfaces `Cancelled`.
        self.inner.pending.clear();
        debug!(addr = %self.inner.addr, "client disconnected");
        self.inner.handler.on_disconnect().await;
    }

    /// Send one message with a buffered payload.
    ///
    /// The connection's write mutex keeps the header and payload of
    /// competing senders from interleaving.
    pub async fn send(&self, msg: Message, data: &[u8]) -> Result<()> {
        let writer = self.writer()?;
        let mut writer = writer.lock().await;
        self.write_message(&mut *writer, msg, data).await
    }

    /// Send one message, copying exactly `length` payload bytes from
    /// `reader`.
    ///
    /// The write mutex is held across the whole copy, so a slow reader
    /// back-pressures other senders on this connection. A reader that
    /// ends early leaves the stream desynchronized; the connection is
    /// closed and the call fails with `StreamTruncated`.
    pub async fn send_stream<R>(&self, mut msg: Message, reader: &mut R, length: i64) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let writer = self.writer()?;
        msg.content_length = length;
        msg.timestamp_utc = Utc::now();
        if self.inner.options.debug_messages {
            debug!(status = %msg.status, len = length, "sending stream message");
        }
        let header = codec::encode_header(&msg)?;
        let result = async {
            let mut writer = writer.lock().await;
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
                self.disconnect().await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Send a request and await its correlated response.
    ///
    /// Generates a fresh conversation GUID when the message carries
    /// none. Expiry of `deadline`, or endpoint shutdown while waiting,
    /// fails with `Cancelled` without disturbing the connection.
    pub async fn send_sync(
        &self,
        mut msg: Message,
        data: &[u8],
        deadline: Duration,
    ) -> Result<(Message, Vec<u8>)> {
        if msg.conversation_guid.is_empty() {
            msg.conversation_guid = new_guid();
        }
        msg.sync_request = true;
        msg.sync_response = false;
        let guid = msg.conversation_guid.clone();

        let (slot, response) = oneshot::channel();
        self.inner.pending.insert(guid.clone(), slot);

        if let Err(err) = self.send(msg, data).await {
            self.inner.pending.remove(&guid);
            return Err(err);
        }

        match timeout(deadline, response).await {
            Ok(Ok(reply)) => Ok(reply),
            // Slot dropped: the endpoint shut down underneath us.
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.inner.pending.remove(&guid);
                Err(Error::Cancelled)
            }
        }
    }

    fn writer(&self) -> Result<Writer> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.writer.clone())
            .ok_or(Error::NotConnected)
    }

    async fn write_message<W>(&self, writer: &mut W, mut msg: Message, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        msg.content_length = data.len() as i64;
        msg.timestamp_utc = Utc::now();
        if self.inner.options.debug_messages {
            debug!(status = %msg.status, len = msg.content_length, "sending message");
        }
        let written = codec::write_frame(writer, &msg, data).await?;
        self.inner.stats.increment_sent_messages();
        self.inner.stats.add_sent_bytes(written as i64);
        Ok(())
    }

    async fn read_loop(&self, mut reader: Reader, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.read_one(&mut reader) => {
                    if let Err(err) = result {
                        if !matches!(err, Error::PeerDisconnected) {
                            debug!(error = %err, "read loop terminated");
                        }
                        break;
                    }
                }
            }
        }
        self.disconnect().await;
    }

    async fn read_one(&self, reader: &mut Reader) -> Result<()> {
        let msg = codec::read_header(reader).await?;
        if self.inner.options.debug_messages {
            debug!(status = %msg.status, len = msg.content_length, "received header");
        }
        let len = msg.content_length;

        if self.inner.handler.streaming() && !msg.sync_response {
            self.inner.stats.increment_received_messages();
            self.inner.stats.add_received_bytes(len);
            let mut body = (&mut *reader).take(len as u64);
            self.inner.handler.on_stream(msg, &mut body).await;
            let leftover = body.limit();
            if leftover > 0 {
                codec::drain(&mut body, leftover).await?;
            }
            *self.inner.last_received.lock() = Instant::now();
            return Ok(());
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        self.inner.stats.increment_received_messages();
        self.inner.stats.add_received_bytes(payload.len() as i64);
        *self.inner.last_received.lock() = Instant::now();

        if msg.sync_response && !msg.conversation_guid.is_empty() {
            // The read loop alone fills slots, and removes the entry
            // first, so a response can never be delivered twice.
            if let Some((_, slot)) = self.inner.pending.remove(&msg.conversation_guid) {
                let _ = slot.send((msg, payload));
                return Ok(());
            }
        }

        let handler = self.inner.handler.clone();
        tokio::spawn(async move { handler.on_message(msg, payload).await });
        Ok(())
    }

    async fn idle_monitor(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.options.evaluation_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let last = *self.inner.last_received.lock();
                    if last.elapsed() > self.inner.options.idle_timeout {
                        debug!(addr = %self.inner.addr, "idle timeout reached");
                        self.disconnect().await;
                        return;
                    }
                }
            }
        }
    }
}

fn timed_out() -> Error {
    Error::Io(std::io::ErrorKind::TimedOut.into())
}

/// 128 random bits as 32 lowercase hex characters. The id is an opaque
/// correlation token, so the timestamp fallback on RNG failure is not a
/// security concern.
fn new_guid() -> String {
    let mut bytes = [0u8; 16];
    match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(_) => format!(
            "{:032x}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ),
    }
}
