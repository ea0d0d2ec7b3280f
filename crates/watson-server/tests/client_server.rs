//! End-to-end tests driving clients against a server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use watson_client::{Client, ClientHandler, ClientOptions, ClientTls};
use watson_common::{Error, Message};
use watson_server::{Server, ServerHandler, ServerOptions};

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn start_server(
    handler: Arc<dyn ServerHandler>,
    tls: Option<TlsAcceptor>,
    options: ServerOptions,
) -> (Server, String) {
    let server = Server::new("127.0.0.1:0", tls, handler, options);
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (server, addr)
}

struct SilentClient;

#[async_trait]
impl ClientHandler for SilentClient {}

struct SilentServer;

#[async_trait]
impl ServerHandler for SilentServer {}

/// Records every buffered message the server receives.
struct Recording {
    messages: mpsc::UnboundedSender<(String, Message, Vec<u8>)>,
}

#[async_trait]
impl ServerHandler for Recording {
    async fn on_message(&self, id: &str, msg: Message, data: Vec<u8>) {
        let _ = self.messages.send((id.to_string(), msg, data));
    }
}

struct ClientDisconnectProbe {
    disconnected: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl ClientHandler for ClientDisconnectProbe {
    async fn on_disconnect(&self) {
        let _ = self.disconnected.send(());
    }
}

struct ServerLifecycleProbe {
    connected: mpsc::UnboundedSender<String>,
    disconnected: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl ServerHandler for ServerLifecycleProbe {
    async fn on_connect(&self, id: &str) {
        let _ = self.connected.send(id.to_string());
    }

    async fn on_disconnect(&self, id: &str) {
        let _ = self.disconnected.send(id.to_string());
    }
}

/// Answers sync requests with a correlated "pong".
struct SyncReplier {
    server: OnceLock<Server>,
}

#[async_trait]
impl ServerHandler for SyncReplier {
    async fn on_message(&self, id: &str, msg: Message, _data: Vec<u8>) {
        if msg.sync_request {
            let mut reply = Message::default();
            reply.sync_response = true;
            reply.conversation_guid = msg.conversation_guid.clone();
            let server = self.server.get().expect("server installed");
            server.send(id, reply, b"pong").await.expect("send reply");
        }
    }
}

/// Streaming server handler that reads only the first three bytes of
/// each payload, leaving the rest for the read loop to discard.
struct PartialStream {
    frames: mpsc::UnboundedSender<(i64, Vec<u8>)>,
}

#[async_trait]
impl ServerHandler for PartialStream {
    fn streaming(&self) -> bool {
        true
    }

    async fn on_stream(&self, _id: &str, msg: Message, body: &mut (dyn AsyncRead + Send + Unpin)) {
        let mut head = [0u8; 3];
        body.read_exact(&mut head).await.expect("read head");
        let _ = self.frames.send((msg.content_length, head.to_vec()));
    }
}

/// Streaming client handler that consumes each payload in full.
struct StreamCollector {
    frames: mpsc::UnboundedSender<(i64, Vec<u8>)>,
}

#[async_trait]
impl ClientHandler for StreamCollector {
    fn streaming(&self) -> bool {
        true
    }

    async fn on_stream(&self, msg: Message, body: &mut (dyn AsyncRead + Send + Unpin)) {
        let mut data = Vec::new();
        body.read_to_end(&mut data).await.expect("read body");
        let _ = self.frames.send((msg.content_length, data));
    }
}

#[tokio::test]
async fn client_sends_message_to_server() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (server, addr) = start_server(
        Arc::new(Recording { messages: tx }),
        None,
        ServerOptions::default(),
    )
    .await;

    let client = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    client.connect().await.unwrap();
    client.send(Message::default(), b"hi").await.unwrap();

    let (_, msg, data) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(data, b"hi");
    assert_eq!(msg.content_length, 2);
    assert!(client.statistics().sent_messages() >= 1);
    assert!(server.statistics().received_messages() >= 1);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn tls_connection_round_trip() {
    init_tracing();
    let (acceptor, client_tls) = tls_contexts();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (server, addr) = start_server(
        Arc::new(Recording { messages: tx }),
        Some(acceptor),
        ServerOptions::default(),
    )
    .await;

    let client = Client::new(
        &addr,
        Some(client_tls),
        Arc::new(SilentClient),
        ClientOptions::default(),
    );
    client.connect().await.unwrap();
    client.send(Message::default(), b"over tls").await.unwrap();

    let (_, _, data) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(data, b"over tls");

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn sync_request_round_trip() {
    init_tracing();
    let handler = Arc::new(SyncReplier {
        server: OnceLock::new(),
    });
    let (server, addr) =
        start_server(handler.clone(), None, ServerOptions::default()).await;
    handler.server.set(server.clone()).ok().unwrap();

    let client = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    client.connect().await.unwrap();

    let (reply, data) = client
        .send_sync(Message::default(), b"ping", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(data, b"pong");
    assert!(reply.sync_response);
    assert!(!reply.conversation_guid.is_empty());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn sync_request_without_responder_is_cancelled() {
    init_tracing();
    let (server, addr) =
        start_server(Arc::new(SilentServer), None, ServerOptions::default()).await;

    let client = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    client.connect().await.unwrap();

    let err = client
        .send_sync(Message::default(), b"ping", Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn client_disconnects_when_idle() {
    init_tracing();
    let (server, addr) =
        start_server(Arc::new(SilentServer), None, ServerOptions::default()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut options = ClientOptions::default();
    options.idle_timeout = Duration::from_millis(200);
    options.evaluation_interval = Duration::from_millis(50);
    let client = Client::new(
        &addr,
        None,
        Arc::new(ClientDisconnectProbe { disconnected: tx }),
        options,
    );
    client.connect().await.unwrap();

    timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(!client.is_connected());

    server.stop().await;
}

#[tokio::test]
async fn server_evicts_idle_client() {
    init_tracing();
    let (connected_tx, _connected_rx) = mpsc::unbounded_channel();
    let (disconnected_tx, mut disconnected_rx) = mpsc::unbounded_channel();
    let mut options = ServerOptions::default();
    options.idle_timeout = Duration::from_millis(200);
    options.check_interval = Duration::from_millis(50);
    let (server, addr) = start_server(
        Arc::new(ServerLifecycleProbe {
            connected: connected_tx,
            disconnected: disconnected_tx,
        }),
        None,
        options,
    )
    .await;

    let client = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    client.connect().await.unwrap();

    timeout(WAIT, disconnected_rx.recv()).await.unwrap().unwrap();

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn preshared_key_success() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut server_options = ServerOptions::default();
    server_options.preshared_key = Some("secret".to_string());
    let (server, addr) =
        start_server(Arc::new(Recording { messages: tx }), None, server_options).await;

    let mut client_options = ClientOptions::default();
    client_options.preshared_key = Some("secret".to_string());
    let client = Client::new(&addr, None, Arc::new(SilentClient), client_options);
    client.connect().await.unwrap();
    client.send(Message::default(), b"hi").await.unwrap();

    let (_, _, data) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(data, b"hi");

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn preshared_key_mismatch_fails_connect() {
    init_tracing();
    let mut server_options = ServerOptions::default();
    server_options.preshared_key = Some("secret".to_string());
    let (server, addr) =
        start_server(Arc::new(SilentServer), None, server_options).await;

    let mut client_options = ClientOptions::default();
    client_options.preshared_key = Some("wrong".to_string());
    let client = Client::new(&addr, None, Arc::new(SilentClient), client_options);
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, Error::AuthFailed));

    server.stop().await;
}

#[tokio::test]
async fn connection_cap_rejects_excess_clients() {
    init_tracing();
    let mut options = ServerOptions::default();
    options.max_connections = 1;
    let (server, addr) = start_server(Arc::new(SilentServer), None, options).await;

    let first = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    first.connect().await.unwrap();

    let second = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    match second.connect().await {
        Err(_) => {}
        Ok(()) => {
            // The reset may land after the handshake frames; a send must
            // still fail against the closed socket.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(second.send(Message::default(), b"test").await.is_err());
        }
    }

    first.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn blocked_ip_cannot_connect() {
    init_tracing();
    let mut options = ServerOptions::default();
    options.blocked_ips = vec!["127.0.0.1".to_string()];
    let (server, addr) = start_server(Arc::new(SilentServer), None, options).await;

    let client = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    assert!(client.connect().await.is_err());

    server.stop().await;
}

#[tokio::test]
async fn unknown_client_id_fails_send() {
    init_tracing();
    let (server, _addr) =
        start_server(Arc::new(SilentServer), None, ServerOptions::default()).await;

    let err = server
        .send("203.0.113.1:9", Message::default(), b"x")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownClient(_)));

    server.stop().await;
}

#[tokio::test]
async fn partial_stream_reads_stay_frame_aligned() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (server, addr) = start_server(
        Arc::new(PartialStream { frames: tx }),
        None,
        ServerOptions::default(),
    )
    .await;

    let client = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    client.connect().await.unwrap();
    client.send(Message::default(), b"hello world").await.unwrap();
    client.send(Message::default(), b"second!").await.unwrap();

    let (len, head) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(len, 11);
    assert_eq!(head, b"hel");
    // The discarded tail of the first payload must not shift the second
    // frame's boundary.
    let (len, head) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(len, 7);
    assert_eq!(head, b"sec");

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn server_streams_payload_to_client() {
    init_tracing();
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let (disconnected_tx, _disconnected_rx) = mpsc::unbounded_channel();
    let (server, addr) = start_server(
        Arc::new(ServerLifecycleProbe {
            connected: connected_tx,
            disconnected: disconnected_tx,
        }),
        None,
        ServerOptions::default(),
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Client::new(
        &addr,
        None,
        Arc::new(StreamCollector { frames: tx }),
        ClientOptions::default(),
    );
    client.connect().await.unwrap();

    let id = timeout(WAIT, connected_rx.recv()).await.unwrap().unwrap();
    let payload = vec![0xA5u8; 256 * 1024];
    let mut reader = &payload[..];
    server
        .send_stream(&id, Message::default(), &mut reader, payload.len() as i64)
        .await
        .unwrap();

    let (len, data) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(len as usize, payload.len());
    assert_eq!(data, payload);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn client_streams_large_payload_to_server() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (server, addr) = start_server(
        Arc::new(Recording { messages: tx }),
        None,
        ServerOptions::default(),
    )
    .await;

    let client = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    client.connect().await.unwrap();

    let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
    let mut reader = &payload[..];
    client
        .send_stream(Message::default(), &mut reader, payload.len() as i64)
        .await
        .unwrap();

    let (_, msg, data) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg.content_length as usize, payload.len());
    assert_eq!(data, payload);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn lifecycle_misuse_is_reported() {
    init_tracing();
    let (server, addr) =
        start_server(Arc::new(SilentServer), None, ServerOptions::default()).await;
    assert!(matches!(
        server.start().await.unwrap_err(),
        Error::AlreadyStarted
    ));

    let client = Client::new(&addr, None, Arc::new(SilentClient), ClientOptions::default());
    client.connect().await.unwrap();
    assert!(matches!(
        client.connect().await.unwrap_err(),
        Error::AlreadyConnected
    ));

    client.disconnect().await;
    server.stop().await;
}

fn tls_contexts() -> (TlsAcceptor, ClientTls) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .unwrap();

    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();

    let client_tls = ClientTls {
        config: Arc::new(client_config),
        server_name: ServerName::try_from("localhost".to_string()).unwrap(),
    };
    (TlsAcceptor::from(Arc::new(server_config)), client_tls)
}

/// Certificate verifier that accepts any certificate. Test-only; it
/// plays the role of the original suite's `InsecureSkipVerify`.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
