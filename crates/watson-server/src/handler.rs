//! Application callbacks for server-side connection events.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use watson_common::Message;

/// Receives connection lifecycle and message events, tagged with the
/// connection id (the peer's remote address string).
///
/// Every method defaults to a no-op. Unlike the client side,
/// `on_message` is awaited on the connection's read loop, so a slow
/// handler back-pressures that sender.
///
/// When `streaming` returns true, payloads of regular frames are handed
/// to `on_stream` as a bounded reader instead of being buffered for
/// `on_message`; sync responses are always buffered.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    async fn on_connect(&self, id: &str) {
        let _ = id;
    }

    async fn on_disconnect(&self, id: &str) {
        let _ = id;
    }

    /// Called with the full payload of a buffered frame.
    async fn on_message(&self, id: &str, msg: Message, data: Vec<u8>) {
        let _ = (id, msg, data);
    }

    /// Called with a reader yielding exactly `msg.content_length` bytes.
    /// Bytes left unread when the callback returns are discarded to
    /// restore frame alignment.
    async fn on_stream(&self, id: &str, msg: Message, body: &mut (dyn AsyncRead + Send + Unpin)) {
        let _ = (id, msg, body);
    }

    /// Route regular payloads to `on_stream` instead of `on_message`.
    fn streaming(&self) -> bool {
        false
    }
}
