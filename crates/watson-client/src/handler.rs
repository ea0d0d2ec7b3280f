//! Application callbacks for client-side connection events.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use watson_common::Message;

/// Receives connection lifecycle and message events.
///
/// Every method defaults to a no-op; implement the ones the application
/// cares about. `on_message` runs on its own task so a slow handler
/// never stalls the read loop; `on_stream` is awaited inline because it
/// borrows the connection.
///
/// When `streaming` returns true, payloads of regular frames are handed
/// to `on_stream` as a bounded reader instead of being buffered for
/// `on_message`. Sync responses are always buffered so they can be
/// routed to their waiter.
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    async fn on_connect(&self) {}

    async fn on_disconnect(&self) {}

    /// Called with the full payload of a buffered frame.
    async fn on_message(&self, msg: Message, data: Vec<u8>) {
        let _ = (msg, data);
    }

    /// Called with a reader yielding exactly `msg.content_length` bytes.
    /// Bytes left unread when the callback returns are discarded to
    /// restore frame alignment.
    async fn on_stream(&self, msg: Message, body: &mut (dyn AsyncRead + Send + Unpin)) {
        let _ = (msg, body);
    }

    /// Route regular payloads to `on_stream` instead of `on_message`.
    fn streaming(&self) -> bool {
        false
    }
}
