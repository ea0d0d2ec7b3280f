//! Client configuration.

use std::time::Duration;

use watson_common::transport::KeepAlive;

/// Tunables for a client endpoint. `Default` matches the behavior of
/// the original WatsonTcp client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on the dial, the TLS handshake, and each handshake frame
    /// read.
    pub connect_timeout: Duration,

    /// Close the connection when nothing has been received for this
    /// long. Zero disables the idle monitor.
    pub idle_timeout: Duration,

    /// How often the idle monitor re-evaluates.
    pub evaluation_interval: Duration,

    /// TCP keepalive behavior for the dialed socket.
    pub keep_alive: KeepAlive,

    /// Key the server expects during the handshake.
    pub preshared_key: Option<String>,

    /// Emit per-frame debug logs.
    pub debug_messages: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::ZERO,
            evaluation_interval: Duration::from_secs(1),
            keep_alive: KeepAlive::default(),
            preshared_key: None,
            debug_messages: false,
        }
    }
}
