//! Server configuration.

use std::time::Duration;

use watson_common::transport::KeepAlive;

/// Tunables for a server endpoint. `Default` matches the behavior of
/// the original WatsonTcp server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Evict a connection when nothing has been received from it for
    /// this long. Zero disables the sweep.
    pub idle_timeout: Duration,

    /// How often idle connections are evaluated.
    pub check_interval: Duration,

    /// TCP keepalive behavior for accepted sockets.
    pub keep_alive: KeepAlive,

    /// Key clients must present during the handshake.
    pub preshared_key: Option<String>,

    /// Maximum concurrent connections. Zero means unlimited.
    pub max_connections: usize,

    /// IP addresses or CIDR ranges allowed to connect. When empty, all
    /// clients are permitted unless present in `blocked_ips`.
    pub permitted_ips: Vec<String>,

    /// IP addresses or CIDR ranges rejected at accept time.
    pub blocked_ips: Vec<String>,

    /// Emit per-frame debug logs.
    pub debug_messages: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(5),
            keep_alive: KeepAlive::default(),
            preshared_key: None,
            max_connections: 0,
            permitted_ips: Vec::new(),
            blocked_ips: Vec::new(),
            debug_messages: false,
        }
    }
}
