//! # watson-common
//!
//! Shared components for the Watson framed-message transport.
//!
//! This crate contains:
//! - Wire protocol definitions and the header codec
//! - Transport plumbing (plain TCP or TLS streams, keepalive)
//! - Transfer statistics counters
//! - Shared error definitions
//!
//! The wire dialect matches WatsonTcp: a UTF-8 JSON header terminated by
//! `\r\n\r\n`, immediately followed by the declared number of payload
//! bytes. Endpoints built on this crate interoperate with existing
//! WatsonTcp peers.

pub mod error;
pub mod protocol;
pub mod stats;
pub mod transport;

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use protocol::{Message, Status};
pub use stats::Statistics;
pub use transport::{BoxedStream, ClientTls, KeepAlive};
