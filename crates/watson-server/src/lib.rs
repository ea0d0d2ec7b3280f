//! # watson-server
//!
//! Server endpoint for the Watson framed-message transport.
//!
//! A [`Server`] listens for TCP connections (optionally upgrading each
//! to TLS), applies admission control (IP allow/deny lists and a
//! connection cap), performs the mirror side of the preshared-key
//! handshake, and runs one read loop per connection that routes frames
//! to the application's [`ServerHandler`]. Idle connections are swept
//! on a configurable interval.
//!
//! Connections are keyed by their remote address string; replies go
//! back through [`Server::send`] or [`Server::send_stream`] with that
//! id.

mod admission;
mod connection;
mod handler;
mod options;
mod server;

pub use handler::ServerHandler;
pub use options::ServerOptions;
pub use server::Server;

// Re-export the pieces applications need to configure and drive a server.
pub use watson_common::transport::KeepAlive;
pub use watson_common::{Error, Message, Result, Statistics, Status};
