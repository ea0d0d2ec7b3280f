//! # watson-client
//!
//! Client endpoint for the Watson framed-message transport.
//!
//! A [`Client`] dials a server (optionally upgrading to TLS), performs
//! the preshared-key handshake when configured, waits for the server's
//! registration frame, and then runs a background read loop that routes
//! incoming frames to the application's [`ClientHandler`] or to waiting
//! sync requests.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use watson_client::{Client, ClientHandler, ClientOptions};
//! use watson_common::Message;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl ClientHandler for Printer {
//!     async fn on_message(&self, _msg: Message, data: Vec<u8>) {
//!         println!("received {} bytes", data.len());
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> watson_common::Result<()> {
//!     let client = Client::new(
//!         "127.0.0.1:9000",
//!         None,
//!         Arc::new(Printer),
//!         ClientOptions::default(),
//!     );
//!     client.connect().await?;
//!     client.send(Message::default(), b"hello").await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

mod client;
mod handler;
mod options;

pub use client::Client;
pub use handler::ClientHandler;
pub use options::ClientOptions;

// Re-export the pieces applications need to configure and drive a client.
pub use watson_common::transport::{ClientTls, KeepAlive};
pub use watson_common::{Error, Message, Result, Statistics, Status};
