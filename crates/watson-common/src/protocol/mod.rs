//! Wire protocol for the Watson framed-message dialect.
//!
//! ## Frame format
//!
//! ```text
//! +---------------------+----------+------------------------+
//! | UTF-8 JSON header   | \r\n\r\n | payload (`len` bytes)  |
//! +---------------------+----------+------------------------+
//! ```
//!
//! The header is a single JSON object terminated by the literal
//! four-byte sequence CR LF CR LF; the payload of the declared length
//! follows with no intervening bytes. JSON string escaping guarantees
//! the terminator cannot occur inside the header itself. Receivers
//! ignore unknown header fields so additive changes stay compatible.

pub mod codec;
pub mod message;

pub use codec::{encode_header, read_frame, read_header, write_frame};
pub use message::{Message, Status};

/// Four-byte sequence separating the header from the payload.
pub const TERMINATOR: [u8; 4] = *b"\r\n\r\n";

/// Upper bound on header size (64 KiB). The dialect mandates no cap, but
/// an unbounded header would let a hostile peer grow the scan buffer
/// without limit.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;
