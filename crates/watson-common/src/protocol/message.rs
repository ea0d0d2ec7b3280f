//! Protocol message definitions
//!
//! The header that precedes every payload on the wire.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Delivery status carried in every frame header.
///
/// Serializes as the bare variant name (`"Normal"`, `"AuthSuccess"`, …)
/// for compatibility with existing WatsonTcp peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Normal,
    Success,
    Failure,
    AuthRequired,
    AuthRequested,
    AuthSuccess,
    AuthFailure,
    Removed,
    Shutdown,
    Heartbeat,
    Timeout,
    RegisterClient,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Normal => "Normal",
            Status::Success => "Success",
            Status::Failure => "Failure",
            Status::AuthRequired => "AuthRequired",
            Status::AuthRequested => "AuthRequested",
            Status::AuthSuccess => "AuthSuccess",
            Status::AuthFailure => "AuthFailure",
            Status::Removed => "Removed",
            Status::Shutdown => "Shutdown",
            Status::Heartbeat => "Heartbeat",
            Status::Timeout => "Timeout",
            Status::RegisterClient => "RegisterClient",
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "Success" => Status::Success,
            "Failure" => Status::Failure,
            "AuthRequired" => Status::AuthRequired,
            "AuthRequested" => Status::AuthRequested,
            "AuthSuccess" => Status::AuthSuccess,
            "AuthFailure" => Status::AuthFailure,
            "Removed" => Status::Removed,
            "Shutdown" => Status::Shutdown,
            "Heartbeat" => Status::Heartbeat,
            "Timeout" => Status::Timeout,
            "RegisterClient" => Status::RegisterClient,
            // Unknown names (and the empty string some peers emit for an
            // unset status) fall back to Normal rather than rejecting the
            // frame.
            _ => Status::Normal,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Normal
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Status::from_name(&name))
    }
}

/// One framed application message: this header plus `content_length`
/// opaque payload bytes.
///
/// Optional fields are omitted from the wire when absent. Field renames
/// pin the wire names used by the WatsonTcp dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Byte length of the payload following the header. Never negative.
    #[serde(rename = "len", default)]
    pub content_length: i64,

    /// Preshared key bytes, present only on `AuthRequested` frames.
    /// Base64 on the wire.
    #[serde(
        rename = "psk",
        default,
        with = "psk_base64",
        skip_serializing_if = "Option::is_none"
    )]
    pub preshared_key: Option<Vec<u8>>,

    #[serde(rename = "status", default)]
    pub status: Status,

    /// Application metadata attached to the frame.
    #[serde(rename = "md", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,

    /// The sender awaits a correlated response to this frame.
    #[serde(rename = "syncreq", default)]
    pub sync_request: bool,

    /// This frame answers a prior sync request. Never set together with
    /// `sync_request`.
    #[serde(rename = "syncresp", default)]
    pub sync_response: bool,

    /// Stamped by the sender immediately before the frame is written.
    #[serde(rename = "ts", default = "epoch")]
    pub timestamp_utc: DateTime<Utc>,

    /// Advisory expiration instant.
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    pub expiration_utc: Option<DateTime<Utc>>,

    /// Correlation token tying a sync request to its response. Empty
    /// unless the frame is correlated.
    #[serde(rename = "convguid", default)]
    pub conversation_guid: String,

    /// Peer-local identity; never serialized.
    #[serde(skip)]
    pub sender_guid: String,
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Default for Message {
    fn default() -> Self {
        Self {
            content_length: 0,
            preshared_key: None,
            status: Status::Normal,
            metadata: None,
            sync_request: false,
            sync_response: false,
            timestamp_utc: epoch(),
            expiration_utc: None,
            conversation_guid: String::new(),
            sender_guid: String::new(),
        }
    }
}

impl Message {
    /// A default message carrying the given status.
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// The Go and C# implementations marshal the key bytes as a base64
/// string; mirror that so handshakes interoperate.
mod psk_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
