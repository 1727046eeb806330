//! Chat transport abstraction.
//!
//! The relay core never talks to Matrix directly. Everything it needs from the
//! chat side goes through the [`ChatTransport`] trait:
//!
//! ```text
//! ChatTransport (trait)
//!     │
//!     ├── MatrixTransport (matrix.rs)
//!     │   ├── MatrixClient  - Client-Server HTTP API (client.rs)
//!     │   └── CryptoEngine  - vodozemac Olm/Megolm (crate::crypto)
//!     │
//!     └── test doubles (tests/)
//! ```
//!
//! Message rendering (markdown -> `m.room.message` content) lives in
//! [`render`] so plaintext and encrypted sends produce the same event body.

pub mod client;
pub mod matrix;
pub mod render;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use client::MatrixClient;
pub use matrix::MatrixTransport;
pub use render::render_markdown;

/// Matrix room identifier (`!opaque:server`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Matrix user identifier (`@localpart:server`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reference to uploaded media, as returned by the media store (an `mxc://` URI).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MediaReference(pub String);

impl std::fmt::Display for MediaReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content of an `m.room.message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Always `m.text` for relayed notifications.
    pub msgtype: String,
    /// Plain-text body (the original markdown).
    pub body: String,
    /// `org.matrix.custom.html` when `formatted_body` is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Rendered HTML.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
}

/// Content of an `m.room.encrypted` event produced by Megolm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Encryption algorithm (`m.megolm.v1.aes-sha2`).
    pub algorithm: String,
    /// Sender's Curve25519 identity key (base64).
    pub sender_key: String,
    /// Megolm ciphertext (base64).
    pub ciphertext: String,
    /// Outbound group session the ciphertext belongs to.
    pub session_id: String,
    /// Sending device.
    pub device_id: String,
}

/// Errors returned by transport operations other than encryption.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request never produced a response (DNS, TLS, timeout, ...).
    #[error("request failed: {0}")]
    Request(String),
    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, usually a Matrix `{errcode, error}` object.
        body: String,
    },
    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// Local crypto bookkeeping failed while preparing the request.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

/// Errors returned by [`ChatTransport::encrypt_for_room`].
///
/// The first three variants mean the room's outbound group session cannot be
/// used and a fresh one has to be shared before encrypting again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncryptError {
    /// The session reached its message or age limit.
    #[error("outbound group session expired")]
    SessionExpired,
    /// The session exists but was never distributed to the room members.
    #[error("outbound group session has not been shared")]
    SessionNotShared,
    /// No outbound group session exists for the room.
    #[error("no outbound group session for room")]
    NoGroupSession,
    /// Any other failure.
    #[error("encryption failed: {0}")]
    Other(String),
}

impl EncryptError {
    /// Whether rotating the group session can fix this error.
    pub fn requires_rotation(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired | Self::SessionNotShared | Self::NoGroupSession
        )
    }
}

/// Everything the relay needs from the chat side.
///
/// Implementations must be safe to call repeatedly in immediate succession.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send an unencrypted `m.room.message`.
    async fn send_plain(&self, room: &RoomId, content: &MessageContent)
        -> Result<(), TransportError>;

    /// Encrypt a message with the room's current outbound group session.
    async fn encrypt_for_room(
        &self,
        room: &RoomId,
        content: &MessageContent,
    ) -> Result<EncryptedEnvelope, EncryptError>;

    /// Create a fresh outbound group session and share it with `members`.
    async fn share_group_session(
        &self,
        room: &RoomId,
        members: &[UserId],
    ) -> Result<(), TransportError>;

    /// Send an `m.room.encrypted` event.
    async fn send_encrypted(
        &self,
        room: &RoomId,
        envelope: &EncryptedEnvelope,
    ) -> Result<(), TransportError>;

    /// Current joined members of the room.
    async fn list_room_members(&self, room: &RoomId) -> Result<Vec<UserId>, TransportError>;

    /// Upload media to the transport's media store.
    async fn upload_media(
        &self,
        data: Bytes,
        content_type: &str,
        content_length: u64,
    ) -> Result<MediaReference, TransportError>;
}
