//! Gotify notification messages as they arrive on the `/stream` websocket.
//!
//! ```json
//! {
//!   "id": 42, "appid": 3, "priority": 5,
//!   "title": "Backup finished",
//!   "message": "3 files, 0 errors",
//!   "extras": { "client::display": { "contentType": "text/markdown" } }
//! }
//! ```
//!
//! Only `title`, `message` and the display content type matter to the relay;
//! everything else is kept for logging.

use serde::Deserialize;

/// A parsed Gotify notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NotificationEvent {
    /// Gotify message id.
    #[serde(default)]
    pub id: Option<u64>,
    /// Id of the Gotify application that sent it.
    #[serde(default)]
    pub appid: Option<u64>,
    /// Gotify priority.
    #[serde(default)]
    pub priority: Option<i64>,
    /// Title line.
    #[serde(default)]
    pub title: String,
    /// Body text.
    #[serde(default, rename = "message")]
    pub body: String,
    #[serde(default)]
    extras: Extras,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct Extras {
    #[serde(default, rename = "client::display")]
    client_display: ClientDisplay,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct ClientDisplay {
    #[serde(default, rename = "contentType")]
    content_type: String,
}

impl NotificationEvent {
    /// Build an event directly (tests, synthetic messages).
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Attach a content type hint.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.extras.client_display.content_type = content_type.into();
        self
    }

    /// Parse a raw websocket payload.
    pub fn parse(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    /// Display content type, lowercased and trimmed. Empty when absent.
    pub fn content_type_hint(&self) -> String {
        self.extras.client_display.content_type.trim().to_lowercase()
    }
}
