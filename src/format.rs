//! Notification -> markdown.
//!
//! | content type            | output                                   |
//! |-------------------------|------------------------------------------|
//! | empty / `text/plain`    | template with `[TITLE]` / `[MESSAGE]`    |
//! | `text/markdown`         | `# {title}\n\n{body}`, body untouched    |
//! | anything else           | body as-is (logged as unknown)           |
//!
//! Payloads that are not valid JSON become a diagnostic line carrying the raw
//! payload, which is still delivered.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::notification::NotificationEvent;

/// Prefix of the message delivered for unparseable payloads.
pub const PARSE_FAILURE_PREFIX: &str = "Could not parse message from: ";

/// Title placeholder.
pub const TITLE_PLACEHOLDER: &str = "[TITLE]";

/// Body placeholder.
pub const MESSAGE_PLACEHOLDER: &str = "[MESSAGE]";

const CONTENT_TYPE_PLAIN: &str = "text/plain";
const CONTENT_TYPE_MARKDOWN: &str = "text/markdown";

/// How the notification body should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    /// No hint, or `text/plain`.
    Plain,
    /// `text/markdown`.
    Markdown,
    /// Anything else.
    Unknown(String),
}

impl ContentType {
    /// Classify a normalized content type hint.
    pub fn from_hint(hint: &str) -> Self {
        match hint {
            "" | CONTENT_TYPE_PLAIN => Self::Plain,
            CONTENT_TYPE_MARKDOWN => Self::Markdown,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Title,
    Message,
}

/// A message template, split into literal text and placeholders once at load.
///
/// Rendering never rescans substituted values, so a title containing
/// `[MESSAGE]` stays literally `[MESSAGE]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    parts: Vec<Part>,
}

impl MessageTemplate {
    /// Parse template text.
    pub fn parse(template: &str) -> Self {
        let mut parts = Vec::new();
        let mut rest = template;

        loop {
            let title = rest.find(TITLE_PLACEHOLDER);
            let message = rest.find(MESSAGE_PLACEHOLDER);
            let (pos, part, len) = match (title, message) {
                (Some(t), Some(m)) if m < t => (m, Part::Message, MESSAGE_PLACEHOLDER.len()),
                (Some(t), _) => (t, Part::Title, TITLE_PLACEHOLDER.len()),
                (None, Some(m)) => (m, Part::Message, MESSAGE_PLACEHOLDER.len()),
                (None, None) => break,
            };
            if pos > 0 {
                parts.push(Part::Literal(rest[..pos].to_string()));
            }
            parts.push(part);
            rest = &rest[pos + len..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Self { parts }
    }

    /// Read and parse a template file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read message template {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Substitute title and body.
    pub fn render(&self, title: &str, body: &str) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Title => out.push_str(title),
                Part::Message => out.push_str(body),
            }
        }
        out
    }
}

/// Turns notifications into markdown.
#[derive(Debug, Clone, Default)]
pub struct Formatter {
    template: Option<MessageTemplate>,
}

impl Formatter {
    /// Formatter using `template` for plain-text notifications, or the
    /// built-in heading format when `None`.
    pub fn new(template: Option<MessageTemplate>) -> Self {
        Self { template }
    }

    /// Format a parsed notification.
    pub fn format(&self, event: &NotificationEvent) -> String {
        match ContentType::from_hint(&event.content_type_hint()) {
            ContentType::Plain => match &self.template {
                Some(template) => template.render(&event.title, &event.body),
                None => format!("# {}\n\n{}\n", event.title, event.body),
            },
            ContentType::Markdown => format!("# {}\n\n{}", event.title, event.body),
            ContentType::Unknown(hint) => {
                log::warn!("Unknown content type: {hint}");
                event.body.clone()
            }
        }
    }

    /// Parse and format a raw payload; unparseable payloads produce a
    /// diagnostic message instead of an error.
    pub fn format_payload(&self, raw: &[u8]) -> String {
        match NotificationEvent::parse(raw) {
            Ok(event) => {
                log::debug!(
                    "Notification id={:?} appid={:?} priority={:?}",
                    event.id,
                    event.appid,
                    event.priority
                );
                self.format(&event)
            }
            Err(e) => {
                let raw = String::from_utf8_lossy(raw);
                log::error!("Could not parse message from: {raw}: {e}");
                format!("{PARSE_FAILURE_PREFIX}{raw}")
            }
        }
    }
}
