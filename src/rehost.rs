//! Image re-hosting.
//!
//! Markdown images with an empty alt text and an http(s) URL are downloaded
//! and re-uploaded to the chat server, and the link is rewritten to point at
//! the uploaded media:
//!
//! ```text
//! "see ![](https://ci.example.com/graph.png) now"
//!        │
//!        ├─ host allowed?          no  -> keep token
//!        ├─ GET succeeds?          no  -> keep token
//!        ├─ Content-Type image/*?  no  -> keep token
//!        └─ upload_media           err -> keep token
//!        ▼
//! "see ![](mxc://example.com/AbC) now"
//! ```
//!
//! Nothing is fetched unless the operator configured at least one host
//! pattern. Per-link failures never leave this module.

use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use reqwest::{header, redirect, Client, Url};

use crate::transport::{ChatTransport, MediaReference, TransportError};

const TOKEN_OPEN: &str = "![](";
const TOKEN_SCHEME: &str = "http";

/// Redirect hops followed per image before giving up.
const MAX_REDIRECTS: usize = 5;

/// Compiled host patterns. An empty list permits nothing.
#[derive(Debug, Clone, Default)]
pub struct HostAllowlist {
    patterns: Vec<Regex>,
}

impl HostAllowlist {
    /// Compile patterns in order. Patterns are unanchored searches over the
    /// host name.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_patterns(patterns))
    }

    /// Allowlist from already compiled patterns.
    pub fn from_patterns(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    /// Allowlist that permits nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether no pattern is configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether any pattern matches `host`.
    pub fn permits(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(host))
    }
}

/// A piece of markdown: either plain text or an image token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Text outside any image token.
    Text(&'a str),
    /// `![](url)` token.
    Image {
        /// The whole token, as authored.
        token: &'a str,
        /// The URL between the parentheses.
        url: &'a str,
    },
}

/// Lazy tokenizer over markdown, yielding text and image segments in order.
///
/// Concatenating every segment's text reproduces the input exactly.
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    rest: &'a str,
}

/// Split `content` into text and image segments.
pub fn segments(content: &str) -> Segments<'_> {
    Segments { rest: content }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match find_image_token(self.rest) {
            Some((0, end)) => {
                let token = &self.rest[..end];
                self.rest = &self.rest[end..];
                Some(Segment::Image {
                    token,
                    url: &token[TOKEN_OPEN.len()..token.len() - 1],
                })
            }
            Some((start, _)) => {
                let text = &self.rest[..start];
                self.rest = &self.rest[start..];
                Some(Segment::Text(text))
            }
            None => {
                let text = self.rest;
                self.rest = "";
                Some(Segment::Text(text))
            }
        }
    }
}

/// Leftmost `![](http...)` token as a `(start, end)` byte range. The URL
/// ends at the first `)` and may not span a line break.
fn find_image_token(s: &str) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(offset) = s[from..].find(TOKEN_OPEN) {
        let start = from + offset;
        let url_start = start + TOKEN_OPEN.len();
        let after = &s[url_start..];
        if after.starts_with(TOKEN_SCHEME) {
            if let Some(close) = after.find([')', '\n']) {
                if after.as_bytes()[close] == b')' {
                    return Some((start, url_start + close + 1));
                }
            }
        }
        from = start + 1;
    }
    None
}

/// Why a single image link was left untouched.
#[derive(Debug, thiserror::Error)]
pub enum SkipReason {
    /// URL did not parse.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// URL has no host part.
    #[error("URL has no host")]
    NoHost,
    /// Host matched no allowlist pattern.
    #[error("host {0} is not allowed")]
    HostNotAllowed(String),
    /// Network failure.
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    /// Non-success HTTP status.
    #[error("fetch returned HTTP {0}")]
    Status(u16),
    /// Declared content type is not `image/*`.
    #[error("content type {0:?} is not an image")]
    NotAnImage(String),
    /// Upload to the chat server failed.
    #[error("upload failed: {0}")]
    Upload(#[from] TransportError),
}

/// Downloads allowlisted images and re-uploads them via the transport.
#[derive(Debug, Clone)]
pub struct ImageRehoster {
    allowlist: HostAllowlist,
    client: Client,
}

impl ImageRehoster {
    /// Rehoster with its own HTTP client bounded by `timeout`.
    ///
    /// Redirects are followed only while every hop stays on an allowed host.
    pub fn new(allowlist: HostAllowlist, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect_policy(allowlist.clone()))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build image HTTP client: {e}"))?;
        Ok(Self { allowlist, client })
    }

    /// The configured allowlist.
    pub fn allowlist(&self) -> &HostAllowlist {
        &self.allowlist
    }

    /// Rewrite every rehostable image link in `content`.
    pub async fn rehost(&self, content: &str, transport: &dyn ChatTransport) -> String {
        if self.allowlist.is_empty() {
            return content.to_string();
        }

        let mut out = String::with_capacity(content.len());
        for segment in segments(content) {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Image { token, url } => match self.rehost_one(url, transport).await {
                    Ok(reference) => {
                        log::info!("Rehosted image {url} as {reference}");
                        out.push_str(TOKEN_OPEN);
                        out.push_str(&reference.0);
                        out.push(')');
                    }
                    Err(reason) => {
                        log::warn!("Leaving image link {url} unchanged: {reason}");
                        out.push_str(token);
                    }
                },
            }
        }
        out
    }

    async fn rehost_one(
        &self,
        url: &str,
        transport: &dyn ChatTransport,
    ) -> Result<MediaReference, SkipReason> {
        let parsed = Url::parse(url).map_err(|e| SkipReason::InvalidUrl(e.to_string()))?;
        let host = parsed.host_str().ok_or(SkipReason::NoHost)?;
        if !self.allowlist.permits(host) {
            return Err(SkipReason::HostNotAllowed(host.to_string()));
        }

        let response = self.client.get(parsed.clone()).send().await?;
        if !response.status().is_success() {
            return Err(SkipReason::Status(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(SkipReason::NotAnImage(content_type));
        }

        let data: Bytes = response.bytes().await?;
        let length = data.len() as u64;
        Ok(transport.upload_media(data, &content_type, length).await?)
    }
}

fn redirect_policy(allowlist: HostAllowlist) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let host = attempt.url().host_str().map(str::to_owned);
        match host {
            Some(host) if allowlist.permits(&host) => attempt.follow(),
            Some(host) => attempt.error(format!("redirect to disallowed host {host}")),
            None => attempt.error("redirect target has no host"),
        }
    })
}
