//! Gotify message stream.
//!
//! Connects to `{url}/stream` with the client token in `X-Gotify-Key` and
//! forwards every text or binary frame, unparsed, into a bounded channel.
//! The connection is not re-established: a dropped stream is reported to the
//! caller as an error.

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use crate::ws::{self, WsMessage};

/// Header carrying the Gotify client token.
pub const TOKEN_HEADER: &str = "X-Gotify-Key";

/// Producer of raw notification payloads.
#[derive(Debug, Clone)]
pub struct GotifySource {
    stream_url: String,
    token: String,
}

impl GotifySource {
    /// Source for a Gotify server at `base_url` (already `ws://` / `wss://`).
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self {
            stream_url: format!("{}/stream", base_url.trim_end_matches('/')),
            token: token.into(),
        }
    }

    /// Websocket URL of the message stream.
    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    /// Forward payloads into `payloads` until the stream ends.
    ///
    /// Returns `Ok` only when the receiving side has gone away.
    pub async fn run(&self, payloads: mpsc::Sender<Vec<u8>>) -> Result<()> {
        let (mut writer, mut reader) =
            ws::connect(&self.stream_url, &[(TOKEN_HEADER, &self.token)]).await?;
        log::info!("Connected to Gotify server at {}", self.stream_url);

        while let Some(message) = reader.recv().await {
            match message? {
                WsMessage::Text(data) | WsMessage::Binary(data) => {
                    log::debug!("Received {} byte(s) from Gotify", data.len());
                    if payloads.send(data).await.is_err() {
                        log::info!("Relay stopped, closing Gotify stream");
                        if let Err(e) = writer.close().await {
                            log::debug!("Closing Gotify stream failed: {e:#}");
                        }
                        return Ok(());
                    }
                }
                WsMessage::Ping(data) => writer.send_pong(data).await?,
                WsMessage::Close { code, reason } => {
                    bail!("Gotify closed the stream (code {code}): {reason}")
                }
            }
        }

        bail!("Gotify stream ended unexpectedly")
    }
}
