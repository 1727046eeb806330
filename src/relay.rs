//! Per-payload pipeline: parse -> format -> rehost images -> deliver.
//!
//! Payloads are handled strictly one at a time, in arrival order. A delivery
//! error ends [`Relay::run`]; the caller decides how to terminate.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::delivery::{DeliveryError, DeliveryStateMachine, RelayTarget};
use crate::format::Formatter;
use crate::rehost::ImageRehoster;
use crate::transport::ChatTransport;

/// Wires the pipeline stages together for one target room.
pub struct Relay {
    formatter: Formatter,
    rehoster: ImageRehoster,
    transport: Arc<dyn ChatTransport>,
    delivery: DeliveryStateMachine,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("formatter", &self.formatter)
            .field("rehoster", &self.rehoster)
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Build a relay delivering into `target` through `transport`.
    pub fn new(
        formatter: Formatter,
        rehoster: ImageRehoster,
        transport: Arc<dyn ChatTransport>,
        target: RelayTarget,
    ) -> Self {
        let delivery = DeliveryStateMachine::new(Arc::clone(&transport), target);
        Self {
            formatter,
            rehoster,
            transport,
            delivery,
        }
    }

    /// The delivery stage.
    pub fn delivery(&self) -> &DeliveryStateMachine {
        &self.delivery
    }

    /// Run one payload through the whole pipeline.
    pub async fn handle_payload(&self, raw: &[u8]) -> Result<(), DeliveryError> {
        let markdown = self.formatter.format_payload(raw);
        let markdown = self.rehoster.rehost(&markdown, self.transport.as_ref()).await;
        self.delivery.deliver(&markdown).await
    }

    /// Consume payloads until the channel closes or a delivery fails.
    pub async fn run(&self, mut payloads: mpsc::Receiver<Vec<u8>>) -> Result<(), DeliveryError> {
        log::info!(
            "Relaying into {} (encryption {})",
            self.delivery.target().room_id,
            if self.delivery.target().encryption_enabled { "on" } else { "off" }
        );

        let mut delivered: u64 = 0;
        while let Some(raw) = payloads.recv().await {
            self.handle_payload(&raw).await?;
            delivered += 1;
            log::info!("Relayed message #{delivered}");
        }

        log::info!("Payload stream closed after {delivered} message(s)");
        Ok(())
    }
}
