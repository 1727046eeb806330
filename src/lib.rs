//! Gotify -> Matrix relay.
//!
//! Listens to a Gotify server's message stream and posts every notification
//! into a single Matrix room, optionally end-to-end encrypted with Megolm.
//!
//! # Architecture
//!
//! ```text
//! Gotify websocket ──► mpsc ──► Relay ──► Formatter ──► ImageRehoster ──► DeliveryStateMachine ──► ChatTransport
//!   (gotify.rs)              (relay.rs)   (format.rs)     (rehost.rs)        (delivery.rs)          (transport/)
//! ```
//!
//! Each payload is processed to completion before the next one is taken, so
//! messages reach the room in arrival order and at most one group-session
//! rotation is ever in flight.
//!
//! # Modules
//!
//! - [`notification`] - Gotify message parsing
//! - [`format`] - notification -> markdown
//! - [`rehost`] - image allowlist and re-upload
//! - [`delivery`] - plaintext / encrypted send with session rotation
//! - [`relay`] - per-payload pipeline
//! - [`transport`] - `ChatTransport` seam and the Matrix implementation
//! - [`crypto`] - vodozemac Olm/Megolm engine and persistence
//! - [`config`] - configuration loading and validation

pub mod config;
pub mod constants;
pub mod crypto;
pub mod delivery;
pub mod format;
pub mod gotify;
pub mod logging;
pub mod notification;
pub mod rehost;
pub mod relay;
pub mod transport;
pub mod ws;

pub use config::Config;
pub use delivery::{DeliveryError, DeliveryStateMachine, RelayTarget};
pub use format::{Formatter, MessageTemplate};
pub use notification::NotificationEvent;
pub use rehost::{HostAllowlist, ImageRehoster};
pub use relay::Relay;
pub use transport::{ChatTransport, EncryptError, TransportError};
