//! E2E encryption engine built on vodozemac.
//!
//! Olm (1:1, to-device) carries room keys; Megolm (group) encrypts room
//! messages. The engine owns both plus their persistence. Key distribution
//! over the network is driven by [`crate::transport::MatrixTransport`].
//!
//! ```text
//! CryptoEngine
//!     ├── DeviceAccount  (olm.rs)     identity keys, OTKs, Olm sessions
//!     ├── MegolmEngine   (megolm.rs)  per-room outbound group sessions
//!     └── CryptoStore    (store.rs)   JSON pickles on disk
//! ```

pub mod megolm;
pub mod olm;
pub mod store;

use anyhow::Result;
use serde_json::json;
use tokio::sync::{Mutex, MutexGuard};

pub use megolm::{MegolmEngine, OutboundGroupSession, RotationPolicy};
pub use olm::{DeviceAccount, DeviceInfo};
pub use store::{CryptoState, CryptoStore};

use crate::constants;
use crate::transport::{EncryptError, EncryptedEnvelope, MessageContent, RoomId};

/// Mutable crypto state, guarded by [`CryptoEngine`]'s mutex.
#[derive(Debug)]
pub struct EngineState {
    /// Our Olm device.
    pub account: DeviceAccount,
    /// Outbound group sessions.
    pub megolm: MegolmEngine,
}

impl EngineState {
    fn snapshot(&self) -> Result<CryptoState> {
        Ok(CryptoState {
            version: 0,
            account: self.account.to_state()?,
            megolm_sessions: self.megolm.to_state()?,
        })
    }
}

/// Olm/Megolm engine with optional persistence.
#[derive(Debug)]
pub struct CryptoEngine {
    state: Mutex<EngineState>,
    store: Option<CryptoStore>,
}

impl CryptoEngine {
    /// In-memory engine with a fresh identity.
    pub fn new(user_id: &str, device_id: &str, policy: RotationPolicy) -> Self {
        Self {
            state: Mutex::new(EngineState {
                account: DeviceAccount::new(user_id, device_id),
                megolm: MegolmEngine::new(policy),
            }),
            store: None,
        }
    }

    /// Load persisted state for this user/device, or start fresh.
    ///
    /// A store belonging to another user or device is ignored (and will be
    /// overwritten on the next save).
    pub fn load_or_create(
        store: CryptoStore,
        user_id: &str,
        device_id: &str,
        policy: RotationPolicy,
    ) -> Self {
        let restored = match store.load() {
            Ok(Some(saved))
                if saved.account.user_id == user_id && saved.account.device_id == device_id =>
            {
                match DeviceAccount::from_state(&saved.account) {
                    Ok(account) => {
                        let mut megolm = MegolmEngine::new(policy);
                        megolm.restore(&saved.megolm_sessions);
                        log::info!("Loaded crypto state from {}", store.path().display());
                        Some(EngineState { account, megolm })
                    }
                    Err(e) => {
                        log::warn!("Could not restore Olm account: {e:#}, creating new");
                        None
                    }
                }
            }
            Ok(Some(saved)) => {
                log::warn!(
                    "Crypto store belongs to {}/{}, creating new identity for {}/{}",
                    saved.account.user_id,
                    saved.account.device_id,
                    user_id,
                    device_id
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Could not load crypto store: {e:#}, creating new");
                None
            }
        };

        let state = restored.unwrap_or_else(|| EngineState {
            account: DeviceAccount::new(user_id, device_id),
            megolm: MegolmEngine::new(policy),
        });

        Self {
            state: Mutex::new(state),
            store: Some(store),
        }
    }

    /// Exclusive access to the crypto state.
    pub async fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().await
    }

    /// Megolm-encrypt a room event.
    pub async fn encrypt_room_event(
        &self,
        room: &RoomId,
        event_type: &str,
        content: &MessageContent,
    ) -> Result<EncryptedEnvelope, EncryptError> {
        let plaintext = serde_json::to_string(&json!({
            "type": event_type,
            "content": content,
            "room_id": room,
        }))
        .map_err(|e| EncryptError::Other(e.to_string()))?;

        let mut state = self.state.lock().await;
        let encrypted = state.megolm.encrypt(room, &plaintext)?;
        // The ratchet advanced; a stale pickle would reuse message indexes.
        if let Err(e) = self.save(&state) {
            log::warn!("Failed to persist group session after encrypt: {e:#}");
        }

        Ok(EncryptedEnvelope {
            algorithm: constants::MEGOLM_ALGORITHM.to_string(),
            sender_key: state.account.identity_key(),
            ciphertext: encrypted.ciphertext,
            session_id: encrypted.session_id,
            device_id: state.account.device_id().to_string(),
        })
    }

    /// Persist the given state (caller already holds the lock).
    pub fn save(&self, state: &EngineState) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(&state.snapshot()?)?;
        }
        Ok(())
    }

    /// Lock and persist.
    pub async fn persist(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.save(&state)
    }
}
