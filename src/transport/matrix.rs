//! [`ChatTransport`] over the Matrix Client-Server API.
//!
//! # Group session sharing
//!
//! ```text
//! share_group_session(room, members)
//!   1. upload our device keys + one-time keys (once per device)
//!   2. new outbound Megolm session for the room
//!   3. POST /keys/query    members -> devices
//!   4. POST /keys/claim    devices without an Olm session -> one-time keys
//!   5. Olm-encrypt m.room_key per device
//!   6. PUT /sendToDevice/m.room.encrypted
//!   7. mark session shared, persist
//! ```
//!
//! Devices without a claimable one-time key are skipped; they will not be
//! able to read messages until the next rotation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use super::client::MatrixClient;
use super::{
    ChatTransport, EncryptError, EncryptedEnvelope, MediaReference, MessageContent, RoomId,
    TransportError, UserId,
};
use crate::crypto::olm::{claimed_key, parse_device_keys};
use crate::crypto::{CryptoEngine, DeviceInfo, EngineState};

/// Room message event type.
pub const EVENT_ROOM_MESSAGE: &str = "m.room.message";

/// Encrypted event type (room and to-device).
pub const EVENT_ROOM_ENCRYPTED: &str = "m.room.encrypted";

/// Room key to-device event type.
pub const EVENT_ROOM_KEY: &str = "m.room_key";

/// Matrix-backed transport.
#[derive(Debug, Clone)]
pub struct MatrixTransport {
    client: MatrixClient,
    crypto: Option<Arc<CryptoEngine>>,
}

impl MatrixTransport {
    /// Plaintext-only transport.
    pub fn new(client: MatrixClient) -> Self {
        Self {
            client,
            crypto: None,
        }
    }

    /// Transport with Megolm encryption support.
    pub fn with_crypto(client: MatrixClient, crypto: Arc<CryptoEngine>) -> Self {
        Self {
            client,
            crypto: Some(crypto),
        }
    }

    fn require_crypto(&self) -> Result<&CryptoEngine, TransportError> {
        self.crypto
            .as_deref()
            .ok_or_else(|| TransportError::Crypto("encryption is not enabled".into()))
    }

    async fn ensure_keys_uploaded(&self, state: &mut EngineState) -> Result<(), TransportError> {
        if state.account.keys_published() {
            return Ok(());
        }
        let body = state.account.keys_upload_body();
        let response = self.client.upload_keys(&body).await?;
        state.account.mark_keys_as_published();
        log::info!(
            "Uploaded device keys (one-time keys on server: {:?})",
            response.one_time_key_counts
        );
        Ok(())
    }

    /// Make sure an Olm session exists for every device, claiming one-time
    /// keys where needed. Returns the devices that can receive keys.
    async fn establish_olm_sessions(
        &self,
        state: &mut EngineState,
        devices: Vec<DeviceInfo>,
    ) -> Result<Vec<DeviceInfo>, TransportError> {
        let mut to_claim: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for device in &devices {
            if !state.account.has_session(&device.curve25519) {
                to_claim
                    .entry(device.user_id.clone())
                    .or_default()
                    .push(device.device_id.clone());
            }
        }

        if !to_claim.is_empty() {
            let claimed = self.client.claim_keys(&to_claim).await?;
            for device in &devices {
                if state.account.has_session(&device.curve25519) {
                    continue;
                }
                let Some(otk) = claimed_key(&claimed.one_time_keys, &device.user_id, &device.device_id)
                else {
                    log::warn!(
                        "No one-time key for {}/{}, skipping",
                        device.user_id,
                        device.device_id
                    );
                    continue;
                };
                if let Err(e) = state.account.create_outbound_session(&device.curve25519, otk) {
                    log::warn!(
                        "Could not create Olm session with {}/{}: {e:#}",
                        device.user_id,
                        device.device_id
                    );
                }
            }
        }

        Ok(devices
            .into_iter()
            .filter(|d| state.account.has_session(&d.curve25519))
            .collect())
    }
}

#[async_trait]
impl ChatTransport for MatrixTransport {
    async fn send_plain(
        &self,
        room: &RoomId,
        content: &MessageContent,
    ) -> Result<(), TransportError> {
        self.client
            .send_event(room, EVENT_ROOM_MESSAGE, content)
            .await
            .map(|_| ())
    }

    async fn encrypt_for_room(
        &self,
        room: &RoomId,
        content: &MessageContent,
    ) -> Result<EncryptedEnvelope, EncryptError> {
        let crypto = self
            .crypto
            .as_deref()
            .ok_or_else(|| EncryptError::Other("encryption is not enabled".into()))?;
        crypto.encrypt_room_event(room, EVENT_ROOM_MESSAGE, content).await
    }

    async fn share_group_session(
        &self,
        room: &RoomId,
        members: &[UserId],
    ) -> Result<(), TransportError> {
        let crypto = self.require_crypto()?;
        let mut state = crypto.lock().await;

        self.ensure_keys_uploaded(&mut state).await?;

        let (session_id, session_key) = {
            let session = state.megolm.create_session(room);
            (session.session_id(), session.session_key())
        };

        let query = self.client.query_keys(members).await?;
        let own_user = state.account.user_id().to_string();
        let own_device = state.account.device_id().to_string();
        let devices: Vec<DeviceInfo> = parse_device_keys(&query.device_keys)
            .into_iter()
            .filter(|d| !(d.user_id == own_user && d.device_id == own_device))
            .collect();

        let recipients = self.establish_olm_sessions(&mut state, devices).await?;

        let room_key = json!({
            "algorithm": crate::constants::MEGOLM_ALGORITHM,
            "room_id": room,
            "session_id": session_id,
            "session_key": session_key,
        });

        let mut messages: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for device in &recipients {
            let encrypted = state
                .account
                .encrypt_to_device(device, EVENT_ROOM_KEY, room_key.clone())
                .map_err(|e| TransportError::Crypto(format!("{e:#}")))?;
            messages
                .entry(device.user_id.clone())
                .or_default()
                .insert(device.device_id.clone(), encrypted);
        }

        if !messages.is_empty() {
            self.client
                .send_to_device(EVENT_ROOM_ENCRYPTED, &messages)
                .await?;
        }

        state.megolm.mark_shared(room);
        log::info!(
            "Shared group session {} for {} with {} device(s) of {} member(s)",
            session_id,
            room,
            recipients.len(),
            members.len()
        );

        if let Err(e) = crypto.save(&state) {
            log::warn!("Failed to persist crypto state: {e:#}");
        }
        Ok(())
    }

    async fn send_encrypted(
        &self,
        room: &RoomId,
        envelope: &EncryptedEnvelope,
    ) -> Result<(), TransportError> {
        self.client
            .send_event(room, EVENT_ROOM_ENCRYPTED, envelope)
            .await
            .map(|_| ())
    }

    async fn list_room_members(&self, room: &RoomId) -> Result<Vec<UserId>, TransportError> {
        self.client.joined_members(room).await
    }

    async fn upload_media(
        &self,
        data: Bytes,
        content_type: &str,
        content_length: u64,
    ) -> Result<MediaReference, TransportError> {
        self.client.upload(data, content_type, content_length).await
    }
}
