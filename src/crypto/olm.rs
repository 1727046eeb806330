//! The relay's own Olm device.
//!
//! Holds the vodozemac `Account` (identity + one-time keys) and the Olm
//! sessions used to hand Megolm room keys to other devices as
//! `m.room.encrypted` to-device events.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use vodozemac::olm::{Account, OlmMessage, Session, SessionConfig};
use vodozemac::Curve25519PublicKey;

use crate::constants;

/// Olm message type: PreKey (session establishment).
const MSG_TYPE_PREKEY: u8 = 0;

/// Olm message type: normal.
const MSG_TYPE_NORMAL: u8 = 1;

/// A remote device we can send keys to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Owner.
    pub user_id: String,
    /// Device id.
    pub device_id: String,
    /// Curve25519 identity key (base64).
    pub curve25519: String,
    /// Ed25519 fingerprint key (base64).
    pub ed25519: String,
}

/// Extract usable devices from a `/keys/query` `device_keys` map.
///
/// Entries whose embedded ids disagree with their map position, or that lack
/// either identity key, are skipped.
pub fn parse_device_keys(device_keys: &BTreeMap<String, BTreeMap<String, Value>>) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    for (user_id, user_devices) in device_keys {
        for (device_id, keys) in user_devices {
            if keys["user_id"].as_str() != Some(user_id.as_str())
                || keys["device_id"].as_str() != Some(device_id.as_str())
            {
                log::warn!("Ignoring mismatched device keys for {user_id}/{device_id}");
                continue;
            }
            let curve = keys["keys"][format!("curve25519:{device_id}")].as_str();
            let ed = keys["keys"][format!("ed25519:{device_id}")].as_str();
            match (curve, ed) {
                (Some(curve), Some(ed)) => devices.push(DeviceInfo {
                    user_id: user_id.clone(),
                    device_id: device_id.clone(),
                    curve25519: curve.to_string(),
                    ed25519: ed.to_string(),
                }),
                _ => log::warn!("Device {user_id}/{device_id} has no identity keys"),
            }
        }
    }
    devices
}

/// Pick the claimed one-time key for a device out of a `/keys/claim` response.
pub fn claimed_key<'a>(
    one_time_keys: &'a BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
    user_id: &str,
    device_id: &str,
) -> Option<&'a str> {
    one_time_keys
        .get(user_id)?
        .get(device_id)?
        .iter()
        .find(|(key_id, _)| key_id.starts_with("signed_curve25519:"))
        .and_then(|(_, key)| key["key"].as_str())
}

/// Serializable account state for persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    /// Pickled Account (vodozemac's serialized format).
    pub pickled_account: String,
    /// Owner.
    pub user_id: String,
    /// Device id.
    pub device_id: String,
    /// Pickled Olm sessions keyed by the peer's Curve25519 key.
    #[serde(default)]
    pub olm_sessions: HashMap<String, String>,
    /// Whether device keys were uploaded.
    #[serde(default)]
    pub keys_published: bool,
}

/// The relay's Olm device.
pub struct DeviceAccount {
    account: Account,
    user_id: String,
    device_id: String,
    sessions: HashMap<String, Session>,
    keys_published: bool,
}

impl std::fmt::Debug for DeviceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAccount")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("sessions", &self.sessions.len())
            .field("keys_published", &self.keys_published)
            .finish_non_exhaustive()
    }
}

impl DeviceAccount {
    /// Create a new device with a fresh identity.
    pub fn new(user_id: &str, device_id: &str) -> Self {
        let account = Account::new();
        log::info!(
            "Created new Olm account for {} / {} (identity: {}...)",
            user_id,
            device_id,
            &account.curve25519_key().to_base64()[..16]
        );
        Self {
            account,
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            sessions: HashMap::new(),
            keys_published: false,
        }
    }

    /// Restore from persisted state.
    pub fn from_state(state: &AccountState) -> Result<Self> {
        let pickle: vodozemac::olm::AccountPickle = serde_json::from_str(&state.pickled_account)
            .context("Failed to deserialize AccountPickle")?;
        let account = Account::from(pickle);

        let mut sessions = HashMap::with_capacity(state.olm_sessions.len());
        for (peer_key, pickled) in &state.olm_sessions {
            let pickle: vodozemac::olm::SessionPickle =
                serde_json::from_str(pickled).context("Failed to deserialize SessionPickle")?;
            sessions.insert(peer_key.clone(), Session::from(pickle));
        }

        Ok(Self {
            account,
            user_id: state.user_id.clone(),
            device_id: state.device_id.clone(),
            sessions,
            keys_published: state.keys_published,
        })
    }

    /// Snapshot for persistence.
    pub fn to_state(&self) -> Result<AccountState> {
        let pickled_account = serde_json::to_string(&self.account.pickle())
            .context("Failed to serialize AccountPickle")?;
        let olm_sessions = self
            .sessions
            .iter()
            .map(|(peer, session)| {
                serde_json::to_string(&session.pickle())
                    .map(|pickled| (peer.clone(), pickled))
                    .context("Failed to serialize SessionPickle")
            })
            .collect::<Result<_>>()?;

        Ok(AccountState {
            pickled_account,
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            olm_sessions,
            keys_published: self.keys_published,
        })
    }

    /// Owner.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Our Curve25519 identity key (base64).
    pub fn identity_key(&self) -> String {
        self.account.curve25519_key().to_base64()
    }

    /// Our Ed25519 fingerprint key (base64).
    pub fn signing_key(&self) -> String {
        self.account.ed25519_key().to_base64()
    }

    /// Whether device keys were uploaded.
    pub fn keys_published(&self) -> bool {
        self.keys_published
    }

    /// Body for `POST /keys/upload`: device keys (first time only) plus a
    /// fresh batch of signed one-time keys.
    pub fn keys_upload_body(&mut self) -> Value {
        let mut body = Map::new();
        if !self.keys_published {
            body.insert("device_keys".into(), self.device_keys());
        }

        self.account.generate_one_time_keys(constants::ONE_TIME_KEY_COUNT);
        let one_time_keys: Map<String, Value> = self
            .account
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| {
                let mut signed = json!({ "key": key.to_base64() });
                self.sign_json(&mut signed);
                (format!("signed_curve25519:{}", key_id.to_base64()), signed)
            })
            .collect();
        body.insert("one_time_keys".into(), Value::Object(one_time_keys));

        Value::Object(body)
    }

    /// Record a successful key upload.
    pub fn mark_keys_as_published(&mut self) {
        self.account.mark_keys_as_published();
        self.keys_published = true;
    }

    fn device_keys(&self) -> Value {
        let mut keys = json!({
            "user_id": self.user_id,
            "device_id": self.device_id,
            "algorithms": [constants::OLM_ALGORITHM, constants::MEGOLM_ALGORITHM],
            "keys": {
                format!("curve25519:{}", self.device_id): self.identity_key(),
                format!("ed25519:{}", self.device_id): self.signing_key(),
            },
        });
        self.sign_json(&mut keys);
        keys
    }

    /// Add our signature to a JSON object, Matrix style.
    fn sign_json(&self, value: &mut Value) {
        let signature = self.account.sign(canonical_json(value).as_str()).to_base64();
        if let Value::Object(map) = value {
            map.insert(
                "signatures".into(),
                json!({ self.user_id.as_str(): { format!("ed25519:{}", self.device_id): signature } }),
            );
        }
    }

    /// Whether an Olm session exists with the device owning `curve25519`.
    pub fn has_session(&self, curve25519: &str) -> bool {
        self.sessions.contains_key(curve25519)
    }

    /// Establish an outbound Olm session from a claimed one-time key.
    pub fn create_outbound_session(&mut self, curve25519: &str, one_time_key: &str) -> Result<()> {
        let identity = Curve25519PublicKey::from_base64(curve25519)
            .map_err(|e| anyhow::anyhow!("Invalid peer identity key: {e}"))?;
        let otk = Curve25519PublicKey::from_base64(one_time_key)
            .map_err(|e| anyhow::anyhow!("Invalid peer one-time key: {e}"))?;

        let session = self
            .account
            .create_outbound_session(SessionConfig::version_1(), identity, otk);
        self.sessions.insert(curve25519.to_string(), session);
        Ok(())
    }

    /// Olm-encrypt an event for one device, producing `m.room.encrypted`
    /// to-device content.
    pub fn encrypt_to_device(
        &mut self,
        recipient: &DeviceInfo,
        event_type: &str,
        content: Value,
    ) -> Result<Value> {
        let our_identity = self.identity_key();
        let payload = json!({
            "type": event_type,
            "content": content,
            "sender": self.user_id,
            "sender_device": self.device_id,
            "keys": { "ed25519": self.signing_key() },
            "recipient": recipient.user_id,
            "recipient_keys": { "ed25519": recipient.ed25519 },
        });
        let plaintext = serde_json::to_string(&payload).context("Failed to serialize payload")?;

        let session = self
            .sessions
            .get_mut(&recipient.curve25519)
            .with_context(|| {
                format!(
                    "No Olm session with {}/{}",
                    recipient.user_id, recipient.device_id
                )
            })?;

        let (message_type, body) = match session.encrypt(&plaintext) {
            OlmMessage::PreKey(m) => (MSG_TYPE_PREKEY, STANDARD_NO_PAD.encode(m.to_bytes())),
            OlmMessage::Normal(m) => (MSG_TYPE_NORMAL, STANDARD_NO_PAD.encode(m.to_bytes())),
        };

        Ok(json!({
            "algorithm": constants::OLM_ALGORITHM,
            "sender_key": our_identity,
            "ciphertext": {
                recipient.curve25519.as_str(): { "type": message_type, "body": body },
            },
        }))
    }
}

/// Matrix canonical JSON: sorted keys, no insignificant whitespace, without
/// `signatures` and `unsigned` at the top level.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let ordered: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sorted(v))).collect();
                let mut out = Map::new();
                for (k, v) in ordered {
                    out.insert(k.clone(), v);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }

    let mut stripped = value.clone();
    if let Value::Object(map) = &mut stripped {
        map.remove("signatures");
        map.remove("unsigned");
    }
    sorted(&stripped).to_string()
}
