//! Outbound Megolm group sessions, one per room.
//!
//! A session moves through three checks before it may encrypt:
//!
//! ```text
//! none ──create──► created (not shared) ──mark_shared──► usable ──limit──► expired
//!   │                    │                                                   │
//!   └ NoGroupSession     └ SessionNotShared                                  └ SessionExpired
//! ```
//!
//! The caller recovers from all three the same way: create a new session,
//! share it, encrypt again.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vodozemac::megolm::{GroupSession, GroupSessionPickle, SessionConfig};

use crate::constants;
use crate::transport::{EncryptError, RoomId};

/// When an outbound session has to be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Messages before the session expires.
    pub max_messages: u64,
    /// Age before the session expires.
    pub max_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_messages: constants::DEFAULT_ROTATION_MESSAGES,
            max_age: Duration::from_secs(constants::DEFAULT_ROTATION_SECS),
        }
    }
}

/// Serializable outbound session for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundSessionState {
    /// Pickled `GroupSession` (JSON).
    pub pickled_session: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Messages encrypted so far.
    pub message_count: u64,
    /// Whether the session key was distributed to the room.
    pub shared: bool,
}

/// An outbound group session plus its rotation bookkeeping.
pub struct OutboundGroupSession {
    session: GroupSession,
    created_at: DateTime<Utc>,
    message_count: u64,
    shared: bool,
}

impl std::fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session.session_id())
            .field("created_at", &self.created_at)
            .field("message_count", &self.message_count)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl OutboundGroupSession {
    /// Create a fresh, unshared session.
    pub fn new() -> Self {
        Self {
            session: GroupSession::new(SessionConfig::version_1()),
            created_at: Utc::now(),
            message_count: 0,
            shared: false,
        }
    }

    /// Session identifier.
    pub fn session_id(&self) -> String {
        self.session.session_id()
    }

    /// Exportable session key (base64) for `m.room_key` events.
    pub fn session_key(&self) -> String {
        self.session.session_key().to_base64()
    }

    /// Whether the session key was distributed.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Record that the session key reached the room's devices.
    pub fn mark_shared(&mut self) {
        self.shared = true;
    }

    /// Messages encrypted so far.
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Whether `policy` says this session must be replaced.
    pub fn is_expired(&self, policy: &RotationPolicy, now: DateTime<Utc>) -> bool {
        if self.message_count >= policy.max_messages {
            return true;
        }
        let age = now.signed_duration_since(self.created_at);
        age.to_std().is_ok_and(|age| age >= policy.max_age)
    }

    fn encrypt(&mut self, plaintext: &str) -> String {
        self.message_count += 1;
        self.session.encrypt(plaintext).to_base64()
    }

    /// Snapshot for persistence.
    pub fn to_state(&self) -> Result<OutboundSessionState> {
        Ok(OutboundSessionState {
            pickled_session: serde_json::to_string(&self.session.pickle())
                .context("Failed to serialize GroupSessionPickle")?,
            created_at: self.created_at,
            message_count: self.message_count,
            shared: self.shared,
        })
    }

    /// Restore from a persisted snapshot.
    pub fn from_state(state: &OutboundSessionState) -> Result<Self> {
        let pickle: GroupSessionPickle = serde_json::from_str(&state.pickled_session)
            .context("Failed to deserialize GroupSessionPickle")?;
        Ok(Self {
            session: GroupSession::from_pickle(pickle),
            created_at: state.created_at,
            message_count: state.message_count,
            shared: state.shared,
        })
    }
}

impl Default for OutboundGroupSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Megolm ciphertext plus the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MegolmCiphertext {
    /// Session id.
    pub session_id: String,
    /// Base64 ciphertext.
    pub ciphertext: String,
}

/// Per-room outbound sessions.
#[derive(Debug, Default)]
pub struct MegolmEngine {
    policy: RotationPolicy,
    sessions: HashMap<RoomId, OutboundGroupSession>,
}

impl MegolmEngine {
    /// Create an engine with the given rotation policy.
    pub fn new(policy: RotationPolicy) -> Self {
        Self {
            policy,
            sessions: HashMap::new(),
        }
    }

    /// Encrypt `plaintext` with the room's session.
    pub fn encrypt(&mut self, room: &RoomId, plaintext: &str) -> Result<MegolmCiphertext, EncryptError> {
        self.encrypt_at(room, plaintext, Utc::now())
    }

    fn encrypt_at(
        &mut self,
        room: &RoomId,
        plaintext: &str,
        now: DateTime<Utc>,
    ) -> Result<MegolmCiphertext, EncryptError> {
        let session = self
            .sessions
            .get_mut(room)
            .ok_or(EncryptError::NoGroupSession)?;

        if session.is_expired(&self.policy, now) {
            return Err(EncryptError::SessionExpired);
        }
        if !session.is_shared() {
            return Err(EncryptError::SessionNotShared);
        }

        let ciphertext = session.encrypt(plaintext);
        Ok(MegolmCiphertext {
            session_id: session.session_id(),
            ciphertext,
        })
    }

    /// Replace the room's session with a fresh, unshared one.
    pub fn create_session(&mut self, room: &RoomId) -> &mut OutboundGroupSession {
        let session = OutboundGroupSession::new();
        log::info!("Created outbound group session {} for {}", session.session_id(), room);
        match self.sessions.entry(room.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(session);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(session),
        }
    }

    /// Mark the room's current session as shared.
    pub fn mark_shared(&mut self, room: &RoomId) {
        if let Some(session) = self.sessions.get_mut(room) {
            session.mark_shared();
        }
    }

    /// The room's current session, if any.
    pub fn session(&self, room: &RoomId) -> Option<&OutboundGroupSession> {
        self.sessions.get(room)
    }

    /// Snapshot of all sessions for persistence.
    pub fn to_state(&self) -> Result<HashMap<String, OutboundSessionState>> {
        self.sessions
            .iter()
            .map(|(room, session)| Ok((room.0.clone(), session.to_state()?)))
            .collect()
    }

    /// Restore sessions; unreadable entries are dropped with a warning.
    pub fn restore(&mut self, state: &HashMap<String, OutboundSessionState>) {
        for (room, session_state) in state {
            match OutboundGroupSession::from_state(session_state) {
                Ok(session) => {
                    self.sessions.insert(RoomId(room.clone()), session);
                }
                Err(e) => log::warn!("Dropping unreadable group session for {room}: {e:#}"),
            }
        }
    }
}
