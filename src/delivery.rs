//! Message delivery with group-session rotation.
//!
//! # States
//!
//! ```text
//!               encryption off
//! Unencrypted ─────send_plain─────────────────────────────► Delivered
//!
//!               encryption on
//! Encrypted-NoSession ──┐
//!                       ├─ encrypt ok ──► Encrypted-HaveSession ──send──► Delivered
//! Encrypted-HaveSession ┘
//!        │ Expired / NotShared / NoSession
//!        ▼
//! Encrypted-Rotating ── list members, share, encrypt again (once)
//!        │ ok ──► send ──► Delivered
//!        └ err ─────────────────────────────────────────────► Failed
//! ```
//!
//! Any other failure is [`Failed`](DeliveryState::Failed) and returned to
//! the caller as a fatal [`DeliveryError`].
//!
//! The session handle is locked for the whole read-rotate-encrypt-send
//! sequence, so concurrent callers for the same room never encrypt with a
//! session that is being replaced.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::transport::{
    render_markdown, ChatTransport, EncryptError, EncryptedEnvelope, MessageContent, RoomId,
    TransportError,
};

/// Where messages go. Fixed after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    /// Target room.
    pub room_id: RoomId,
    /// Whether messages are Megolm-encrypted.
    pub encryption_enabled: bool,
}

/// Delivery progress for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Plaintext room.
    Unencrypted,
    /// Encrypted room, no usable session known.
    EncryptedNoSession,
    /// Encrypted room, session believed valid.
    EncryptedHaveSession,
    /// Replacing the room's group session.
    EncryptedRotating,
    /// Message accepted by the server.
    Delivered,
    /// Message could not be delivered.
    Failed,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unencrypted => "unencrypted",
            Self::EncryptedNoSession => "encrypted-no-session",
            Self::EncryptedHaveSession => "encrypted-have-session",
            Self::EncryptedRotating => "encrypted-rotating",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        })
    }
}

/// Our view of the room's group session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSession {
    /// Room the session belongs to.
    pub room_id: RoomId,
    /// False once the transport reported it unusable or a rotation failed.
    pub valid: bool,
}

/// Fatal delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Sending the (plain or encrypted) event failed.
    #[error("failed to send message: {0}")]
    Send(#[source] TransportError),
    /// Encryption failed for a reason rotation cannot fix.
    #[error("failed to encrypt message: {0}")]
    Encrypt(#[source] EncryptError),
    /// Encryption still failed after a fresh session was shared.
    #[error("failed to encrypt message after session rotation: {0}")]
    EncryptAfterRotation(#[source] EncryptError),
    /// Listing room members for rotation failed.
    #[error("failed to list room members: {0}")]
    ListMembers(#[source] TransportError),
    /// Sharing the new group session failed.
    #[error("failed to share group session: {0}")]
    ShareSession(#[source] TransportError),
}

/// Delivers markdown to the target room.
pub struct DeliveryStateMachine {
    transport: Arc<dyn ChatTransport>,
    target: RelayTarget,
    session: Mutex<Option<EncryptionSession>>,
}

impl fmt::Debug for DeliveryStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryStateMachine")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

fn transition(from: DeliveryState, to: DeliveryState) -> DeliveryState {
    log::debug!("Delivery: {from} -> {to}");
    to
}

impl DeliveryStateMachine {
    /// Create a state machine for `target`.
    pub fn new(transport: Arc<dyn ChatTransport>, target: RelayTarget) -> Self {
        Self {
            transport,
            target,
            session: Mutex::new(None),
        }
    }

    /// The target room.
    pub fn target(&self) -> &RelayTarget {
        &self.target
    }

    /// Current session handle, if any.
    pub async fn session(&self) -> Option<EncryptionSession> {
        self.session.lock().await.clone()
    }

    /// Render `markdown` and deliver it.
    pub async fn deliver(&self, markdown: &str) -> Result<(), DeliveryError> {
        log::debug!("Sending to {}:\n{}", self.target.room_id, markdown);
        let content = render_markdown(markdown);

        if !self.target.encryption_enabled {
            let state = DeliveryState::Unencrypted;
            return match self.transport.send_plain(&self.target.room_id, &content).await {
                Ok(()) => {
                    transition(state, DeliveryState::Delivered);
                    Ok(())
                }
                Err(e) => {
                    transition(state, DeliveryState::Failed);
                    Err(DeliveryError::Send(e))
                }
            };
        }

        self.deliver_encrypted(&content).await
    }

    async fn deliver_encrypted(&self, content: &MessageContent) -> Result<(), DeliveryError> {
        let room = &self.target.room_id;
        let mut session = self.session.lock().await;

        let state = match session.as_ref() {
            Some(s) if s.valid => DeliveryState::EncryptedHaveSession,
            _ => DeliveryState::EncryptedNoSession,
        };

        let envelope = if session.as_ref().is_some_and(|s| !s.valid) {
            // A previous rotation failed; never encrypt with that session.
            let state = transition(state, DeliveryState::EncryptedRotating);
            self.rotate_and_encrypt(&mut session, content)
                .await
                .inspect_err(|_| {
                    transition(state, DeliveryState::Failed);
                })?
        } else {
            match self.transport.encrypt_for_room(room, content).await {
                Ok(envelope) => envelope,
                Err(e) if e.requires_rotation() => {
                    log::info!("Group session for {room} unusable ({e}), rotating");
                    let state = transition(state, DeliveryState::EncryptedRotating);
                    self.rotate_and_encrypt(&mut session, content)
                        .await
                        .inspect_err(|_| {
                            transition(state, DeliveryState::Failed);
                        })?
                }
                Err(e) => {
                    transition(state, DeliveryState::Failed);
                    return Err(DeliveryError::Encrypt(e));
                }
            }
        };

        *session = Some(EncryptionSession {
            room_id: room.clone(),
            valid: true,
        });

        match self.transport.send_encrypted(room, &envelope).await {
            Ok(()) => {
                transition(DeliveryState::EncryptedHaveSession, DeliveryState::Delivered);
                Ok(())
            }
            Err(e) => {
                transition(DeliveryState::EncryptedHaveSession, DeliveryState::Failed);
                Err(DeliveryError::Send(e))
            }
        }
    }

    /// Share a fresh session with the current members and encrypt once more.
    /// The session stays marked invalid unless both steps succeed.
    async fn rotate_and_encrypt(
        &self,
        session: &mut Option<EncryptionSession>,
        content: &MessageContent,
    ) -> Result<EncryptedEnvelope, DeliveryError> {
        let room = &self.target.room_id;
        *session = Some(EncryptionSession {
            room_id: room.clone(),
            valid: false,
        });

        let members = self
            .transport
            .list_room_members(room)
            .await
            .map_err(DeliveryError::ListMembers)?;
        log::debug!("Rotating group session for {room} with {} member(s)", members.len());

        self.transport
            .share_group_session(room, &members)
            .await
            .map_err(DeliveryError::ShareSession)?;

        self.transport
            .encrypt_for_room(room, content)
            .await
            .map_err(DeliveryError::EncryptAfterRotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use crate::transport::{MediaReference, UserId};

    /// Scripted transport: encrypt results are popped in order, `Ok` once
    /// the script runs out.
    #[derive(Default)]
    struct Scripted {
        encrypt_results: StdMutex<VecDeque<Result<(), EncryptError>>>,
        fail_members: bool,
        fail_send: bool,
        yield_on_encrypt: bool,
        calls: StdMutex<Vec<&'static str>>,
    }

    impl Scripted {
        fn with_encrypt(results: Vec<Result<(), EncryptError>>) -> Self {
            Self {
                encrypt_results: StdMutex::new(results.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn envelope() -> EncryptedEnvelope {
        EncryptedEnvelope {
            algorithm: "m.megolm.v1.aes-sha2".into(),
            sender_key: "key".into(),
            ciphertext: "ct".into(),
            session_id: "sid".into(),
            device_id: "DEV".into(),
        }
    }

    #[async_trait]
    impl ChatTransport for Scripted {
        async fn send_plain(&self, _: &RoomId, _: &MessageContent) -> Result<(), TransportError> {
            self.record("send_plain");
            if self.fail_send {
                return Err(TransportError::Request("down".into()));
            }
            Ok(())
        }

        async fn encrypt_for_room(
            &self,
            _: &RoomId,
            _: &MessageContent,
        ) -> Result<EncryptedEnvelope, EncryptError> {
            self.record("encrypt");
            let next = self.encrypt_results.lock().unwrap().pop_front();
            if self.yield_on_encrypt {
                tokio::task::yield_now().await;
            }
            next.unwrap_or(Ok(())).map(|()| envelope())
        }

        async fn share_group_session(&self, _: &RoomId, _: &[UserId]) -> Result<(), TransportError> {
            self.record("share");
            Ok(())
        }

        async fn send_encrypted(
            &self,
            _: &RoomId,
            _: &EncryptedEnvelope,
        ) -> Result<(), TransportError> {
            self.record("send_encrypted");
            if self.fail_send {
                return Err(TransportError::Status {
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(())
        }

        async fn list_room_members(&self, _: &RoomId) -> Result<Vec<UserId>, TransportError> {
            self.record("members");
            if self.fail_members {
                return Err(TransportError::Request("members unavailable".into()));
            }
            Ok(vec![UserId::from("@a:example.com")])
        }

        async fn upload_media(&self, _: Bytes, _: &str, _: u64) -> Result<MediaReference, TransportError> {
            unreachable!("delivery never uploads")
        }
    }

    fn machine(transport: Arc<Scripted>, encrypted: bool) -> DeliveryStateMachine {
        DeliveryStateMachine::new(
            transport,
            RelayTarget {
                room_id: RoomId::from("!room:example.com"),
                encryption_enabled: encrypted,
            },
        )
    }

    #[tokio::test]
    async fn test_plaintext_delivery() {
        let transport = Arc::new(Scripted::default());
        machine(Arc::clone(&transport), false).deliver("hi").await.unwrap();
        assert_eq!(transport.calls(), vec!["send_plain"]);
    }

    #[tokio::test]
    async fn test_plaintext_send_failure_is_fatal() {
        let transport = Arc::new(Scripted {
            fail_send: true,
            ..Scripted::default()
        });
        let err = machine(transport, false).deliver("hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Send(_)));
    }

    #[tokio::test]
    async fn test_encrypted_happy_path() {
        let transport = Arc::new(Scripted::default());
        let sm = machine(Arc::clone(&transport), true);
        sm.deliver("hi").await.unwrap();
        assert_eq!(transport.calls(), vec!["encrypt", "send_encrypted"]);
        assert_eq!(sm.session().await.map(|s| s.valid), Some(true));
    }

    #[tokio::test]
    async fn test_each_rotation_error_rotates_once() {
        for err in [
            EncryptError::SessionExpired,
            EncryptError::SessionNotShared,
            EncryptError::NoGroupSession,
        ] {
            let transport = Arc::new(Scripted::with_encrypt(vec![Err(err)]));
            machine(Arc::clone(&transport), true).deliver("hi").await.unwrap();
            assert_eq!(
                transport.calls(),
                vec!["encrypt", "members", "share", "encrypt", "send_encrypted"]
            );
        }
    }

    #[tokio::test]
    async fn test_other_encrypt_error_is_fatal_without_rotation() {
        let transport = Arc::new(Scripted::with_encrypt(vec![Err(EncryptError::Other("boom".into()))]));
        let err = machine(Arc::clone(&transport), true).deliver("hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Encrypt(_)));
        assert_eq!(transport.calls(), vec!["encrypt"]);
    }

    #[tokio::test]
    async fn test_second_failure_after_rotation_is_fatal() {
        let transport = Arc::new(Scripted::with_encrypt(vec![
            Err(EncryptError::SessionExpired),
            Err(EncryptError::SessionExpired),
        ]));
        let sm = machine(Arc::clone(&transport), true);
        let err = sm.deliver("hi").await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::EncryptAfterRotation(EncryptError::SessionExpired)
        ));
        assert_eq!(transport.calls(), vec!["encrypt", "members", "share", "encrypt"]);
        assert_eq!(sm.session().await.map(|s| s.valid), Some(false));
    }

    #[tokio::test]
    async fn test_member_listing_failure_is_fatal() {
        let transport = Arc::new(Scripted {
            encrypt_results: StdMutex::new(vec![Err(EncryptError::NoGroupSession)].into()),
            fail_members: true,
            ..Scripted::default()
        });
        let err = machine(Arc::clone(&transport), true).deliver("hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::ListMembers(_)));
        assert_eq!(transport.calls(), vec!["encrypt", "members"]);
    }

    #[tokio::test]
    async fn test_invalid_session_is_rotated_before_encrypting() {
        let transport = Arc::new(Scripted::with_encrypt(vec![
            Err(EncryptError::SessionExpired),
            Err(EncryptError::SessionExpired),
        ]));
        let sm = machine(Arc::clone(&transport), true);
        assert!(sm.deliver("first").await.is_err());

        sm.deliver("second").await.unwrap();
        assert_eq!(
            transport.calls()[4..],
            ["members", "share", "encrypt", "send_encrypted"]
        );
        assert_eq!(sm.session().await.map(|s| s.valid), Some(true));
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_do_not_interleave() {
        let transport = Arc::new(Scripted {
            encrypt_results: StdMutex::new(vec![Err(EncryptError::SessionExpired)].into()),
            yield_on_encrypt: true,
            ..Scripted::default()
        });
        let sm = machine(Arc::clone(&transport), true);

        let (first, second) = tokio::join!(sm.deliver("first"), sm.deliver("second"));
        first.unwrap();
        second.unwrap();

        assert_eq!(transport.calls().iter().filter(|c| **c == "share").count(), 1);
        assert_eq!(
            transport.calls(),
            vec![
                "encrypt",
                "members",
                "share",
                "encrypt",
                "send_encrypted",
                "encrypt",
                "send_encrypted",
            ]
        );
    }

    #[tokio::test]
    async fn test_encrypted_send_failure_is_fatal() {
        let transport = Arc::new(Scripted {
            fail_send: true,
            ..Scripted::default()
        });
        let err = machine(transport, true).deliver("hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Send(_)));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(DeliveryState::EncryptedRotating.to_string(), "encrypted-rotating");
    }
}
