//! End-to-end relay pipeline tests against an in-memory chat transport.
//!
//! Image hosts are served by wiremock; everything on the chat side is
//! recorded by `RecordingTransport`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gotify_matrix_relay::format::PARSE_FAILURE_PREFIX;
use gotify_matrix_relay::transport::{
    EncryptedEnvelope, MediaReference, MessageContent, RoomId, TransportError, UserId,
};
use gotify_matrix_relay::{
    ChatTransport, DeliveryError, EncryptError, Formatter, HostAllowlist, ImageRehoster,
    MessageTemplate, Relay, RelayTarget,
};
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    SendPlain(String),
    Encrypt,
    Share(usize),
    SendEncrypted,
    Members,
    Upload { content_type: String, len: u64 },
}

#[derive(Default)]
struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    encrypt_script: Mutex<VecDeque<EncryptError>>,
    fail_send: bool,
}

impl RecordingTransport {
    fn failing_encrypts(errors: Vec<EncryptError>) -> Self {
        Self {
            encrypt_script: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn plain_bodies(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SendPlain(body) => Some(body),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_plain(
        &self,
        _room: &RoomId,
        content: &MessageContent,
    ) -> Result<(), TransportError> {
        self.record(Call::SendPlain(content.body.clone()));
        if self.fail_send {
            return Err(TransportError::Status {
                status: 403,
                body: r#"{"errcode":"M_FORBIDDEN"}"#.into(),
            });
        }
        Ok(())
    }

    async fn encrypt_for_room(
        &self,
        _room: &RoomId,
        content: &MessageContent,
    ) -> Result<EncryptedEnvelope, EncryptError> {
        self.record(Call::Encrypt);
        if let Some(err) = self.encrypt_script.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(EncryptedEnvelope {
            algorithm: "m.megolm.v1.aes-sha2".into(),
            sender_key: "sender".into(),
            ciphertext: content.body.clone(),
            session_id: "session".into(),
            device_id: "DEVICE".into(),
        })
    }

    async fn share_group_session(
        &self,
        _room: &RoomId,
        members: &[UserId],
    ) -> Result<(), TransportError> {
        self.record(Call::Share(members.len()));
        Ok(())
    }

    async fn send_encrypted(
        &self,
        _room: &RoomId,
        _envelope: &EncryptedEnvelope,
    ) -> Result<(), TransportError> {
        self.record(Call::SendEncrypted);
        Ok(())
    }

    async fn list_room_members(&self, _room: &RoomId) -> Result<Vec<UserId>, TransportError> {
        self.record(Call::Members);
        Ok(vec![
            UserId::from("@relay:example.com"),
            UserId::from("@alice:example.com"),
        ])
    }

    async fn upload_media(
        &self,
        _data: Bytes,
        content_type: &str,
        content_length: u64,
    ) -> Result<MediaReference, TransportError> {
        let n = self.count(|c| matches!(c, Call::Upload { .. }));
        self.record(Call::Upload {
            content_type: content_type.to_string(),
            len: content_length,
        });
        Ok(MediaReference(format!("mxc://example.com/media{n}")))
    }
}

fn target(encrypted: bool) -> RelayTarget {
    RelayTarget {
        room_id: RoomId::from("!room:example.com"),
        encryption_enabled: encrypted,
    }
}

fn rehoster(patterns: &[&str]) -> ImageRehoster {
    ImageRehoster::new(
        HostAllowlist::compile(patterns).unwrap(),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn relay(transport: &Arc<RecordingTransport>, patterns: &[&str], encrypted: bool) -> Relay {
    let template = MessageTemplate::parse("### [TITLE]\n\n[MESSAGE]\n");
    Relay::new(
        Formatter::new(Some(template)),
        rehoster(patterns),
        Arc::clone(transport) as Arc<dyn ChatTransport>,
        target(encrypted),
    )
}

fn markdown_payload(body: &str) -> Vec<u8> {
    serde_json::json!({
        "title": "Chart",
        "message": body,
        "extras": {"client::display": {"contentType": "text/markdown"}}
    })
    .to_string()
    .into_bytes()
}

async fn image_server(content_type: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0x89, b'P', b'N', b'G'], content_type))
        .mount(&server)
        .await;
    server
}

// ============================================================================
// Formatting
// ============================================================================

#[tokio::test]
async fn test_template_scenario() {
    let transport = Arc::new(RecordingTransport::default());
    relay(&transport, &[], false)
        .handle_payload(br#"{"title":"Test Title","message":"Test Message"}"#)
        .await
        .unwrap();

    assert_eq!(transport.plain_bodies(), vec!["### Test Title\n\nTest Message\n"]);
}

#[tokio::test]
async fn test_malformed_payload_is_still_delivered() {
    let transport = Arc::new(RecordingTransport::default());
    relay(&transport, &[], false)
        .handle_payload(br#"{"title": "T""#)
        .await
        .unwrap();

    let bodies = transport.plain_bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0], format!("{PARSE_FAILURE_PREFIX}{{\"title\": \"T\""));
}

#[tokio::test]
async fn test_markdown_body_is_not_escaped() {
    let transport = Arc::new(RecordingTransport::default());
    relay(&transport, &[], false)
        .handle_payload(&markdown_payload("**bold** [TITLE]"))
        .await
        .unwrap();

    assert_eq!(transport.plain_bodies(), vec!["# Chart\n\n**bold** [TITLE]"]);
}

// ============================================================================
// Encrypted delivery
// ============================================================================

#[tokio::test]
async fn test_expired_session_rotates_once() {
    let transport = Arc::new(RecordingTransport::failing_encrypts(vec![
        EncryptError::SessionExpired,
    ]));
    relay(&transport, &[], true)
        .handle_payload(br#"{"title":"t","message":"m"}"#)
        .await
        .unwrap();

    assert_eq!(transport.count(|c| matches!(c, Call::Share(_))), 1);
    assert_eq!(transport.count(|c| *c == Call::Encrypt), 2);
    assert_eq!(transport.count(|c| *c == Call::SendEncrypted), 1);
    assert_eq!(
        transport.calls(),
        vec![
            Call::Encrypt,
            Call::Members,
            Call::Share(2),
            Call::Encrypt,
            Call::SendEncrypted
        ]
    );
}

#[tokio::test]
async fn test_failure_after_rotation_is_fatal() {
    let transport = Arc::new(RecordingTransport::failing_encrypts(vec![
        EncryptError::NoGroupSession,
        EncryptError::SessionNotShared,
    ]));
    let err = relay(&transport, &[], true)
        .handle_payload(br#"{"title":"t","message":"m"}"#)
        .await
        .unwrap_err();

    assert!(matches!(err, DeliveryError::EncryptAfterRotation(_)));
    assert_eq!(transport.count(|c| *c == Call::SendEncrypted), 0);
}

#[tokio::test]
async fn test_later_messages_reuse_the_rotated_session() {
    let transport = Arc::new(RecordingTransport::failing_encrypts(vec![
        EncryptError::NoGroupSession,
    ]));
    let relay = relay(&transport, &[], true);
    for _ in 0..3 {
        relay
            .handle_payload(br#"{"title":"t","message":"m"}"#)
            .await
            .unwrap();
    }

    assert_eq!(transport.count(|c| matches!(c, Call::Share(_))), 1);
    assert_eq!(transport.count(|c| *c == Call::SendEncrypted), 3);
    let session = relay.delivery().session().await.unwrap();
    assert!(session.valid);
    assert_eq!(session.room_id, RoomId::from("!room:example.com"));
}

// ============================================================================
// Image re-hosting
// ============================================================================

#[tokio::test]
async fn test_png_is_rehosted() {
    let server = image_server("image/png").await;
    let transport = Arc::new(RecordingTransport::default());
    let body = format!("look ![]({}/a.png) here", server.uri());

    relay(&transport, &[".*"], false)
        .handle_payload(&markdown_payload(&body))
        .await
        .unwrap();

    assert_eq!(
        transport.plain_bodies(),
        vec!["# Chart\n\nlook ![](mxc://example.com/media0) here"]
    );
    assert!(transport.calls().contains(&Call::Upload {
        content_type: "image/png".into(),
        len: 4
    }));
}

#[tokio::test]
async fn test_non_image_is_left_alone() {
    let server = image_server("text/plain").await;
    let transport = Arc::new(RecordingTransport::default());
    let content = format!("![]({}/a.png)", server.uri());

    let out = rehoster(&[".*"])
        .rehost(&content, transport.as_ref())
        .await;

    assert_eq!(out, content);
    assert_eq!(transport.count(|c| matches!(c, Call::Upload { .. })), 0);
}

#[tokio::test]
async fn test_fetch_errors_leave_token_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_raw(b"nope".to_vec(), "image/png"))
        .mount(&server)
        .await;
    let transport = Arc::new(RecordingTransport::default());
    let content = format!(
        "![]({}/missing.png) ![](http://127.0.0.1:1/unreachable.png) ![](http://[bad/x.png)",
        server.uri()
    );

    let out = rehoster(&[".*"])
        .rehost(&content, transport.as_ref())
        .await;

    assert_eq!(out, content);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_empty_allowlist_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![1], "image/png"))
        .expect(0)
        .mount(&server)
        .await;
    let transport = Arc::new(RecordingTransport::default());
    let content = format!("![]({}/a.png) and ![]({}/b.png)", server.uri(), server.uri());

    let out = rehoster(&[]).rehost(&content, transport.as_ref()).await;

    assert_eq!(out, content);
    assert!(transport.calls().is_empty());
    server.verify().await;
}

#[tokio::test]
async fn test_disallowed_host_is_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![1], "image/png"))
        .expect(0)
        .mount(&server)
        .await;
    let transport = Arc::new(RecordingTransport::default());
    let content = format!("before ![]({}/a.png) after", server.uri());

    let out = rehoster(&[r"^images\.example\.com$"])
        .rehost(&content, transport.as_ref())
        .await;

    assert_eq!(out, content);
    server.verify().await;
}

#[tokio::test]
async fn test_redirect_to_disallowed_host_is_not_followed() {
    let internal = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![1, 2, 3], "image/png"))
        .expect(0)
        .mount(&internal)
        .await;
    let internal_url = format!("http://localhost:{}/secret.png", internal.address().port());

    let allowed = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.png"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", internal_url.as_str()))
        .mount(&allowed)
        .await;

    let transport = Arc::new(RecordingTransport::default());
    let content = format!("![]({}/a.png)", allowed.uri());

    let out = rehoster(&[r"^127\.0\.0\.1$"])
        .rehost(&content, transport.as_ref())
        .await;

    assert_eq!(out, content);
    assert!(transport.calls().is_empty());
    internal.verify().await;
}

#[tokio::test]
async fn test_redirect_within_allowed_host_is_followed() {
    let server = image_server("image/png").await;
    Mock::given(method("GET"))
        .and(path("/old.png"))
        .respond_with(
            ResponseTemplate::new(301).insert_header("Location", format!("{}/a.png", server.uri()).as_str()),
        )
        .mount(&server)
        .await;
    let transport = Arc::new(RecordingTransport::default());
    let content = format!("![]({}/old.png)", server.uri());

    let out = rehoster(&[r"^127\.0\.0\.1$"])
        .rehost(&content, transport.as_ref())
        .await;

    assert_eq!(out, "![](mxc://example.com/media0)");
    assert_eq!(transport.count(|c| matches!(c, Call::Upload { .. })), 1);
}

#[tokio::test]
async fn test_rehost_without_tokens_is_stable() {
    let transport = Arc::new(RecordingTransport::default());
    let rehoster = rehoster(&[".*"]);
    let content = "# Title\n\nno ![alt](http://x/y.png) images, ![](ftp://x) here\n";

    let once = rehoster.rehost(content, transport.as_ref()).await;
    let twice = rehoster.rehost(&once, transport.as_ref()).await;

    assert_eq!(once, content);
    assert_eq!(twice, content);
}

#[tokio::test]
async fn test_every_token_is_replaced_and_text_preserved() {
    let server = image_server("image/png").await;
    let transport = Arc::new(RecordingTransport::default());
    let url = format!("{}/a.png", server.uri());
    let content = format!("α ![]({url})![]({url})\n- ![]({url}) ω");

    let out = rehoster(&["127\\.0\\.0\\.1"])
        .rehost(&content, transport.as_ref())
        .await;

    assert_eq!(
        out,
        "α ![](mxc://example.com/media0)![](mxc://example.com/media1)\n- ![](mxc://example.com/media2) ω"
    );
    assert_eq!(transport.count(|c| matches!(c, Call::Upload { .. })), 3);
}

// ============================================================================
// Orchestration
// ============================================================================

#[tokio::test]
async fn test_run_delivers_in_arrival_order() {
    let transport = Arc::new(RecordingTransport::default());
    let relay = relay(&transport, &[], false);
    let (tx, rx) = mpsc::channel(8);

    for i in 0..5 {
        tx.send(format!(r#"{{"title":"n{i}","message":"m{i}"}}"#).into_bytes())
            .await
            .unwrap();
    }
    drop(tx);

    relay.run(rx).await.unwrap();

    let expected: Vec<String> = (0..5).map(|i| format!("### n{i}\n\nm{i}\n")).collect();
    assert_eq!(transport.plain_bodies(), expected);
}

#[tokio::test]
async fn test_run_stops_on_fatal_send() {
    let transport = Arc::new(RecordingTransport {
        fail_send: true,
        ..RecordingTransport::default()
    });
    let relay = relay(&transport, &[], false);
    let (tx, rx) = mpsc::channel(8);
    tx.send(br#"{"title":"a","message":"1"}"#.to_vec()).await.unwrap();
    tx.send(br#"{"title":"b","message":"2"}"#.to_vec()).await.unwrap();

    let err = relay.run(rx).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Send(_)));
    assert_eq!(transport.plain_bodies().len(), 1);
}
