//! Matrix Client-Server API client.
//!
//! Thin typed wrapper over the handful of endpoints the relay uses. Every
//! method maps a non-success response to [`TransportError::Status`] with the
//! server's body attached, so `M_FORBIDDEN` and friends show up in logs.

use std::collections::BTreeMap;

use anyhow::Context;
use bytes::Bytes;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MediaReference, RoomId, TransportError, UserId};
use crate::constants;

/// Credentials returned by a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    /// Fully-qualified user id.
    pub user_id: UserId,
    /// Access token for subsequent requests.
    pub access_token: String,
    /// Device the session belongs to.
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    user_id: UserId,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinedMembersResponse {
    joined: BTreeMap<UserId, Value>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

#[derive(Debug, Deserialize)]
struct SendEventResponse {
    event_id: String,
}

/// `POST /keys/upload` response.
#[derive(Debug, Deserialize)]
pub struct KeysUploadResponse {
    /// Remaining one-time keys per algorithm.
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// `POST /keys/query` response: `user -> device -> device keys object`.
#[derive(Debug, Default, Deserialize)]
pub struct KeysQueryResponse {
    /// Device keys per user and device.
    #[serde(default)]
    pub device_keys: BTreeMap<String, BTreeMap<String, Value>>,
}

/// `POST /keys/claim` response: `user -> device -> {"algorithm:id": key}`.
#[derive(Debug, Default, Deserialize)]
pub struct KeysClaimResponse {
    /// Claimed one-time keys.
    #[serde(default)]
    pub one_time_keys: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
}

#[derive(Serialize)]
struct LoginIdentifier<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    user: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    identifier: LoginIdentifier<'a>,
    password: &'a str,
    device_id: &'a str,
    initial_device_display_name: &'a str,
}

/// Authenticated Matrix client.
#[derive(Debug, Clone)]
pub struct MatrixClient {
    client: Client,
    homeserver: Url,
    access_token: String,
    user_id: UserId,
    device_id: String,
}

impl MatrixClient {
    /// Log in with a password and return an authenticated client.
    ///
    /// `device_id` is reused so the crypto identity stays stable across runs.
    pub async fn login_password(
        homeserver: &str,
        username: &str,
        password: &str,
        device_id: &str,
    ) -> anyhow::Result<Self> {
        let client = build_http_client()?;
        let homeserver = parse_homeserver(homeserver)?;

        let request = LoginRequest {
            kind: "m.login.password",
            identifier: LoginIdentifier {
                kind: "m.id.user",
                user: username,
            },
            password,
            device_id,
            initial_device_display_name: constants::DEVICE_DISPLAY_NAME,
        };

        let response = client
            .post(endpoint(&homeserver, &["_matrix", "client", "v3", "login"])?)
            .json(&request)
            .send()
            .await
            .context("Login request failed")?;
        let login: LoginResponse = parse_json(response).await.context("Login failed")?;

        log::info!(
            "Logged in to {} as {} (device {})",
            homeserver,
            login.user_id,
            login.device_id
        );

        Ok(Self {
            client,
            homeserver,
            access_token: login.access_token,
            user_id: login.user_id,
            device_id: login.device_id,
        })
    }

    /// Use a pre-issued access token; the user id is looked up via `whoami`.
    pub async fn with_access_token(
        homeserver: &str,
        access_token: &str,
        device_id: &str,
    ) -> anyhow::Result<Self> {
        let client = build_http_client()?;
        let homeserver = parse_homeserver(homeserver)?;

        let response = client
            .get(endpoint(&homeserver, &["_matrix", "client", "v3", "account", "whoami"])?)
            .bearer_auth(access_token)
            .send()
            .await
            .context("whoami request failed")?;
        let whoami: WhoAmIResponse = parse_json(response)
            .await
            .context("Access token rejected")?;

        let device_id = whoami.device_id.unwrap_or_else(|| device_id.to_string());
        log::info!("Authenticated to {} as {} (device {})", homeserver, whoami.user_id, device_id);

        Ok(Self {
            client,
            homeserver,
            access_token: access_token.to_string(),
            user_id: whoami.user_id,
            device_id,
        })
    }

    /// Build a client from known credentials without contacting the server.
    pub fn from_parts(
        client: Client,
        homeserver: Url,
        access_token: &str,
        user_id: UserId,
        device_id: &str,
    ) -> Self {
        Self {
            client,
            homeserver,
            access_token: access_token.to_string(),
            user_id,
            device_id: device_id.to_string(),
        }
    }

    /// Our user id.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Our device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn api(&self, segments: &[&str]) -> Result<Url, TransportError> {
        endpoint(&self.homeserver, segments)
    }

    /// Send a room event, returning its event id.
    pub async fn send_event<T: Serialize + ?Sized>(
        &self,
        room: &RoomId,
        event_type: &str,
        content: &T,
    ) -> Result<String, TransportError> {
        let txn_id = new_txn_id();
        let url = self.api(&[
            "_matrix",
            "client",
            "v3",
            "rooms",
            room.as_ref(),
            "send",
            event_type,
            &txn_id,
        ])?;

        let response = self
            .client
            .put(url)
            .bearer_auth(&self.access_token)
            .json(content)
            .send()
            .await?;
        let sent: SendEventResponse = parse_json(response).await?;

        log::debug!("Sent {} to {} as {}", event_type, room, sent.event_id);
        Ok(sent.event_id)
    }

    /// Joined members of a room.
    pub async fn joined_members(&self, room: &RoomId) -> Result<Vec<UserId>, TransportError> {
        let url = self.api(&["_matrix", "client", "v3", "rooms", room.as_ref(), "joined_members"])?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let members: JoinedMembersResponse = parse_json(response).await?;

        Ok(members.joined.into_keys().collect())
    }

    /// Upload media, returning its `mxc://` URI.
    pub async fn upload(
        &self,
        data: Bytes,
        content_type: &str,
        content_length: u64,
    ) -> Result<MediaReference, TransportError> {
        let url = self.api(&["_matrix", "media", "v3", "upload"])?;

        // Content-Length comes from the body itself.
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;
        let uploaded: UploadResponse = parse_json(response).await?;

        log::debug!(
            "Uploaded {} bytes of {} as {}",
            content_length,
            content_type,
            uploaded.content_uri
        );
        Ok(MediaReference(uploaded.content_uri))
    }

    /// Publish device keys and/or one-time keys.
    pub async fn upload_keys(&self, body: &Value) -> Result<KeysUploadResponse, TransportError> {
        let url = self.api(&["_matrix", "client", "v3", "keys", "upload"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        parse_json(response).await
    }

    /// Fetch device keys of the given users.
    pub async fn query_keys(&self, users: &[UserId]) -> Result<KeysQueryResponse, TransportError> {
        let device_keys: BTreeMap<&str, Vec<String>> =
            users.iter().map(|u| (u.as_ref(), Vec::new())).collect();
        let body = serde_json::json!({ "device_keys": device_keys });

        let url = self.api(&["_matrix", "client", "v3", "keys", "query"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        parse_json(response).await
    }

    /// Claim one `signed_curve25519` one-time key for each listed device.
    pub async fn claim_keys(
        &self,
        devices: &BTreeMap<String, Vec<String>>,
    ) -> Result<KeysClaimResponse, TransportError> {
        let one_time_keys: BTreeMap<&str, BTreeMap<&str, &str>> = devices
            .iter()
            .map(|(user, ids)| {
                let per_device = ids
                    .iter()
                    .map(|id| (id.as_str(), "signed_curve25519"))
                    .collect();
                (user.as_str(), per_device)
            })
            .collect();
        let body = serde_json::json!({ "one_time_keys": one_time_keys });

        let url = self.api(&["_matrix", "client", "v3", "keys", "claim"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        parse_json(response).await
    }

    /// Send to-device events: `messages[user][device] = content`.
    pub async fn send_to_device(
        &self,
        event_type: &str,
        messages: &BTreeMap<String, BTreeMap<String, Value>>,
    ) -> Result<(), TransportError> {
        let txn_id = new_txn_id();
        let url = self.api(&["_matrix", "client", "v3", "sendToDevice", event_type, &txn_id])?;
        let body = serde_json::json!({ "messages": messages });

        let response = self
            .client
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        let _: Value = parse_json(response).await?;
        Ok(())
    }
}

fn build_http_client() -> anyhow::Result<Client> {
    Client::builder()
        .timeout(constants::MATRIX_REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

fn new_txn_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn parse_homeserver(homeserver: &str) -> anyhow::Result<Url> {
    Url::parse(homeserver).with_context(|| format!("Invalid homeserver URL {homeserver}"))
}

/// Append path segments to the homeserver URL. Each segment is
/// percent-encoded on its own, so `/` inside an id cannot change the path.
fn endpoint(homeserver: &Url, segments: &[&str]) -> Result<Url, TransportError> {
    let mut url = homeserver.clone();
    url.path_segments_mut()
        .map_err(|()| TransportError::Request(format!("homeserver URL {homeserver} cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| TransportError::InvalidResponse(e.to_string()))
}
