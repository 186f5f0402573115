//! Authentication against the session-verification service
//!
//! Online-mode logins are confirmed by an HTTPS GET to an external session
//! service, parameterized by username and the server digest. The call blocks
//! on the network, so the server runs it on its own short-lived task, never
//! on a connection's I/O task.
//!
//! The [`Authenticator`] trait is the seam: [`SessionService`] is the real
//! HTTP client, [`StaticAuthenticator`] a canned double for tests and tools.

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Default base URL of the session-verification endpoint.
pub const DEFAULT_SESSION_URL: &str =
    "https://sessionserver.mojang.com/session/minecraft/hasJoined";

/// A signed key/value pair attached to a verified profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProfileProperty {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub signature: Option<String>,
}

/// A player identity, either verified by the session service or derived
/// offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameProfile {
    pub uuid: Uuid,
    pub name: String,
    pub properties: Vec<ProfileProperty>,
}

/// Verifies that a username actually initiated this login against the
/// server digest computed during the encryption handshake.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, username: &str, server_digest: &str) -> Result<GameProfile>;
}

#[derive(Debug, Deserialize)]
struct HasJoinedResponse {
    id: String,
    name: String,
    #[serde(default)]
    properties: Vec<ProfileProperty>,
}

/// HTTP client for the session-verification service.
pub struct SessionService {
    base_url: String,
    client: reqwest::Client,
}

impl SessionService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Parses a service response body. Split out of the HTTP path so the
    /// JSON contract is testable without a network.
    fn parse_profile(username: &str, body: &str) -> Result<GameProfile> {
        if body.trim().is_empty() {
            return Err(ProtocolError::NotJoined);
        }
        let response: HasJoinedResponse =
            serde_json::from_str(body).map_err(|e| ProtocolError::AuthMalformed(e.to_string()))?;
        // the id is an undashed hex uuid
        let uuid = Uuid::try_parse(&response.id)
            .map_err(|_| ProtocolError::AuthMalformed(format!("bad uuid `{}`", response.id)))?;
        if response.name != username {
            return Err(ProtocolError::AuthWrongProfile(response.name));
        }
        Ok(GameProfile {
            uuid,
            name: response.name,
            properties: response.properties,
        })
    }
}

impl Default for SessionService {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_URL)
    }
}

#[async_trait]
impl Authenticator for SessionService {
    async fn verify(&self, username: &str, server_digest: &str) -> Result<GameProfile> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("username", username), ("serverId", server_digest)])
            .send()
            .await
            .map_err(|e| ProtocolError::AuthTransport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Err(ProtocolError::NotJoined);
        }
        if !status.is_success() {
            return Err(ProtocolError::AuthStatus(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ProtocolError::AuthTransport(e.to_string()))?;
        Self::parse_profile(username, &body)
    }
}

/// Canned authenticator: answers every verification with a fixed profile, or
/// with a not-joined failure when no profile is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    profile: Option<GameProfile>,
}

impl StaticAuthenticator {
    pub fn accepting(profile: GameProfile) -> Self {
        Self {
            profile: Some(profile),
        }
    }

    pub fn rejecting() -> Self {
        Self { profile: None }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify(&self, _username: &str, _server_digest: &str) -> Result<GameProfile> {
        self.profile.clone().ok_or(ProtocolError::NotJoined)
    }
}

/// Derives the stable offline-mode UUID for a username: an MD5 name-based
/// (version 3, RFC variant) UUID of the fixed string `OfflinePlayer:<name>`.
pub fn offline_uuid(username: &str) -> Uuid {
    let mut hasher = Md5::new();
    hasher.update(format!("OfflinePlayer:{username}").as_bytes());
    let mut bytes: [u8; 16] = hasher.finalize().into();
    bytes[6] = (bytes[6] & 0x0f) | 0x30;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

/// The identity used when online verification is disabled.
pub fn offline_profile(username: &str) -> GameProfile {
    GameProfile {
        uuid: offline_uuid(username),
        name: username.to_owned(),
        properties: Vec::new(),
    }
}
