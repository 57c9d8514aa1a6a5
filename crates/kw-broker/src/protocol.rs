//! Wire messages exchanged over the broker socket
//!
//! Every frame is one JSON object. `nonce`, `message` and `public_key` are
//! base64. `message` is the sealed JSON of the action payload; every payload
//! carries a unix `timestamp` checked against the replay window.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use kw_core::{KwError, KwResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Associate,
    TestAssociate,
    GetLogins,
    SetLogin,
    GetTotp,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Associate => "associate",
            Action::TestAssociate => "test-associate",
            Action::GetLogins => "get-logins",
            Action::SetLogin => "set-login",
            Action::GetTotp => "get-totp",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    pub client_id: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Request {
    pub fn nonce_bytes(&self) -> KwResult<Vec<u8>> {
        decode_field("nonce", &self.nonce)
    }

    pub fn message_bytes(&self) -> KwResult<Vec<u8>> {
        let message = self
            .message
            .as_deref()
            .ok_or_else(|| KwError::AccessDenied("request carries no message".into()))?;
        decode_field("message", message)
    }

    pub fn public_key_bytes(&self) -> KwResult<Vec<u8>> {
        let key = self
            .public_key
            .as_deref()
            .ok_or_else(|| KwError::AccessDenied("associate requires a public key".into()))?;
        decode_field("public_key", key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Absent only when the request could not be parsed at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A denial. Carries nothing but the reason.
    pub fn failure(action: Option<Action>, error: &KwError) -> Self {
        Self {
            action,
            success: false,
            nonce: None,
            message: None,
            public_key: None,
            error: Some(error.to_string()),
        }
    }

    pub fn sealed(action: Action, nonce: &[u8], message: &[u8]) -> Self {
        Self {
            action: Some(action),
            success: true,
            nonce: Some(B64.encode(nonce)),
            message: Some(B64.encode(message)),
            public_key: None,
            error: None,
        }
    }

    pub fn with_public_key(mut self, key: &[u8]) -> Self {
        self.public_key = Some(B64.encode(key));
        self
    }

    pub fn nonce_bytes(&self) -> KwResult<Vec<u8>> {
        decode_field("nonce", self.nonce.as_deref().unwrap_or_default())
    }

    pub fn message_bytes(&self) -> KwResult<Vec<u8>> {
        decode_field("message", self.message.as_deref().unwrap_or_default())
    }

    pub fn public_key_bytes(&self) -> KwResult<Vec<u8>> {
        decode_field("public_key", self.public_key.as_deref().unwrap_or_default())
    }
}

pub fn encode(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

fn decode_field(name: &str, value: &str) -> KwResult<Vec<u8>> {
    B64.decode(value)
        .map_err(|e| KwError::AccessDenied(format!("{name} is not valid base64: {e}")))
}

// ── Payloads (inside `message`) ─────────────────────────────────────────────

/// A payload stamped with the sender's clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timed<T> {
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Timed<T> {
    pub fn now(body: T) -> Self {
        Self {
            timestamp: kw_core::time::now().timestamp(),
            body,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Reply to `associate` and `test-associate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationInfo {
    pub client_id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLogins {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub uuid: Uuid,
    pub title: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logins {
    pub entries: Vec<Login>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLogin {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginStored {
    pub uuid: Uuid,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTotp {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totp {
    pub totp: String,
    pub seconds_remaining: u32,
}
