//! The client side of the broker protocol
//!
//! Used by the CLI and the tests; a browser extension speaks the same JSON.

use kw_core::{KwError, KwResult};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::channel::{self, Direction, KeyPair, SharedKey, NONCE_SIZE};
use crate::protocol::{self, Action, AssociationInfo, Request, Response, Timed};

/// An `associate` request in flight.
pub struct PendingAssociation {
    client_id: String,
    pair: KeyPair,
}

impl PendingAssociation {
    pub fn new(client_id: impl Into<String>) -> (Self, Request) {
        let client_id = client_id.into();
        let pair = KeyPair::generate();
        let request = Request {
            action: Action::Associate,
            client_id: client_id.clone(),
            nonce: protocol::encode(&random_nonce()),
            message: None,
            public_key: Some(protocol::encode(&pair.public_bytes())),
        };
        (Self { client_id, pair }, request)
    }

    /// Complete the handshake from the broker's answer.
    pub fn finish(self, response: &Response) -> KwResult<(BrokerClient, AssociationInfo)> {
        ensure_success(response)?;
        let broker_pk = response.public_key_bytes()?;
        let key = self.pair.agree(&broker_pk, true)?;
        let client = BrokerClient {
            client_id: self.client_id,
            key,
        };
        let info = client.open(response)?;
        Ok((client, info))
    }
}

/// An associated client holding the shared channel key.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    client_id: String,
    key: SharedKey,
}

impl BrokerClient {
    pub fn new(client_id: impl Into<String>, key: SharedKey) -> Self {
        Self {
            client_id: client_id.into(),
            key,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn key(&self) -> &SharedKey {
        &self.key
    }

    /// Seal `body` stamped with the current time.
    pub fn request<T: Serialize>(&self, action: Action, body: T) -> KwResult<Request> {
        self.request_at(action, body, kw_core::time::now().timestamp())
    }

    pub fn request_at<T: Serialize>(
        &self,
        action: Action,
        body: T,
        timestamp: i64,
    ) -> KwResult<Request> {
        let json = Zeroizing::new(serde_json::to_vec(&Timed { timestamp, body })?);
        let (nonce, message) = channel::seal(&self.key, Direction::Request, &self.client_id, &json)?;
        Ok(Request {
            action,
            client_id: self.client_id.clone(),
            nonce: protocol::encode(&nonce),
            message: Some(protocol::encode(&message)),
            public_key: None,
        })
    }

    /// Decrypt and decode a successful response.
    pub fn open<R: DeserializeOwned>(&self, response: &Response) -> KwResult<R> {
        ensure_success(response)?;
        let plaintext = channel::open(
            &self.key,
            Direction::Response,
            &self.client_id,
            &response.nonce_bytes()?,
            &response.message_bytes()?,
        )?;
        let timed: Timed<R> = serde_json::from_slice(&plaintext)?;
        Ok(timed.body)
    }
}

fn ensure_success(response: &Response) -> KwResult<()> {
    if response.success {
        return Ok(());
    }
    let reason = response.error.as_deref().unwrap_or("request failed");
    Err(KwError::AccessDenied(reason.to_string()))
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
