//! Per-client channel keys and message sealing
//!
//! ```text
//! shared = HKDF-SHA256(ikm = X25519(client, broker),
//!                      info = "keyward-broker-v1" || client_pk || broker_pk)
//! message = XChaCha20-Poly1305(shared, nonce, payload JSON,
//!                              aad = direction || client_id)
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use kw_core::{KwError, KwResult};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const PUBLIC_KEY_SIZE: usize = 32;

const INFO_PREFIX: &[u8] = b"keyward-broker-v1";

/// Which way a sealed message travels. Bound into the AAD so a response
/// cannot be replayed to the broker as a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn tag(self) -> &'static [u8] {
        match self {
            Direction::Request => b"req:",
            Direction::Response => b"resp:",
        }
    }

    fn aad(self, client_id: &str) -> Vec<u8> {
        [self.tag(), client_id.as_bytes()].concat()
    }
}

/// Symmetric key shared with one associated client. Zeroized on drop.
#[derive(Clone)]
pub struct SharedKey(Zeroizing<[u8; KEY_SIZE]>);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> KwResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| KwError::Format(format!("shared key must be {KEY_SIZE} bytes")))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SharedKey {}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey([REDACTED])")
    }
}

/// One side's ephemeral key pair for a single association.
pub struct KeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Consume the secret and derive the key shared with `peer`. `initiator`
    /// is true on the client side so both ends order the public keys alike.
    pub fn agree(self, peer: &[u8], initiator: bool) -> KwResult<SharedKey> {
        let peer = parse_public_key(peer)?;
        let ours = self.public;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(KwError::AccessDenied("degenerate public key".into()));
        }
        let (client, broker) = if initiator {
            (ours, peer)
        } else {
            (peer, ours)
        };
        derive_shared_key(shared.as_bytes(), client.as_bytes(), broker.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

fn parse_public_key(bytes: &[u8]) -> KwResult<PublicKey> {
    let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
        KwError::Format(format!("public key must be {PUBLIC_KEY_SIZE} bytes"))
    })?;
    Ok(PublicKey::from(bytes))
}

fn derive_shared_key(
    dh: &[u8; 32],
    client_pk: &[u8; PUBLIC_KEY_SIZE],
    broker_pk: &[u8; PUBLIC_KEY_SIZE],
) -> KwResult<SharedKey> {
    let mut info = Vec::with_capacity(INFO_PREFIX.len() + 2 * PUBLIC_KEY_SIZE);
    info.extend_from_slice(INFO_PREFIX);
    info.extend_from_slice(client_pk);
    info.extend_from_slice(broker_pk);

    let hkdf = Hkdf::<Sha256>::new(None, dh);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(&info, &mut okm[..])
        .map_err(|e| KwError::KeyDerivation(format!("HKDF expand failed: {e}")))?;
    Ok(SharedKey(okm))
}

/// Encrypt `plaintext` for the peer under a fresh random nonce.
pub fn seal(
    key: &SharedKey,
    direction: Direction,
    client_id: &str,
    plaintext: &[u8],
) -> KwResult<([u8; NONCE_SIZE], Vec<u8>)> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let aad = direction.aad(client_id);
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| KwError::Other(anyhow::anyhow!("message encryption failed: {e}")))?;
    Ok((nonce, ciphertext))
}

/// Decrypt a message from the peer. Any failure is a denial.
pub fn open(
    key: &SharedKey,
    direction: Direction,
    client_id: &str,
    nonce: &[u8],
    ciphertext: &[u8],
) -> KwResult<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_SIZE {
        return Err(KwError::AccessDenied(format!(
            "nonce must be {NONCE_SIZE} bytes"
        )));
    }
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let aad = direction.aad(client_id);
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| KwError::AccessDenied("message could not be decrypted".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SharedKey, SharedKey) {
        let client = KeyPair::generate();
        let broker = KeyPair::generate();
        let client_pk = client.public_bytes();
        let broker_pk = broker.public_bytes();
        (
            client.agree(&broker_pk, true).unwrap(),
            broker.agree(&client_pk, false).unwrap(),
        )
    }

    #[test]
    fn test_both_sides_agree() {
        let (a, b) = pair();
        assert_eq!(a, b);
        let (c, _) = pair();
        assert_ne!(a, c);
    }

    #[test]
    fn test_seal_open() {
        let (client, broker) = pair();
        let (nonce, ct) = seal(&client, Direction::Request, "firefox", b"{\"url\":\"x\"}").unwrap();
        let pt = open(&broker, Direction::Request, "firefox", &nonce, &ct).unwrap();
        assert_eq!(pt.as_slice(), b"{\"url\":\"x\"}");
    }

    #[test]
    fn test_open_rejects_other_client_and_tamper() {
        let (client, broker) = pair();
        let (nonce, mut ct) = seal(&client, Direction::Request, "firefox", b"payload").unwrap();
        assert!(matches!(
            open(&broker, Direction::Request, "chrome", &nonce, &ct),
            Err(KwError::AccessDenied(_))
        ));
        ct[0] ^= 1;
        assert!(open(&broker, Direction::Request, "firefox", &nonce, &ct).is_err());
        assert!(open(&broker, Direction::Request, "firefox", &nonce[..12], &ct).is_err());
    }

    #[test]
    fn test_response_cannot_pass_as_request() {
        let (client, broker) = pair();
        let (nonce, ct) = seal(&broker, Direction::Response, "firefox", b"logins").unwrap();
        assert!(matches!(
            open(&broker, Direction::Request, "firefox", &nonce, &ct),
            Err(KwError::AccessDenied(_))
        ));
        let pt = open(&client, Direction::Response, "firefox", &nonce, &ct).unwrap();
        assert_eq!(pt.as_slice(), b"logins");
    }

    #[test]
    fn test_rejects_bad_public_key() {
        let broker = KeyPair::generate();
        assert!(matches!(
            broker.agree(&[1u8; 16], false),
            Err(KwError::Format(_))
        ));
        // the all-zero point yields a non-contributory secret
        let broker = KeyPair::generate();
        assert!(matches!(
            broker.agree(&[0u8; 32], false),
            Err(KwError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_debug_is_redacted() {
        let (key, _) = pair();
        assert_eq!(format!("{key:?}"), "SharedKey([REDACTED])");
    }
}
