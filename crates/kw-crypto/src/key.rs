//! Composite key material and the container key schedule

use hkdf::Hkdf;
use kw_core::{KwError, KwResult};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::challenge::ChallengeResponse;
use crate::kdf::KdfParams;
use crate::keyfile::parse_key_file;
use crate::KEY_SIZE;

const BLOCK_HMAC_INFO: &[u8] = b"keyward-block-hmac";

/// Output of the KDF. Zeroized on drop.
#[derive(Clone)]
pub struct TransformedKey {
    bytes: [u8; KEY_SIZE],
}

impl TransformedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for TransformedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for TransformedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Ordered combination of password, key file and challenge-response provider.
///
/// Password and key file are reduced to their 32-byte component values on
/// construction; the plaintext password is never retained.
#[derive(Clone, Default)]
pub struct CompositeKey {
    password: Option<[u8; KEY_SIZE]>,
    key_file: Option<[u8; KEY_SIZE]>,
    challenge: Option<Arc<dyn ChallengeResponse>>,
    allow_empty: bool,
}

impl CompositeKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(mut self, password: &SecretString) -> Self {
        self.password = Some(Sha256::digest(password.expose_secret().as_bytes()).into());
        self
    }

    pub fn with_key_file_bytes(mut self, data: &[u8]) -> KwResult<Self> {
        self.key_file = Some(parse_key_file(data)?);
        Ok(self)
    }

    pub fn with_key_file(self, path: &Path) -> KwResult<Self> {
        let data = Zeroizing::new(std::fs::read(path)?);
        self.with_key_file_bytes(&data)
    }

    pub fn with_challenge_response(mut self, provider: Arc<dyn ChallengeResponse>) -> Self {
        self.challenge = Some(provider);
        self
    }

    /// Confirm that deriving from no components at all is intended.
    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.key_file.is_none() && self.challenge.is_none()
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn has_key_file(&self) -> bool {
        self.key_file.is_some()
    }

    /// The master seed changes on every save, so a key with a
    /// challenge-response component must be re-derived for each save.
    pub fn has_challenge_response(&self) -> bool {
        self.challenge.is_some()
    }

    /// SHA-256 over the component values in the order password, key file,
    /// challenge-response. `challenge` is the container's master seed.
    pub fn hash(&self, challenge: &[u8]) -> KwResult<Zeroizing<[u8; KEY_SIZE]>> {
        if self.is_empty() && !self.allow_empty {
            return Err(KwError::EmptyPassword);
        }

        let mut hasher = Sha256::new();
        if let Some(pw) = &self.password {
            hasher.update(pw);
        }
        if let Some(kf) = &self.key_file {
            hasher.update(kf);
        }
        if let Some(provider) = &self.challenge {
            let response = Zeroizing::new(provider.challenge(challenge)?);
            debug!(provider = provider.name(), "challenge-response answered");
            let component: Zeroizing<[u8; KEY_SIZE]> =
                Zeroizing::new(Sha256::digest(&*response).into());
            hasher.update(*component);
        }
        Ok(Zeroizing::new(hasher.finalize().into()))
    }

    /// Composite key of the legacy format: the password hash, the key file
    /// value, or SHA-256 of both. Challenge-response is not supported there.
    pub fn legacy_hash(&self) -> KwResult<Zeroizing<[u8; KEY_SIZE]>> {
        if self.challenge.is_some() {
            return Err(KwError::UnsupportedFormat(
                "legacy databases do not support challenge-response keys".into(),
            ));
        }
        match (&self.password, &self.key_file) {
            (Some(pw), None) => Ok(Zeroizing::new(*pw)),
            (None, Some(kf)) => Ok(Zeroizing::new(*kf)),
            (Some(pw), Some(kf)) => {
                let mut hasher = Sha256::new();
                hasher.update(pw);
                hasher.update(kf);
                Ok(Zeroizing::new(hasher.finalize().into()))
            }
            (None, None) => Err(KwError::EmptyPassword),
        }
    }
}

impl Drop for CompositeKey {
    fn drop(&mut self) {
        if let Some(pw) = self.password.as_mut() {
            pw.zeroize();
        }
        if let Some(kf) = self.key_file.as_mut() {
            kf.zeroize();
        }
    }
}

impl std::fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeKey")
            .field("password", &self.password.map(|_| "[REDACTED]"))
            .field("key_file", &self.key_file.map(|_| "[REDACTED]"))
            .field(
                "challenge_response",
                &self.challenge.as_ref().map(|c| c.name().to_string()),
            )
            .finish()
    }
}

/// Derive the transformed key on the calling thread.
pub fn derive(
    composite: &CompositeKey,
    kdf: &KdfParams,
    challenge: &[u8],
) -> KwResult<TransformedKey> {
    derive_inner(composite, kdf, challenge, None)
}

/// Derive the transformed key on the blocking pool, abandoning the work when
/// `token` is cancelled. No key material survives a cancelled derivation.
pub async fn derive_cancellable(
    composite: CompositeKey,
    kdf: KdfParams,
    challenge: Vec<u8>,
    token: CancellationToken,
) -> KwResult<TransformedKey> {
    let worker_token = token.clone();
    let result = tokio::task::spawn_blocking(move || {
        derive_inner(&composite, &kdf, &challenge, Some(&worker_token))
    })
    .await
    .map_err(|e| KwError::KeyDerivation(format!("derivation task failed: {e}")))?;

    match result {
        // Argon2 cannot be interrupted; drop (and zeroize) a late result.
        Ok(_) if token.is_cancelled() => Err(KwError::Cancelled),
        other => other,
    }
}

fn derive_inner(
    composite: &CompositeKey,
    kdf: &KdfParams,
    challenge: &[u8],
    cancel: Option<&CancellationToken>,
) -> KwResult<TransformedKey> {
    let started = Instant::now();
    let hash = composite.hash(challenge)?;
    let key = kdf.transform(&hash, cancel)?;
    debug!(
        kdf = kdf.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "key derived"
    );
    Ok(key)
}

/// Per-container keys derived from the master seed and transformed key.
pub struct ContainerKeys {
    cipher_key: [u8; KEY_SIZE],
    hmac_base: [u8; KEY_SIZE],
}

impl ContainerKeys {
    pub fn derive(master_seed: &[u8], transformed: &TransformedKey) -> KwResult<Self> {
        let mut ikm = Zeroizing::new(Vec::with_capacity(master_seed.len() + KEY_SIZE));
        ikm.extend_from_slice(master_seed);
        ikm.extend_from_slice(transformed.as_bytes());

        let cipher_key: [u8; KEY_SIZE] = Sha256::digest(&*ikm).into();

        let hkdf = Hkdf::<Sha256>::new(None, &ikm);
        let mut hmac_base = [0u8; KEY_SIZE];
        hkdf.expand(BLOCK_HMAC_INFO, &mut hmac_base)
            .map_err(|e| KwError::KeyDerivation(format!("HKDF expand failed: {e}")))?;

        Ok(Self {
            cipher_key,
            hmac_base,
        })
    }

    pub fn cipher_key(&self) -> &[u8; KEY_SIZE] {
        &self.cipher_key
    }

    pub fn hmac_base(&self) -> &[u8; KEY_SIZE] {
        &self.hmac_base
    }
}

impl Drop for ContainerKeys {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.hmac_base.zeroize();
    }
}

impl std::fmt::Debug for ContainerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContainerKeys([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::HmacSha1Responder;

    fn fast_kdf() -> KdfParams {
        KdfParams::Aes {
            rounds: 10,
            seed: [4u8; 32],
        }
    }

    fn password(s: &str) -> CompositeKey {
        CompositeKey::new().with_password(&SecretString::from(s))
    }

    #[test]
    fn test_empty_requires_confirmation() {
        let err = derive(&CompositeKey::new(), &fast_kdf(), &[0u8; 32]).unwrap_err();
        assert!(matches!(err, KwError::EmptyPassword));

        let empty = CompositeKey::new().allow_empty();
        let key = derive(&empty, &fast_kdf(), &[0u8; 32]).unwrap();
        let expected = fast_kdf()
            .transform(&Sha256::digest(b"").into(), None)
            .unwrap();
        assert_eq!(key.as_bytes(), expected.as_bytes());
    }

    #[test]
    fn test_component_order_matters() {
        let kf = [9u8; 32];
        let both = password("pw").with_key_file_bytes(&kf).unwrap();
        let h1 = both.hash(&[]).unwrap();

        let mut manual = Sha256::new();
        manual.update(Sha256::digest(b"pw"));
        manual.update(kf);
        let expected: [u8; 32] = manual.finalize().into();
        assert_eq!(*h1, expected);
    }

    #[test]
    fn test_wrong_password_differs() {
        let a = derive(&password("a"), &fast_kdf(), &[]).unwrap();
        let b = derive(&password("b"), &fast_kdf(), &[]).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_challenge_response_uses_seed() {
        let responder = Arc::new(HmacSha1Responder::new(b"token secret".to_vec()));
        let key = password("pw").with_challenge_response(responder);
        let a = key.hash(&[1u8; 32]).unwrap();
        let b = key.hash(&[2u8; 32]).unwrap();
        assert_ne!(*a, *b, "different challenges must produce different keys");
    }

    #[test]
    fn test_legacy_hash_combinations() {
        let pw_only = password("pw").legacy_hash().unwrap();
        let expected: [u8; 32] = Sha256::digest(b"pw").into();
        assert_eq!(*pw_only, expected);

        let kf_only = CompositeKey::new()
            .with_key_file_bytes(&[7u8; 32])
            .unwrap()
            .legacy_hash()
            .unwrap();
        assert_eq!(*kf_only, [7u8; 32]);

        assert!(matches!(
            CompositeKey::new().legacy_hash(),
            Err(KwError::EmptyPassword)
        ));
    }

    #[test]
    fn test_container_keys_depend_on_seed() {
        let transformed = TransformedKey::from_bytes([1u8; 32]);
        let a = ContainerKeys::derive(&[1u8; 32], &transformed).unwrap();
        let b = ContainerKeys::derive(&[2u8; 32], &transformed).unwrap();
        assert_ne!(a.cipher_key(), b.cipher_key());
        assert_ne!(a.hmac_base(), b.hmac_base());
        assert_ne!(a.cipher_key(), a.hmac_base());
    }

    #[test]
    fn test_debug_redacted() {
        let key = password("hunter2");
        let rendered = format!("{key:?} {:?}", TransformedKey::from_bytes([0xAB; 32]));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("REDACTED"));
    }

    #[tokio::test]
    async fn test_derive_cancellable_completes() {
        let token = CancellationToken::new();
        let key = derive_cancellable(password("pw"), fast_kdf(), vec![0u8; 32], token)
            .await
            .unwrap();
        let direct = derive(&password("pw"), &fast_kdf(), &[0u8; 32]).unwrap();
        assert_eq!(key.as_bytes(), direct.as_bytes());
    }

    #[tokio::test]
    async fn test_derive_cancellable_cancelled() {
        let token = CancellationToken::new();
        let slow = KdfParams::Aes {
            rounds: u64::MAX,
            seed: [0u8; 32],
        };
        let task = tokio::spawn(derive_cancellable(
            password("pw"),
            slow,
            vec![0u8; 32],
            token.clone(),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(KwError::Cancelled)));
    }
}
