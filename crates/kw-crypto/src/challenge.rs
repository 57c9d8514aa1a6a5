//! Challenge-response key component (hardware token slot)

use hmac::{Hmac, Mac};
use kw_core::{KwError, KwResult};
use sha1::Sha1;
use zeroize::Zeroize;

/// A token that answers a challenge with a deterministic response.
///
/// Implementations return `KeyDerivationUnavailable` when the token is absent.
pub trait ChallengeResponse: Send + Sync {
    /// Human-readable name used in logs and prompts.
    fn name(&self) -> &str;

    fn challenge(&self, challenge: &[u8]) -> KwResult<Vec<u8>>;
}

/// Software equivalent of an HMAC-SHA1 token slot.
pub struct HmacSha1Responder {
    secret: Vec<u8>,
}

impl HmacSha1Responder {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

impl Drop for HmacSha1Responder {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl ChallengeResponse for HmacSha1Responder {
    fn name(&self) -> &str {
        "hmac-sha1"
    }

    fn challenge(&self, challenge: &[u8]) -> KwResult<Vec<u8>> {
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&self.secret)
            .map_err(|e| KwError::KeyDerivation(format!("invalid token secret: {e}")))?;
        mac.update(challenge);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// A token slot with nothing plugged in.
pub struct AbsentToken;

impl ChallengeResponse for AbsentToken {
    fn name(&self) -> &str {
        "absent"
    }

    fn challenge(&self, _challenge: &[u8]) -> KwResult<Vec<u8>> {
        Err(KwError::KeyDerivationUnavailable(
            "challenge-response token not present".into(),
        ))
    }
}
