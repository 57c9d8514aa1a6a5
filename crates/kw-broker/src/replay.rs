//! Freshness and replay checks for sealed requests

use kw_core::{KwError, KwResult};
use std::collections::HashMap;
use tracing::warn;

/// Remembers request nonces per client for the freshness window.
#[derive(Debug)]
pub struct ReplayGuard {
    window_secs: i64,
    seen: HashMap<String, HashMap<Vec<u8>, i64>>,
}

impl ReplayGuard {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs: i64::try_from(window_secs).unwrap_or(i64::MAX),
            seen: HashMap::new(),
        }
    }

    /// Accept a request stamped `timestamp` carrying `nonce`, as of `now`.
    pub fn check(
        &mut self,
        client_id: &str,
        nonce: &[u8],
        timestamp: i64,
        now: i64,
    ) -> KwResult<()> {
        if now.abs_diff(timestamp) > self.window_secs.unsigned_abs() {
            warn!(client = %client_id, timestamp, now, "stale request");
            return Err(KwError::AccessDenied(
                "request timestamp outside the window".into(),
            ));
        }
        let window = self.window_secs;
        let seen = self.seen.entry(client_id.to_string()).or_default();
        // a nonce is kept while its request timestamp is still acceptable
        seen.retain(|_, stamped| now.abs_diff(*stamped) <= window.unsigned_abs());
        if seen.contains_key(nonce) {
            warn!(client = %client_id, "replayed nonce");
            return Err(KwError::AccessDenied("nonce already used".into()));
        }
        seen.insert(nonce.to_vec(), timestamp);
        Ok(())
    }

    pub fn forget(&mut self, client_id: &str) {
        self.seen.remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_rejected() {
        let mut guard = ReplayGuard::new(60);
        guard.check("a", b"n1", 1000, 1000).unwrap();
        assert!(matches!(
            guard.check("a", b"n1", 1000, 1001),
            Err(KwError::AccessDenied(_))
        ));
        // nonces are per client
        guard.check("b", b"n1", 1000, 1001).unwrap();
        guard.check("a", b"n2", 1000, 1001).unwrap();
    }

    #[test]
    fn test_stale_and_future_rejected() {
        let mut guard = ReplayGuard::new(60);
        tokio_test::assert_err!(guard.check("a", b"n", 900, 1000));
        tokio_test::assert_err!(guard.check("a", b"n", 1100, 1000));
        // rejected requests do not burn their nonce
        tokio_test::assert_ok!(guard.check("a", b"n", 950, 1000));
    }

    #[test]
    fn test_old_nonces_expire() {
        let mut guard = ReplayGuard::new(60);
        guard.check("a", b"n", 1000, 1000).unwrap();
        guard.check("a", b"m", 1100, 1100).unwrap();
        assert_eq!(guard.seen["a"].len(), 1);
    }

    #[test]
    fn test_future_stamped_nonce_outlives_clock() {
        let mut guard = ReplayGuard::new(60);
        tokio_test::assert_ok!(guard.check("a", b"n", 1060, 1000));
        // still fresh until 1120, so the nonce must still be remembered
        for now in [1001, 1061, 1100, 1120] {
            tokio_test::assert_err!(guard.check("a", b"n", 1060, now));
        }
        tokio_test::assert_err!(guard.check("a", b"n", 1060, 1121));
        tokio_test::assert_ok!(guard.check("a", b"m", 1121, 1121));
        assert_eq!(guard.seen["a"].len(), 1);
    }
}
