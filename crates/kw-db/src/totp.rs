//! TOTP (RFC 6238) codes computed on demand from entry attributes.
//!
//! Sources, in order: the `otp` attribute holding an `otpauth://totp/...`
//! URI, or the `TOTP Seed` / `TOTP Settings` (`"period;digits"`) pair.

use data_encoding::{BASE32, BASE32_NOPAD};
use hmac::{Hmac, Mac};
use kw_core::{KwError, KwResult};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use zeroize::Zeroize;

use crate::entry::Entry;

pub const OTP_ATTRIBUTE: &str = "otp";
pub const SEED_ATTRIBUTE: &str = "TOTP Seed";
pub const SETTINGS_ATTRIBUTE: &str = "TOTP Settings";

const DEFAULT_PERIOD: u32 = 30;
const DEFAULT_DIGITS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotpAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl std::str::FromStr for TotpAlgorithm {
    type Err = KwError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(TotpAlgorithm::Sha1),
            "SHA256" => Ok(TotpAlgorithm::Sha256),
            "SHA512" => Ok(TotpAlgorithm::Sha512),
            other => Err(invalid(format!("unsupported algorithm {other:?}"))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TotpSettings {
    secret: Vec<u8>,
    pub algorithm: TotpAlgorithm,
    pub digits: u32,
    pub period: u32,
}

impl std::fmt::Debug for TotpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotpSettings")
            .field("secret", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .field("digits", &self.digits)
            .field("period", &self.period)
            .finish()
    }
}

impl Drop for TotpSettings {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotpCode {
    pub code: String,
    pub seconds_remaining: u32,
}

fn invalid(msg: impl std::fmt::Display) -> KwError {
    KwError::Format(format!("invalid TOTP settings: {msg}"))
}

impl TotpSettings {
    pub fn new(secret: Vec<u8>, algorithm: TotpAlgorithm, digits: u32, period: u32) -> KwResult<Self> {
        if secret.is_empty() {
            return Err(invalid("empty secret"));
        }
        if !(6..=8).contains(&digits) {
            return Err(invalid(format!("{digits} digits (expected 6 to 8)")));
        }
        if period == 0 {
            return Err(invalid("period must be greater than 0"));
        }
        Ok(Self {
            secret,
            algorithm,
            digits,
            period,
        })
    }

    /// Settings stored on an entry, if it has any.
    pub fn from_entry(entry: &Entry) -> KwResult<Option<Self>> {
        let uri = entry.get(OTP_ATTRIBUTE);
        if !uri.trim().is_empty() {
            return Self::parse_uri(uri).map(Some);
        }
        let seed = entry.get(SEED_ATTRIBUTE);
        if !seed.trim().is_empty() {
            return Self::from_seed_pair(seed, entry.get(SETTINGS_ATTRIBUTE)).map(Some);
        }
        Ok(None)
    }

    /// Parse `otpauth://totp/label?secret=..&digits=..&period=..&algorithm=..`.
    pub fn parse_uri(uri: &str) -> KwResult<Self> {
        let (scheme, rest) = uri
            .trim()
            .split_once("://")
            .ok_or_else(|| invalid("URI must start with otpauth://"))?;
        if !scheme.eq_ignore_ascii_case("otpauth") {
            return Err(invalid("URI must start with otpauth://"));
        }
        let (kind, remainder) = rest
            .split_once('/')
            .ok_or_else(|| invalid("malformed otpauth URI"))?;
        if !kind.eq_ignore_ascii_case("totp") {
            return Err(invalid(format!("unsupported otpauth type {kind:?}")));
        }
        let query = remainder.split_once('?').map(|(_, q)| q).unwrap_or("");

        let mut secret = None;
        let mut algorithm = TotpAlgorithm::Sha1;
        let mut digits = DEFAULT_DIGITS;
        let mut period = DEFAULT_PERIOD;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode(value)?;
            match key.to_ascii_lowercase().as_str() {
                "secret" => secret = Some(decode_secret(&value)?),
                "algorithm" => algorithm = value.parse()?,
                "digits" => {
                    digits = value
                        .parse()
                        .map_err(|_| invalid(format!("digits {value:?}")))?
                }
                "period" => {
                    period = value
                        .parse()
                        .map_err(|_| invalid(format!("period {value:?}")))?
                }
                _ => {}
            }
        }
        let secret = secret.ok_or_else(|| invalid("URI has no secret"))?;
        Self::new(secret, algorithm, digits, period)
    }

    /// Legacy pair: base32 seed plus `"period;digits"`.
    pub fn from_seed_pair(seed: &str, settings: &str) -> KwResult<Self> {
        let secret = decode_secret(seed)?;
        let mut period = DEFAULT_PERIOD;
        let mut digits = DEFAULT_DIGITS;
        let settings = settings.trim();
        if !settings.is_empty() {
            let (p, d) = settings.split_once(';').unwrap_or((settings, ""));
            period = p
                .trim()
                .parse()
                .map_err(|_| invalid(format!("period {p:?}")))?;
            if !d.trim().is_empty() {
                digits = d
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("digits {d:?}")))?;
            }
        }
        Self::new(secret, TotpAlgorithm::Sha1, digits, period)
    }

    /// Code for a unix timestamp.
    pub fn code_at(&self, timestamp: i64) -> KwResult<String> {
        let counter = (timestamp.max(0) as u64) / u64::from(self.period);
        let counter_bytes = counter.to_be_bytes();
        let digest = match self.algorithm {
            TotpAlgorithm::Sha1 => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&self.secret)
                    .map_err(|e| invalid(e))?;
                mac.update(&counter_bytes);
                mac.finalize().into_bytes().to_vec()
            }
            TotpAlgorithm::Sha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.secret)
                    .map_err(|e| invalid(e))?;
                mac.update(&counter_bytes);
                mac.finalize().into_bytes().to_vec()
            }
            TotpAlgorithm::Sha512 => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(&self.secret)
                    .map_err(|e| invalid(e))?;
                mac.update(&counter_bytes);
                mac.finalize().into_bytes().to_vec()
            }
        };

        // Dynamic truncation (RFC 4226 section 5.3)
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = (u32::from(digest[offset] & 0x7f) << 24)
            | (u32::from(digest[offset + 1]) << 16)
            | (u32::from(digest[offset + 2]) << 8)
            | u32::from(digest[offset + 3]);
        let code = binary % 10u32.pow(self.digits);
        Ok(format!("{:0width$}", code, width = self.digits as usize))
    }

    pub fn seconds_remaining(&self, timestamp: i64) -> u32 {
        let elapsed = timestamp.rem_euclid(i64::from(self.period)) as u32;
        self.period - elapsed
    }

    pub fn generate(&self, timestamp: i64) -> KwResult<TotpCode> {
        Ok(TotpCode {
            code: self.code_at(timestamp)?,
            seconds_remaining: self.seconds_remaining(timestamp),
        })
    }
}

/// Current code for an entry, or `None` if it has no TOTP configured.
pub fn entry_totp(entry: &Entry, timestamp: i64) -> KwResult<Option<TotpCode>> {
    match TotpSettings::from_entry(entry)? {
        Some(settings) => settings.generate(timestamp).map(Some),
        None => Ok(None),
    }
}

fn decode_secret(secret: &str) -> KwResult<Vec<u8>> {
    let normalized = secret.trim().replace([' ', '-'], "").to_ascii_uppercase();
    let decoded = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .or_else(|_| BASE32.decode(normalized.as_bytes()))
        .map_err(|_| invalid("secret is not valid base32"))?;
    if decoded.is_empty() {
        return Err(invalid("empty secret"));
    }
    Ok(decoded)
}

fn percent_decode(input: &str) -> KwResult<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| invalid("bad percent encoding"))?;
                out.push(hex);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| invalid("URI is not UTF-8"))
}
