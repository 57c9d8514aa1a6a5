//! Payload ciphers: AES-256-CBC (PKCS#7) and ChaCha20

use aes::Aes256;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use kw_core::{KwError, KwResult};
use uuid::{uuid, Uuid};

use crate::KEY_SIZE;

pub const AES256_UUID: Uuid = uuid!("31c1f2e6-bf71-4350-be58-05216afc5aff");
pub const CHACHA20_UUID: Uuid = uuid!("d6038a2b-8b6f-4cb5-a524-339a31dbb59a");

const AES_BLOCK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherId {
    Aes256Cbc,
    ChaCha20,
}

impl CipherId {
    pub fn from_uuid(id: Uuid) -> KwResult<Self> {
        match id {
            AES256_UUID => Ok(CipherId::Aes256Cbc),
            CHACHA20_UUID => Ok(CipherId::ChaCha20),
            other => Err(KwError::UnsupportedFormat(format!("cipher {other}"))),
        }
    }

    pub fn from_name(name: &str) -> KwResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aes256" | "aes" | "aes-256-cbc" => Ok(CipherId::Aes256Cbc),
            "chacha20" => Ok(CipherId::ChaCha20),
            other => Err(KwError::Config(format!(
                "unknown cipher {other:?} (expected aes256 or chacha20)"
            ))),
        }
    }

    pub fn uuid(self) -> Uuid {
        match self {
            CipherId::Aes256Cbc => AES256_UUID,
            CipherId::ChaCha20 => CHACHA20_UUID,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            CipherId::Aes256Cbc => 16,
            CipherId::ChaCha20 => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherId::Aes256Cbc => "aes256",
            CipherId::ChaCha20 => "chacha20",
        }
    }

    /// Encrypt, applying PKCS#7 padding for block modes.
    pub fn encrypt(self, key: &[u8; KEY_SIZE], iv: &[u8], plaintext: &[u8]) -> KwResult<Vec<u8>> {
        self.check_iv(iv)?;
        match self {
            CipherId::Aes256Cbc => Ok(cbc::Encryptor::<Aes256>::new(key.into(), iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
            CipherId::ChaCha20 => {
                let mut buf = plaintext.to_vec();
                ChaCha20::new(key.into(), iv.into()).apply_keystream(&mut buf);
                Ok(buf)
            }
        }
    }

    /// Decrypt without removing padding, so a caller can check a known
    /// plaintext prefix before trusting anything else.
    pub fn decrypt_raw(
        self,
        key: &[u8; KEY_SIZE],
        iv: &[u8],
        ciphertext: &[u8],
    ) -> KwResult<Vec<u8>> {
        self.check_iv(iv)?;
        match self {
            CipherId::Aes256Cbc => cbc::Decryptor::<Aes256>::new(key.into(), iv.into())
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|_| KwError::WrongKeyOrCorruptFile),
            CipherId::ChaCha20 => {
                let mut buf = ciphertext.to_vec();
                ChaCha20::new(key.into(), iv.into()).apply_keystream(&mut buf);
                Ok(buf)
            }
        }
    }

    /// Strip padding left by `decrypt_raw`.
    pub fn unpad(self, buf: &mut Vec<u8>) -> KwResult<()> {
        match self {
            CipherId::Aes256Cbc => pkcs7_unpad(buf),
            CipherId::ChaCha20 => Ok(()),
        }
    }

    fn check_iv(self, iv: &[u8]) -> KwResult<()> {
        if iv.len() != self.iv_len() {
            return Err(KwError::Format(format!(
                "{} needs a {}-byte IV, got {}",
                self.name(),
                self.iv_len(),
                iv.len()
            )));
        }
        Ok(())
    }
}

pub fn pkcs7_unpad(buf: &mut Vec<u8>) -> KwResult<()> {
    let invalid = || KwError::Integrity("invalid block padding".into());
    let pad = *buf.last().ok_or_else(invalid)? as usize;
    if pad == 0 || pad > AES_BLOCK || pad > buf.len() {
        return Err(invalid());
    }
    if !buf[buf.len() - pad..].iter().all(|&b| b as usize == pad) {
        return Err(invalid());
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x5a; 32];

    #[test]
    fn test_roundtrip_both_ciphers() {
        for cipher in [CipherId::Aes256Cbc, CipherId::ChaCha20] {
            let iv = vec![1u8; cipher.iv_len()];
            let ct = cipher.encrypt(&KEY, &iv, b"attack at dawn").unwrap();
            let mut pt = cipher.decrypt_raw(&KEY, &iv, &ct).unwrap();
            cipher.unpad(&mut pt).unwrap();
            assert_eq!(pt, b"attack at dawn");
        }
    }

    #[test]
    fn test_aes_pads_to_block() {
        let ct = CipherId::Aes256Cbc
            .encrypt(&KEY, &[0u8; 16], &[0u8; 16])
            .unwrap();
        assert_eq!(ct.len(), 32, "full block of padding appended");
    }

    #[test]
    fn test_aes_truncated_ciphertext() {
        let result = CipherId::Aes256Cbc.decrypt_raw(&KEY, &[0u8; 16], &[0u8; 17]);
        assert!(matches!(result, Err(KwError::WrongKeyOrCorruptFile)));
    }

    #[test]
    fn test_wrong_iv_length() {
        assert!(CipherId::ChaCha20.encrypt(&KEY, &[0u8; 16], b"x").is_err());
    }

    #[test]
    fn test_unknown_uuid() {
        assert!(matches!(
            CipherId::from_uuid(Uuid::nil()),
            Err(KwError::UnsupportedFormat(_))
        ));
        assert_eq!(
            CipherId::from_uuid(CHACHA20_UUID).unwrap(),
            CipherId::ChaCha20
        );
    }

    #[test]
    fn test_pkcs7_rejects_bad_padding() {
        let mut buf = vec![1, 2, 3, 0];
        assert!(pkcs7_unpad(&mut buf).is_err());
        let mut buf = vec![1, 2, 3, 2];
        assert!(pkcs7_unpad(&mut buf).is_err());
        let mut buf = vec![1, 2, 2, 2];
        pkcs7_unpad(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 2]);
    }
}
