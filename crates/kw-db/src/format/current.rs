//! Current-generation container: read and write
//!
//! ```text
//! header | SHA-256(header) | HMAC-SHA256(header) | ciphertext
//! plaintext = stream-start (32) | HMAC block stream of the compressed JSON payload
//! ```

use kw_core::{KwError, KwResult};
use kw_crypto::blocks::{header_hmac, verify_header_hmac};
use kw_crypto::{read_blocks, write_blocks, ContainerKeys, TransformedKey, SEED_SIZE};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::header::ContainerHeader;
use super::payload::Payload;
use crate::tree::Tree;

const HASH_SIZE: usize = 32;

/// A container whose header has been parsed and hash-checked but whose
/// payload is still encrypted.
#[derive(Debug, Clone)]
pub struct RawContainer {
    header: ContainerHeader,
    header_bytes: Vec<u8>,
    header_mac: [u8; HASH_SIZE],
    ciphertext: Vec<u8>,
}

pub fn parse_container(data: &[u8]) -> KwResult<RawContainer> {
    let (header, header_len) = ContainerHeader::parse(data)?;
    let rest = &data[header_len..];
    if rest.len() < 2 * HASH_SIZE {
        return Err(KwError::Format("container truncated after header".into()));
    }
    let header_bytes = data[..header_len].to_vec();
    let digest = Sha256::digest(&header_bytes);
    if !bool::from(digest.as_slice().ct_eq(&rest[..HASH_SIZE])) {
        return Err(KwError::Integrity("header hash mismatch".into()));
    }
    let mut header_mac = [0u8; HASH_SIZE];
    header_mac.copy_from_slice(&rest[HASH_SIZE..2 * HASH_SIZE]);

    Ok(RawContainer {
        header,
        header_bytes,
        header_mac,
        ciphertext: rest[2 * HASH_SIZE..].to_vec(),
    })
}

impl RawContainer {
    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Decrypt and verify. Nothing downstream sees plaintext before the
    /// stream-start marker, header MAC and every block MAC have checked out.
    pub fn decrypt(&self, key: &TransformedKey) -> KwResult<Tree> {
        let header = &self.header;
        let keys = ContainerKeys::derive(&header.master_seed, key)?;

        // The marker fills the first whole cipher blocks, so it can be
        // checked before the rest of the payload is decrypted.
        if self.ciphertext.len() < SEED_SIZE {
            return Err(KwError::WrongKeyOrCorruptFile);
        }
        let marker = header.cipher.decrypt_raw(
            keys.cipher_key(),
            &header.iv,
            &self.ciphertext[..SEED_SIZE],
        )?;
        if !bool::from(marker.as_slice().ct_eq(&header.stream_start)) {
            return Err(KwError::WrongKeyOrCorruptFile);
        }

        let mut plaintext = header
            .cipher
            .decrypt_raw(keys.cipher_key(), &header.iv, &self.ciphertext)
            .map_err(|_| KwError::Integrity("ciphertext is not whole blocks".into()))?;
        header.cipher.unpad(&mut plaintext)?;
        verify_header_hmac(keys.hmac_base(), &self.header_bytes, &self.header_mac)?;

        let compressed = read_blocks(keys.hmac_base(), &plaintext[SEED_SIZE..])?;
        let json = header.compression.decompress(&compressed)?;
        let tree = Payload::from_json(&json)?.into_tree()?;
        debug!(
            groups = tree.group_count(),
            entries = tree.entry_count(),
            payload_bytes = json.len(),
            "container decrypted"
        );
        Ok(tree)
    }
}

/// Serialize `tree` under `header`. The caller refreshes the header seeds.
pub fn write_container(
    header: &ContainerHeader,
    key: &TransformedKey,
    tree: &Tree,
) -> KwResult<Vec<u8>> {
    let keys = ContainerKeys::derive(&header.master_seed, key)?;
    let header_bytes = header.to_bytes()?;

    let json = Payload::from_tree(tree).to_json()?;
    let compressed = header.compression.compress(&json)?;
    let blocks = write_blocks(keys.hmac_base(), &compressed)?;

    let mut plaintext = Vec::with_capacity(SEED_SIZE + blocks.len());
    plaintext.extend_from_slice(&header.stream_start);
    plaintext.extend_from_slice(&blocks);
    let ciphertext = header
        .cipher
        .encrypt(keys.cipher_key(), &header.iv, &plaintext)?;

    let mut out = Vec::with_capacity(header_bytes.len() + 2 * HASH_SIZE + ciphertext.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&Sha256::digest(&header_bytes));
    out.extend_from_slice(&header_hmac(keys.hmac_base(), &header_bytes)?);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}
