//! HMAC-authenticated block stream
//!
//! Stream format (binary):
//! ```text
//! repeat: [8 bytes: index u64 LE][32 bytes: HMAC-SHA256][4 bytes: len u32 LE][len bytes: data]
//! terminator: a block with len = 0
//! block MAC  = HMAC-SHA256(key = SHA-256(index LE || base key), index LE || len LE || data)
//! header MAC = HMAC-SHA256(key = block key for index u64::MAX, header bytes)
//! ```
//!
//! Indexes run 0, 1, 2, ... so blocks cannot be reordered, dropped or
//! truncated without detection.

use hmac::{Hmac, Mac};
use kw_core::{KwError, KwResult};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::KEY_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Maximum payload bytes per block (1 MiB)
pub const BLOCK_SIZE: usize = 1024 * 1024;

const MAC_SIZE: usize = 32;
const BLOCK_HEADER: usize = 8 + MAC_SIZE + 4;
const HEADER_INDEX: u64 = u64::MAX;

/// Per-block HMAC key.
pub fn block_key(base: &[u8; KEY_SIZE], index: u64) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut hasher = Sha256::new();
    hasher.update(index.to_le_bytes());
    hasher.update(base);
    Zeroizing::new(hasher.finalize().into())
}

fn block_mac(base: &[u8; KEY_SIZE], index: u64, data: &[u8]) -> KwResult<HmacSha256> {
    let key = block_key(base, index);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&*key)
        .map_err(|e| KwError::KeyDerivation(format!("HMAC key: {e}")))?;
    mac.update(&index.to_le_bytes());
    mac.update(&(data.len() as u32).to_le_bytes());
    mac.update(data);
    Ok(mac)
}

pub fn header_hmac(base: &[u8; KEY_SIZE], header: &[u8]) -> KwResult<[u8; MAC_SIZE]> {
    Ok(header_mac(base, header)?.finalize().into_bytes().into())
}

pub fn verify_header_hmac(base: &[u8; KEY_SIZE], header: &[u8], expected: &[u8]) -> KwResult<()> {
    header_mac(base, header)?
        .verify_slice(expected)
        .map_err(|_| KwError::Integrity("header HMAC mismatch".into()))
}

fn header_mac(base: &[u8; KEY_SIZE], header: &[u8]) -> KwResult<HmacSha256> {
    let key = block_key(base, HEADER_INDEX);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&*key)
        .map_err(|e| KwError::KeyDerivation(format!("HMAC key: {e}")))?;
    mac.update(header);
    Ok(mac)
}

/// Split `data` into MAC'd blocks of at most `BLOCK_SIZE` and append the terminator.
pub fn write_blocks(base: &[u8; KEY_SIZE], data: &[u8]) -> KwResult<Vec<u8>> {
    let blocks = data.len().div_ceil(BLOCK_SIZE);
    let mut out = Vec::with_capacity(data.len() + (blocks + 1) * BLOCK_HEADER);
    let mut index = 0u64;
    for chunk in data.chunks(BLOCK_SIZE) {
        push_block(&mut out, base, index, chunk)?;
        index += 1;
    }
    push_block(&mut out, base, index, &[])?;
    Ok(out)
}

fn push_block(out: &mut Vec<u8>, base: &[u8; KEY_SIZE], index: u64, data: &[u8]) -> KwResult<()> {
    let tag = block_mac(base, index, data)?.finalize().into_bytes();
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// Incremental reader: each block is verified before it is handed out, and
/// reading stops at the first invalid block.
pub struct BlockReader<'a> {
    base: &'a [u8; KEY_SIZE],
    data: &'a [u8],
    pos: usize,
    next_index: u64,
    finished: bool,
}

impl<'a> BlockReader<'a> {
    pub fn new(base: &'a [u8; KEY_SIZE], data: &'a [u8]) -> Self {
        Self {
            base,
            data,
            pos: 0,
            next_index: 0,
            finished: false,
        }
    }

    /// The next verified block, or `None` after the terminator.
    pub fn next_block(&mut self) -> KwResult<Option<&'a [u8]>> {
        if self.finished {
            return Ok(None);
        }
        let rest = &self.data[self.pos..];
        if rest.len() < BLOCK_HEADER {
            return Err(KwError::Integrity(format!(
                "block stream truncated before block {}",
                self.next_index
            )));
        }

        let index = u64::from_le_bytes(read_array(&rest[..8]));
        let tag = &rest[8..8 + MAC_SIZE];
        let len = u32::from_le_bytes(read_array(&rest[8 + MAC_SIZE..BLOCK_HEADER])) as usize;

        if index != self.next_index {
            return Err(KwError::Integrity(format!(
                "block index {index} out of order (expected {})",
                self.next_index
            )));
        }
        if rest.len() - BLOCK_HEADER < len {
            return Err(KwError::Integrity(format!("block {index} truncated")));
        }
        let payload = &rest[BLOCK_HEADER..BLOCK_HEADER + len];
        block_mac(self.base, index, payload)?
            .verify_slice(tag)
            .map_err(|_| KwError::Integrity(format!("block {index} HMAC mismatch")))?;

        self.pos += BLOCK_HEADER + len;
        self.next_index += 1;

        if len == 0 {
            self.finished = true;
            if self.pos != self.data.len() {
                return Err(KwError::Integrity(
                    "data after block stream terminator".into(),
                ));
            }
            return Ok(None);
        }
        Ok(Some(payload))
    }
}

/// Verify and concatenate every block. Nothing is returned unless the whole
/// stream, including its terminator, verifies.
pub fn read_blocks(base: &[u8; KEY_SIZE], data: &[u8]) -> KwResult<Vec<u8>> {
    let mut reader = BlockReader::new(base, data);
    let mut out = Vec::with_capacity(data.len());
    while let Some(block) = reader.next_block()? {
        out.extend_from_slice(block);
    }
    Ok(out)
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: [u8; 32] = [0x33; 32];

    #[test]
    fn test_empty_payload_is_just_terminator() {
        let stream = write_blocks(&BASE, &[]).unwrap();
        assert_eq!(stream.len(), BLOCK_HEADER);
        assert!(read_blocks(&BASE, &stream).unwrap().is_empty());
    }

    #[test]
    fn test_multi_block_split() {
        let data = vec![0xA5u8; BLOCK_SIZE + 10];
        let stream = write_blocks(&BASE, &data).unwrap();
        let mut reader = BlockReader::new(&BASE, &stream);
        assert_eq!(reader.next_block().unwrap().unwrap().len(), BLOCK_SIZE);
        assert_eq!(reader.next_block().unwrap().unwrap().len(), 10);
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn test_wrong_base_key_fails() {
        let stream = write_blocks(&BASE, b"payload").unwrap();
        assert!(matches!(
            read_blocks(&[0u8; 32], &stream),
            Err(KwError::Integrity(_))
        ));
    }

    #[test]
    fn test_missing_terminator_fails() {
        let stream = write_blocks(&BASE, b"payload").unwrap();
        let cut = &stream[..stream.len() - BLOCK_HEADER];
        assert!(matches!(read_blocks(&BASE, cut), Err(KwError::Integrity(_))));
    }

    #[test]
    fn test_reordered_blocks_fail() {
        let data = vec![1u8; BLOCK_SIZE * 2];
        let stream = write_blocks(&BASE, &data).unwrap();
        let block = BLOCK_HEADER + BLOCK_SIZE;
        let mut swapped = stream[block..2 * block].to_vec();
        swapped.extend_from_slice(&stream[..block]);
        swapped.extend_from_slice(&stream[2 * block..]);
        assert!(matches!(
            read_blocks(&BASE, &swapped),
            Err(KwError::Integrity(_))
        ));
    }

    #[test]
    fn test_trailing_garbage_fails() {
        let mut stream = write_blocks(&BASE, b"payload").unwrap();
        stream.push(0);
        assert!(read_blocks(&BASE, &stream).is_err());
    }

    #[test]
    fn test_header_hmac() {
        let tag = header_hmac(&BASE, b"header").unwrap();
        verify_header_hmac(&BASE, b"header", &tag).unwrap();
        assert!(verify_header_hmac(&BASE, b"headex", &tag).is_err());
        assert_ne!(&tag[..], &block_key(&BASE, 0)[..]);
    }

    proptest! {
        #[test]
        fn prop_any_bit_flip_detected(data in proptest::collection::vec(any::<u8>(), 1..512), bit in any::<usize>()) {
            let mut stream = write_blocks(&BASE, &data).unwrap();
            let bit = bit % (stream.len() * 8);
            stream[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(read_blocks(&BASE, &stream).is_err());
        }
    }
}
