//! On-disk formats. The legacy format is read-only; every write produces the
//! current container.

pub mod current;
pub mod header;
pub mod legacy;
pub(crate) mod payload;

use kw_core::{KwError, KwResult};
use kw_crypto::CompositeKey;
use std::io::Read;
use std::path::Path;

use crate::session::{OpenOptions, Session};
use crate::tree::Tree;
use legacy::LegacyDatabase;

/// First signature word, shared by both formats.
pub const SIG1: u32 = 0x9AA2_D903;
/// Second signature word of the current container.
pub const SIG2_CURRENT: u32 = 0xB54B_FB6B;
/// Second signature word of the legacy format.
pub const SIG2_LEGACY: u32 = 0xB54B_FB65;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Legacy,
    Current,
}

/// Identify a file from its first eight bytes.
pub fn detect(data: &[u8]) -> KwResult<FormatKind> {
    if data.len() < 8 {
        return Err(KwError::UnsupportedFormat("file too short".into()));
    }
    let sig1 = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let sig2 = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    match (sig1, sig2) {
        (SIG1, SIG2_CURRENT) => Ok(FormatKind::Current),
        (SIG1, SIG2_LEGACY) => Ok(FormatKind::Legacy),
        _ => Err(KwError::UnsupportedFormat(format!(
            "unknown signature {sig1:#010x} {sig2:#010x}"
        ))),
    }
}

pub fn detect_file(path: &Path) -> KwResult<FormatKind> {
    let mut head = [0u8; 8];
    let mut file = std::fs::File::open(path)?;
    let read = file.read(&mut head)?;
    detect(&head[..read])
}

/// The whole tree as readable JSON, in the same shape as the encrypted
/// payload. The output holds every secret in plaintext.
pub fn export_json(tree: &Tree) -> KwResult<String> {
    Ok(serde_json::to_string_pretty(&payload::Payload::from_tree(tree))?)
}

/// A database opened from either format.
#[derive(Debug)]
pub enum OpenedDatabase {
    Legacy(LegacyDatabase),
    Current(Session),
}

impl OpenedDatabase {
    pub fn open(path: &Path, key: CompositeKey, options: OpenOptions) -> KwResult<Self> {
        match detect_file(path)? {
            FormatKind::Legacy => Ok(Self::Legacy(LegacyDatabase::open_file(path, &key)?)),
            FormatKind::Current => Ok(Self::Current(Session::open(path, key, options)?)),
        }
    }

    pub fn tree(&self) -> &Tree {
        match self {
            Self::Legacy(db) => db.tree(),
            Self::Current(session) => session.tree(),
        }
    }

    pub fn kind(&self) -> FormatKind {
        match self {
            Self::Legacy(_) => FormatKind::Legacy,
            Self::Current(_) => FormatKind::Current,
        }
    }

    pub fn is_read_only(&self) -> bool {
        match self {
            Self::Legacy(_) => true,
            Self::Current(session) => session.is_read_only(),
        }
    }
}
