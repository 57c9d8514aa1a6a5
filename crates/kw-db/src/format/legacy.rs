//! Read-only reader for legacy (generation 1) databases
//!
//! ```text
//! 124-byte header:
//!   sig1 u32 | sig2 u32 | flags u32 | version u32 | master seed 16 | iv 16
//!   group count u32 | entry count u32 | contents SHA-256 32
//!   transform seed 32 | transform rounds u32
//! AES-256-CBC ciphertext of: group records, then entry records
//! record field: [type u16 LE][size u32 LE][data], type 0xFFFF ends the record
//! ```
//!
//! There is no write path; `migrate()` hands the tree over to be saved in
//! the current format.

use chrono::{DateTime, NaiveDate, Utc};
use kw_core::config::HistoryConfig;
use kw_core::{KwError, KwResult};
use kw_crypto::kdf::aes_kdf;
use kw_crypto::{CipherId, CompositeKey, KEY_SIZE, SEED_SIZE};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{SIG1, SIG2_LEGACY};
use crate::entry::{Entry, NOTES, PASSWORD, TITLE, URL, USERNAME};
use crate::group::{Group, Icon};
use crate::meta::GENERATOR;
use crate::tree::Tree;

pub const HEADER_SIZE: usize = 124;

const FLAG_RIJNDAEL: u32 = 2;
const FLAG_TWOFISH: u32 = 8;
const VERSION: u32 = 0x0003_0004;
const VERSION_MASK: u32 = 0xFFFF_FF00;

const FIELD_END: u16 = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHeader {
    pub flags: u32,
    pub version: u32,
    pub master_seed: [u8; 16],
    pub iv: [u8; 16],
    pub group_count: u32,
    pub entry_count: u32,
    pub contents_hash: [u8; 32],
    pub transform_seed: [u8; SEED_SIZE],
    pub transform_rounds: u32,
}

impl LegacyHeader {
    pub fn parse(data: &[u8]) -> KwResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(KwError::Format("legacy header truncated".into()));
        }
        let u32_at =
            |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        if u32_at(0) != SIG1 || u32_at(4) != SIG2_LEGACY {
            return Err(KwError::UnsupportedFormat("not a legacy database".into()));
        }
        let mut header = Self {
            flags: u32_at(8),
            version: u32_at(12),
            master_seed: [0; 16],
            iv: [0; 16],
            group_count: u32_at(48),
            entry_count: u32_at(52),
            contents_hash: [0; 32],
            transform_seed: [0; SEED_SIZE],
            transform_rounds: u32_at(120),
        };
        header.master_seed.copy_from_slice(&data[16..32]);
        header.iv.copy_from_slice(&data[32..48]);
        header.contents_hash.copy_from_slice(&data[56..88]);
        header.transform_seed.copy_from_slice(&data[88..120]);

        if header.version & VERSION_MASK != VERSION & VERSION_MASK {
            return Err(KwError::UnsupportedFormat(format!(
                "legacy version {:#010x}",
                header.version
            )));
        }
        if header.flags & FLAG_TWOFISH != 0 {
            return Err(KwError::UnsupportedFormat("Twofish legacy databases".into()));
        }
        if header.flags & FLAG_RIJNDAEL == 0 {
            return Err(KwError::UnsupportedFormat(format!(
                "legacy cipher flags {:#x}",
                header.flags
            )));
        }
        Ok(header)
    }

    fn final_key(&self, composite: &CompositeKey) -> KwResult<Zeroizing<[u8; KEY_SIZE]>> {
        let hash = composite.legacy_hash()?;
        let transformed = Zeroizing::new(aes_kdf(
            &hash,
            &self.transform_seed,
            u64::from(self.transform_rounds),
            None,
        )?);
        let mut hasher = Sha256::new();
        hasher.update(self.master_seed);
        hasher.update(*transformed);
        Ok(Zeroizing::new(hasher.finalize().into()))
    }
}

/// An opened legacy database. Read-only: there is no way to save it back.
#[derive(Debug, Clone)]
pub struct LegacyDatabase {
    header: LegacyHeader,
    tree: Tree,
}

impl LegacyDatabase {
    pub fn open(data: &[u8], key: &CompositeKey) -> KwResult<Self> {
        let header = LegacyHeader::parse(data)?;
        let final_key = header.final_key(key)?;

        let mut content = Zeroizing::new(CipherId::Aes256Cbc.decrypt_raw(
            &final_key,
            &header.iv,
            &data[HEADER_SIZE..],
        )?);
        // A padding failure here means the key was wrong.
        CipherId::Aes256Cbc
            .unpad(&mut content)
            .map_err(|_| KwError::WrongKeyOrCorruptFile)?;
        let digest = Sha256::digest(content.as_slice());
        if !bool::from(digest.as_slice().ct_eq(&header.contents_hash)) {
            return Err(KwError::WrongKeyOrCorruptFile);
        }

        let tree = build_tree(&header, &content)?;
        info!(
            groups = tree.group_count(),
            entries = tree.entry_count(),
            "legacy database opened (read-only)"
        );
        Ok(Self { header, tree })
    }

    pub fn open_file(path: &Path, key: &CompositeKey) -> KwResult<Self> {
        let data = std::fs::read(path)?;
        let mut db = Self::open(&data, key)?;
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            let root = db.tree.root_id();
            db.tree.meta.name = stem.to_string();
            db.tree.rename_group(root, stem)?;
        }
        Ok(db)
    }

    pub fn header(&self) -> &LegacyHeader {
        &self.header
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// One-way conversion into a tree for the current format.
    pub fn migrate(self, history: &HistoryConfig) -> Tree {
        let mut tree = self.tree;
        tree.meta.generator = GENERATOR.into();
        tree.meta.history_max_items = history.max_items;
        tree.meta.history_max_size = history.max_size;
        tree.meta.settings_changed = kw_core::time::now();
        info!(entries = tree.entry_count(), "legacy database migrated");
        tree
    }
}

// ── Record parsing ───────────────────────────────────────────────────────────

struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    /// Next `(type, data)` pair of the current record.
    fn next_field(&mut self) -> KwResult<(u16, &'a [u8])> {
        let truncated = || KwError::Format("legacy record truncated".into());
        let head = self.data.get(self.pos..self.pos + 6).ok_or_else(truncated)?;
        let kind = u16::from_le_bytes([head[0], head[1]]);
        let size = u32::from_le_bytes([head[2], head[3], head[4], head[5]]) as usize;
        let start = self.pos + 6;
        let body = start
            .checked_add(size)
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(truncated)?;
        self.pos = start + size;
        Ok((kind, body))
    }
}

fn text(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn le_u32(data: &[u8]) -> KwResult<u32> {
    let raw: [u8; 4] = data
        .try_into()
        .map_err(|_| KwError::Format("legacy u32 field has the wrong size".into()))?;
    Ok(u32::from_le_bytes(raw))
}

fn le_u16(data: &[u8]) -> KwResult<u16> {
    let raw: [u8; 2] = data
        .try_into()
        .map_err(|_| KwError::Format("legacy u16 field has the wrong size".into()))?;
    Ok(u16::from_le_bytes(raw))
}

/// Decode a packed 5-byte date. `None` for the "never" marker or an invalid value.
fn unpack_date(data: &[u8]) -> Option<DateTime<Utc>> {
    let b: [u8; 5] = data.try_into().ok()?;
    let (b0, b1, b2, b3, b4) = (
        u32::from(b[0]),
        u32::from(b[1]),
        u32::from(b[2]),
        u32::from(b[3]),
        u32::from(b[4]),
    );
    let year = (b0 << 6) | (b1 >> 2);
    let month = ((b1 & 0x03) << 2) | (b2 >> 6);
    let day = (b2 >> 1) & 0x1F;
    let hour = ((b2 & 0x01) << 4) | (b3 >> 4);
    let minute = ((b3 & 0x0F) << 2) | (b4 >> 6);
    let second = b4 & 0x3F;
    if year == 2999 && month == 12 && day == 28 {
        return None;
    }
    NaiveDate::from_ymd_opt(year as i32, month, day)?
        .and_hms_opt(hour, minute, second)
        .map(|dt| dt.and_utc())
}

#[derive(Default)]
struct LegacyGroup {
    id: u32,
    level: u16,
    group: Option<Group>,
}

fn parse_group(fields: &mut Fields<'_>) -> KwResult<LegacyGroup> {
    let mut legacy = LegacyGroup::default();
    let mut group = Group::new("");
    let mut has_id = false;
    loop {
        let (kind, data) = fields.next_field()?;
        match kind {
            0x0001 => {
                legacy.id = le_u32(data)?;
                has_id = true;
            }
            0x0002 => group.name = text(data),
            0x0003 => set_time(&mut group.times.creation, data),
            0x0004 => set_time(&mut group.times.last_modification, data),
            0x0005 => set_time(&mut group.times.last_access, data),
            0x0006 => set_expiry(&mut group.times, data),
            0x0007 => group.icon = Icon::Standard(le_u32(data)?),
            0x0008 => legacy.level = le_u16(data)?,
            FIELD_END => break,
            _ => {}
        }
    }
    if !has_id {
        return Err(KwError::Format("legacy group without id".into()));
    }
    legacy.group = Some(group);
    Ok(legacy)
}

struct LegacyEntry {
    group_id: Option<u32>,
    binary_name: String,
    binary: Vec<u8>,
    entry: Entry,
}

impl LegacyEntry {
    fn is_meta_stream(&self) -> bool {
        self.binary_name == "bin-stream"
            && self.entry.title() == "Meta-Info"
            && self.entry.username() == "SYSTEM"
            && self.entry.url() == "$"
            && !self.entry.notes().is_empty()
    }
}

fn parse_entry(fields: &mut Fields<'_>) -> KwResult<LegacyEntry> {
    let mut legacy = LegacyEntry {
        group_id: None,
        binary_name: String::new(),
        binary: Vec::new(),
        entry: Entry::new(),
    };
    let entry = &mut legacy.entry;
    loop {
        let (kind, data) = fields.next_field()?;
        match kind {
            0x0001 => {
                entry.uuid = Uuid::from_slice(data)
                    .map_err(|_| KwError::Format("legacy entry uuid is not 16 bytes".into()))?
            }
            0x0002 => legacy.group_id = Some(le_u32(data)?),
            0x0003 => entry.icon = Icon::Standard(le_u32(data)?),
            0x0004 => entry.set(TITLE, text(data), false),
            0x0005 => entry.set(URL, text(data), false),
            0x0006 => entry.set(USERNAME, text(data), false),
            0x0007 => entry.set(PASSWORD, text(data), true),
            0x0008 => entry.set(NOTES, text(data), false),
            0x0009 => set_time(&mut entry.times.creation, data),
            0x000A => set_time(&mut entry.times.last_modification, data),
            0x000B => set_time(&mut entry.times.last_access, data),
            0x000C => set_expiry(&mut entry.times, data),
            0x000D => legacy.binary_name = text(data),
            0x000E => legacy.binary = data.to_vec(),
            FIELD_END => break,
            _ => {}
        }
    }
    Ok(legacy)
}

fn set_time(slot: &mut DateTime<Utc>, data: &[u8]) {
    if let Some(at) = unpack_date(data) {
        *slot = at;
    }
}

fn set_expiry(times: &mut crate::times::Times, data: &[u8]) {
    match unpack_date(data) {
        Some(at) => {
            times.expiry = at;
            times.expires = true;
        }
        None => times.expires = false,
    }
}

fn build_tree(header: &LegacyHeader, content: &[u8]) -> KwResult<Tree> {
    let mut tree = Tree::new("Database", &HistoryConfig::default());
    let root = tree.root_id();
    let mut fields = Fields {
        data: content,
        pos: 0,
    };

    // Parent of a group at level n is the latest group seen at level n - 1.
    let mut by_id: HashMap<u32, Uuid> = HashMap::new();
    let mut level_stack: Vec<Uuid> = Vec::new();
    for _ in 0..header.group_count {
        let legacy = parse_group(&mut fields)?;
        let level = usize::from(legacy.level);
        if level > level_stack.len() {
            return Err(KwError::Format(format!(
                "legacy group {} skips a level",
                legacy.id
            )));
        }
        level_stack.truncate(level);
        let parent = level_stack.last().copied().unwrap_or(root);
        let group = legacy
            .group
            .ok_or_else(|| KwError::Format("legacy group record empty".into()))?;
        let id = tree
            .add_group(parent, group)
            .map_err(|e| KwError::Format(format!("legacy group {}: {e}", legacy.id)))?;
        if by_id.insert(legacy.id, id).is_some() {
            return Err(KwError::Format(format!("duplicate legacy group id {}", legacy.id)));
        }
        level_stack.push(id);
    }

    let mut skipped = 0usize;
    for _ in 0..header.entry_count {
        let legacy = parse_entry(&mut fields)?;
        if legacy.is_meta_stream() {
            skipped += 1;
            continue;
        }
        let group_id = legacy
            .group_id
            .ok_or_else(|| KwError::Format("legacy entry without group".into()))?;
        let parent = *by_id
            .get(&group_id)
            .ok_or_else(|| KwError::Format(format!("legacy entry in unknown group {group_id}")))?;
        let LegacyEntry {
            binary_name,
            binary,
            mut entry,
            ..
        } = legacy;
        if !binary_name.is_empty() {
            let content_id = tree.binaries_mut().insert(binary);
            entry.attachments.insert(binary_name, content_id);
        }
        let uuid = entry.uuid;
        tree.add_entry(parent, entry)
            .map_err(|e| KwError::Format(format!("legacy entry {uuid}: {e}")))?;
    }

    if fields.pos != content.len() {
        warn!(
            trailing = content.len() - fields.pos,
            "legacy database has trailing bytes"
        );
    }
    debug!(skipped_meta_streams = skipped, "legacy records decoded");
    Ok(tree)
}
