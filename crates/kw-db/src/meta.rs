use chrono::{DateTime, Utc};
use kw_core::config::HistoryConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::times::b64;

pub const GENERATOR: &str = concat!("keyward ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub generator: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_username: String,
    #[serde(default)]
    pub recycle_bin_enabled: bool,
    #[serde(default)]
    pub recycle_bin: Option<Uuid>,
    /// Negative disables the cap
    pub history_max_items: i32,
    /// Bytes; negative disables the cap
    pub history_max_size: i64,
    #[serde(default)]
    pub custom_icons: Vec<CustomIcon>,
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
    pub settings_changed: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Metadata {
    pub fn new(name: &str, history: &HistoryConfig) -> Self {
        Self {
            generator: GENERATOR.into(),
            name: name.into(),
            description: String::new(),
            default_username: String::new(),
            recycle_bin_enabled: true,
            recycle_bin: None,
            history_max_items: history.max_items,
            history_max_size: history.max_size,
            custom_icons: Vec::new(),
            custom_data: BTreeMap::new(),
            settings_changed: kw_core::time::now(),
            extra: Map::new(),
        }
    }

    pub fn custom_icon(&self, id: Uuid) -> Option<&CustomIcon> {
        self.custom_icons.iter().find(|icon| icon.uuid == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomIcon {
    pub uuid: Uuid,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub last_modification: DateTime<Utc>,
}

/// Tombstone left by a permanent deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
struct Blob(#[serde(with = "b64")] Vec<u8>);

/// Attachment payloads stored once, keyed by BLAKE3 hex of their content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BinaryPool {
    items: BTreeMap<String, Blob>,
}

impl BinaryPool {
    pub fn content_id(data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    /// Store `data` (deduplicated) and return its content id.
    pub fn insert(&mut self, data: Vec<u8>) -> String {
        let id = Self::content_id(&data);
        self.items.entry(id.clone()).or_insert(Blob(data));
        id
    }

    /// Insert under a known id, keeping an existing payload.
    pub(crate) fn insert_with_id(&mut self, id: &str, data: &[u8]) {
        self.items
            .entry(id.to_string())
            .or_insert_with(|| Blob(data.to_vec()));
    }

    pub fn get(&self, id: &str) -> Option<&[u8]> {
        self.items.get(id).map(|b| b.0.as_slice())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn size_of(&self, id: &str) -> usize {
        self.items.get(id).map(|b| b.0.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.0.as_slice()))
    }

    /// Drop payloads not in `referenced`; returns how many were removed.
    pub fn retain_referenced(&mut self, referenced: &BTreeSet<String>) -> usize {
        let before = self.items.len();
        self.items.retain(|id, _| referenced.contains(id));
        before - self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_deduplicates() {
        let mut pool = BinaryPool::default();
        let a = pool.insert(b"same".to_vec());
        let b = pool.insert(b"same".to_vec());
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&a), Some(&b"same"[..]));
    }

    #[test]
    fn test_pool_retain() {
        let mut pool = BinaryPool::default();
        let keep = pool.insert(b"keep".to_vec());
        pool.insert(b"drop".to_vec());
        let removed = pool.retain_referenced(&BTreeSet::from([keep.clone()]));
        assert_eq!(removed, 1);
        assert!(pool.contains(&keep));
    }

    #[test]
    fn test_pool_json_is_base64_map() {
        let mut pool = BinaryPool::default();
        let id = pool.insert(vec![0, 1, 2]);
        let json = serde_json::to_value(&pool).unwrap();
        assert_eq!(json[&id], "AAEC");
    }
}
