//! Association records persisted inside the database
//!
//! Each associated client is one protected attribute `Association: <client id>`
//! holding the record as JSON, on a settings entry with a fixed uuid in the
//! root group. Updates go through `Tree::edit_entry`, so they are versioned
//! and merge like any other entry.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::{DateTime, Utc};
use kw_core::{KwError, KwResult};
use kw_db::entry::{NOTES, TITLE};
use kw_db::{Entry, Tree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::SharedKey;

/// Well-known uuid of the settings entry.
pub const SETTINGS_ENTRY_UUID: Uuid = Uuid::from_u128(0x6b65_7977_6172_6462_726f_6b65_7200_0001);
pub const SETTINGS_ENTRY_TITLE: &str = "Keyward Broker Settings";
pub const ASSOCIATION_PREFIX: &str = "Association: ";

/// `last_used` is only written back once it is this stale.
const LAST_USED_GRANULARITY_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    /// Prompt on every access
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationRecord {
    pub client_id: String,
    pub label: String,
    #[serde(with = "key_b64")]
    pub key: SharedKey,
    pub decision: Decision,
    /// Remembered per-entry answers (`Allow` or `Deny` only)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entries: BTreeMap<Uuid, Decision>,
    pub created: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl AssociationRecord {
    pub fn new(client_id: &str, label: &str, key: SharedKey, decision: Decision) -> Self {
        let now = kw_core::time::now();
        Self {
            client_id: client_id.to_string(),
            label: label.to_string(),
            key,
            decision,
            entries: BTreeMap::new(),
            created: now,
            last_used: now,
        }
    }

    /// The remembered answer for one entry, if any.
    pub fn entry_decision(&self, id: Uuid) -> Option<Decision> {
        self.entries.get(&id).copied()
    }

    /// Refresh `last_used`; true when the change is worth persisting.
    pub fn touch(&mut self) -> bool {
        let now = kw_core::time::now();
        if (now - self.last_used).num_seconds() < LAST_USED_GRANULARITY_SECS {
            return false;
        }
        self.last_used = now;
        true
    }
}

pub fn attribute_name(client_id: &str) -> String {
    format!("{ASSOCIATION_PREFIX}{client_id}")
}

pub fn load(tree: &Tree, client_id: &str) -> KwResult<Option<AssociationRecord>> {
    let Some(entry) = tree.entry(SETTINGS_ENTRY_UUID) else {
        return Ok(None);
    };
    let Some(attr) = entry.attributes.get(&attribute_name(client_id)) else {
        return Ok(None);
    };
    let record: AssociationRecord = serde_json::from_str(&attr.value)
        .map_err(|e| KwError::Format(format!("association {client_id:?}: {e}")))?;
    Ok(Some(record))
}

/// All readable records. Malformed ones are skipped.
pub fn list(tree: &Tree) -> Vec<AssociationRecord> {
    let Some(entry) = tree.entry(SETTINGS_ENTRY_UUID) else {
        return Vec::new();
    };
    entry
        .attributes
        .iter()
        .filter(|(name, _)| name.starts_with(ASSOCIATION_PREFIX))
        .filter_map(|(name, attr)| match serde_json::from_str(&attr.value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(attribute = %name, error = %e, "skipping unreadable association");
                None
            }
        })
        .collect()
}

/// Whether another client already holds `key`.
pub fn key_in_use(tree: &Tree, client_id: &str, key: &SharedKey) -> bool {
    list(tree)
        .iter()
        .any(|r| r.client_id != client_id && r.key == *key)
}

/// Insert or replace a record. The settings entry is created on first use.
pub fn store(tree: &mut Tree, record: &AssociationRecord) -> KwResult<()> {
    if key_in_use(tree, &record.client_id, &record.key) {
        return Err(KwError::AccessDenied(
            "channel key already belongs to another client".into(),
        ));
    }
    let name = attribute_name(&record.client_id);
    let json = serde_json::to_string(record)?;
    if tree.entry(SETTINGS_ENTRY_UUID).is_some() {
        tree.edit_entry(SETTINGS_ENTRY_UUID, |e| e.set(&name, json, true))?;
    } else {
        create_settings_entry(tree, &name, json)?;
    }
    debug!(client = %record.client_id, decision = ?record.decision, "association stored");
    Ok(())
}

pub fn remove(tree: &mut Tree, client_id: &str) -> KwResult<bool> {
    if tree.entry(SETTINGS_ENTRY_UUID).is_none() {
        return Ok(false);
    }
    let name = attribute_name(client_id);
    let removed = tree.edit_entry(SETTINGS_ENTRY_UUID, |e| e.remove(&name))?;
    if removed {
        info!(client = %client_id, "association removed");
    }
    Ok(removed)
}

fn create_settings_entry(tree: &mut Tree, name: &str, json: String) -> KwResult<()> {
    let mut entry = Entry::new();
    entry.uuid = SETTINGS_ENTRY_UUID;
    entry.set(TITLE, SETTINGS_ENTRY_TITLE, false);
    entry.set(
        NOTES,
        "Do not remove this entry: it holds the browser client associations.",
        false,
    );
    entry.set(name, json, true);
    let root = tree.root_id();
    tree.add_entry(root, entry)?;
    info!("broker settings entry created");
    Ok(())
}

mod key_b64 {
    use super::*;
    use serde::{Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(key: &SharedKey, s: S) -> Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(B64.encode(key.as_bytes()));
        s.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SharedKey, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(d)?);
        let bytes =
            Zeroizing::new(B64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)?);
        SharedKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}
