//! JSON payload carried inside the encrypted container
//!
//! `{ "meta": .., "root": { ..group, "groups": [..], "entries": [..] },
//!    "deleted_objects": [..], "binaries": { id: base64 } }`
//!
//! Every object keeps members it does not recognise and writes them back.

use kw_core::{KwError, KwResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

use crate::entry::Entry;
use crate::group::Group;
use crate::meta::{BinaryPool, DeletedObject, Metadata};
use crate::tree::Tree;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Payload {
    meta: Metadata,
    root: GroupRecord,
    #[serde(default)]
    deleted_objects: Vec<DeletedObject>,
    #[serde(default)]
    binaries: BinaryPool,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupRecord {
    #[serde(flatten)]
    group: Group,
    #[serde(default)]
    groups: Vec<GroupRecord>,
    #[serde(default)]
    entries: Vec<Entry>,
}

impl Payload {
    pub(crate) fn from_tree(tree: &Tree) -> Self {
        Self {
            meta: tree.meta.clone(),
            root: record_for(tree, tree.root_id()),
            deleted_objects: tree.deleted_objects().collect(),
            binaries: tree.binaries().clone(),
            extra: tree.extra.clone(),
        }
    }

    pub(crate) fn to_json(&self) -> KwResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn from_json(data: &[u8]) -> KwResult<Self> {
        serde_json::from_slice(data).map_err(|e| KwError::Format(format!("payload: {e}")))
    }

    /// Rebuild the arena. Duplicate ids are a format error.
    pub(crate) fn into_tree(self) -> KwResult<Tree> {
        let mut builder = Builder::default();
        let root_id = self.root.group.uuid;
        builder.add(self.root, None)?;

        let deleted: BTreeMap<Uuid, _> = self
            .deleted_objects
            .into_iter()
            .map(|d| (d.uuid, d.deletion_time))
            .collect();

        for entry in builder.entries.values() {
            for (name, id) in &entry.attachments {
                if !self.binaries.contains(id) {
                    warn!(entry = %entry.uuid, attachment = %name, "attachment payload missing");
                }
            }
        }

        Ok(Tree::from_parts(
            self.meta,
            root_id,
            builder.groups,
            builder.entries,
            deleted,
            self.binaries,
            self.extra,
        ))
    }
}

fn record_for(tree: &Tree, id: Uuid) -> GroupRecord {
    let group = tree
        .group(id)
        .map(Group::detached)
        .unwrap_or_else(|| Group::new(""));
    let groups = tree
        .children(id)
        .into_iter()
        .map(|child| record_for(tree, child.uuid))
        .collect();
    let entries = tree
        .entries_in(id)
        .into_iter()
        .map(|entry| Entry {
            parent: None,
            ..entry.clone()
        })
        .collect();
    GroupRecord {
        group,
        groups,
        entries,
    }
}

#[derive(Default)]
struct Builder {
    seen: HashSet<Uuid>,
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
}

impl Builder {
    fn claim(&mut self, id: Uuid) -> KwResult<()> {
        if !self.seen.insert(id) {
            return Err(KwError::Format(format!("duplicate id {id}")));
        }
        Ok(())
    }

    fn add(&mut self, record: GroupRecord, parent: Option<Uuid>) -> KwResult<()> {
        let GroupRecord {
            mut group,
            groups,
            entries,
        } = record;
        let id = group.uuid;
        self.claim(id)?;
        group.parent = parent;
        group.groups = groups.iter().map(|g| g.group.uuid).collect();
        group.entries = entries.iter().map(|e| e.uuid).collect();

        for mut entry in entries {
            self.claim(entry.uuid)?;
            entry.parent = Some(id);
            entry.ensure_standard_attributes();
            self.entries.insert(entry.uuid, entry);
        }
        self.groups.insert(id, group);
        for child in groups {
            self.add(child, Some(id))?;
        }
        Ok(())
    }
}
