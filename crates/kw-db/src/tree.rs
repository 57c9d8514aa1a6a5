//! In-memory credential tree
//!
//! Groups and entries live in arenas keyed by uuid. Every node stores its
//! parent id; groups keep ordered child id lists. The root group has no parent.

use chrono::{DateTime, Utc};
use kw_core::config::HistoryConfig;
use kw_core::TreeError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

use crate::entry::Entry;
use crate::group::{Group, Icon, RECYCLE_BIN_ICON};
use crate::meta::{BinaryPool, CustomIcon, DeletedObject, Metadata};

pub type TreeResult<T> = Result<T, TreeError>;

pub const RECYCLE_BIN_NAME: &str = "Recycle Bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Move into the recycle bin when possible
    Recycle,
    /// Remove from the id space and leave tombstones
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deleted {
    Recycled,
    Permanently,
}

#[derive(Debug, Clone)]
pub struct Tree {
    pub meta: Metadata,
    root: Uuid,
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
    deleted: BTreeMap<Uuid, DateTime<Utc>>,
    binaries: BinaryPool,
    /// Unknown top-level payload members
    pub(crate) extra: Map<String, Value>,
}

impl Tree {
    pub fn new(name: &str, history: &HistoryConfig) -> Self {
        let root = Group::new(name);
        let root_id = root.uuid;
        Self {
            meta: Metadata::new(name, history),
            root: root_id,
            groups: HashMap::from([(root_id, root)]),
            entries: HashMap::new(),
            deleted: BTreeMap::new(),
            binaries: BinaryPool::default(),
            extra: Map::new(),
        }
    }

    /// Assemble a tree from decoded parts. Links in `groups`/`entries` must
    /// already be consistent; used by the codecs.
    pub(crate) fn from_parts(
        meta: Metadata,
        root: Uuid,
        groups: HashMap<Uuid, Group>,
        entries: HashMap<Uuid, Entry>,
        deleted: BTreeMap<Uuid, DateTime<Utc>>,
        binaries: BinaryPool,
        extra: Map<String, Value>,
    ) -> Self {
        Self {
            meta,
            root,
            groups,
            entries,
            deleted,
            binaries,
            extra,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn root_id(&self) -> Uuid {
        self.root
    }

    pub fn root(&self) -> &Group {
        &self.groups[&self.root]
    }

    pub fn group(&self, id: Uuid) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn entry(&self, id: Uuid) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.groups.contains_key(&id) || self.entries.contains_key(&id)
    }

    pub fn children(&self, id: Uuid) -> Vec<&Group> {
        self.groups
            .get(&id)
            .map(|g| g.groups.iter().filter_map(|c| self.groups.get(c)).collect())
            .unwrap_or_default()
    }

    pub fn entries_in(&self, id: Uuid) -> Vec<&Entry> {
        self.groups
            .get(&id)
            .map(|g| g.entries.iter().filter_map(|c| self.entries.get(c)).collect())
            .unwrap_or_default()
    }

    /// Group ids in pre-order starting at `from`.
    pub fn group_ids_preorder(&self, from: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if let Some(group) = self.groups.get(&id) {
                out.push(id);
                stack.extend(group.groups.iter().rev());
            }
        }
        out
    }

    /// All groups in pre-order from the root.
    pub fn iter_groups(&self) -> impl Iterator<Item = &Group> + '_ {
        self.group_ids_preorder(self.root)
            .into_iter()
            .filter_map(|id| self.groups.get(&id))
    }

    /// All current entries (history excluded) in tree order.
    pub fn iter_entries(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.iter_groups()
            .flat_map(|g| g.entries.iter())
            .filter_map(|id| self.entries.get(id))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Slash-separated group names below the root ("" for the root itself).
    pub fn group_path(&self, id: Uuid) -> Option<String> {
        let mut names = Vec::new();
        let mut current = self.groups.get(&id)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = self.groups.get(&parent)?;
        }
        names.reverse();
        Some(names.join("/"))
    }

    pub fn find_group_by_path(&self, path: &str) -> Option<&Group> {
        let mut current = self.root();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = self.children(current.uuid).into_iter().find(|g| g.name == part)?;
        }
        Some(current)
    }

    /// `"a/b/Title"`: entry titled `Title` in group `a/b`.
    pub fn find_entry_by_path(&self, path: &str) -> Option<&Entry> {
        let path = path.trim_matches('/');
        let (group_path, title) = match path.rsplit_once('/') {
            Some((group, title)) => (group, title),
            None => ("", path),
        };
        let group = self.find_group_by_path(group_path)?;
        self.entries_in(group.uuid)
            .into_iter()
            .find(|e| e.title() == title)
    }

    pub fn recycle_bin(&self) -> Option<Uuid> {
        self.meta
            .recycle_bin
            .filter(|id| self.groups.contains_key(id))
    }

    /// Whether `id` is the recycle bin or lies anywhere beneath it.
    pub fn is_in_recycle_bin(&self, id: Uuid) -> bool {
        let Some(bin) = self.recycle_bin() else {
            return false;
        };
        let mut current = match (self.groups.get(&id), self.entries.get(&id)) {
            (Some(g), _) => Some(g.uuid),
            (None, Some(e)) => e.parent,
            (None, None) => None,
        };
        while let Some(gid) = current {
            if gid == bin {
                return true;
            }
            current = self.groups.get(&gid).and_then(|g| g.parent);
        }
        false
    }

    pub fn is_descendant_of(&self, id: Uuid, ancestor: Uuid) -> bool {
        let mut current = Some(id);
        while let Some(gid) = current {
            if gid == ancestor {
                return true;
            }
            current = self.groups.get(&gid).and_then(|g| g.parent);
        }
        false
    }

    pub fn deleted_objects(&self) -> impl Iterator<Item = DeletedObject> + '_ {
        self.deleted.iter().map(|(uuid, time)| DeletedObject {
            uuid: *uuid,
            deletion_time: *time,
        })
    }

    pub fn tombstone(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.deleted.get(&id).copied()
    }

    pub fn binaries(&self) -> &BinaryPool {
        &self.binaries
    }

    pub fn attachment(&self, entry: Uuid, name: &str) -> Option<&[u8]> {
        let id = self.entries.get(&entry)?.attachments.get(name)?;
        self.binaries.get(id)
    }

    // ── Structural mutation ──────────────────────────────────────────────────

    fn check_new_id(&self, id: Uuid) -> TreeResult<()> {
        if self.contains(id) {
            return Err(TreeError::DuplicateId(id));
        }
        Ok(())
    }

    pub fn add_group(&mut self, parent: Uuid, mut group: Group) -> TreeResult<Uuid> {
        self.check_new_id(group.uuid)?;
        let parent_group = self
            .groups
            .get_mut(&parent)
            .ok_or(TreeError::UnknownGroup(parent))?;
        let id = group.uuid;
        parent_group.groups.push(id);
        group.parent = Some(parent);
        group.groups.clear();
        group.entries.clear();
        self.groups.insert(id, group);
        self.deleted.remove(&id);
        debug!(group = %id, parent = %parent, "group added");
        Ok(id)
    }

    pub fn add_entry(&mut self, parent: Uuid, mut entry: Entry) -> TreeResult<Uuid> {
        self.check_new_id(entry.uuid)?;
        let parent_group = self
            .groups
            .get_mut(&parent)
            .ok_or(TreeError::UnknownGroup(parent))?;
        let id = entry.uuid;
        parent_group.entries.push(id);
        entry.parent = Some(parent);
        entry.ensure_standard_attributes();
        self.entries.insert(id, entry);
        self.deleted.remove(&id);
        debug!(entry = %id, parent = %parent, "entry added");
        Ok(id)
    }

    pub fn rename_group(&mut self, id: Uuid, name: &str) -> TreeResult<bool> {
        self.edit_group(id, |g| g.name = name.to_string())
    }

    /// Apply `f` to a group's properties. Groups keep no history. Returns
    /// whether anything changed.
    pub fn edit_group(&mut self, id: Uuid, f: impl FnOnce(&mut Group)) -> TreeResult<bool> {
        let current = self.groups.get(&id).ok_or(TreeError::UnknownGroup(id))?;
        let mut updated = current.clone();
        f(&mut updated);
        updated.uuid = current.uuid;
        updated.parent = current.parent;
        updated.groups.clone_from(&current.groups);
        updated.entries.clone_from(&current.entries);
        if updated.same_properties(current) {
            return Ok(false);
        }
        updated.times.last_modification = kw_core::time::after(current.times.last_modification);
        self.groups.insert(id, updated);
        Ok(true)
    }

    /// Apply `f` to an entry. The prior state is prepended to the history,
    /// the modification time bumped and the history trimmed to the caps.
    /// An edit that changes nothing leaves the entry untouched.
    pub fn edit_entry(&mut self, id: Uuid, f: impl FnOnce(&mut Entry)) -> TreeResult<bool> {
        let current = self.entries.get(&id).ok_or(TreeError::UnknownEntry(id))?;
        let mut updated = current.clone();
        f(&mut updated);
        updated.uuid = current.uuid;
        updated.parent = current.parent;
        updated.history.clone_from(&current.history);
        updated.ensure_standard_attributes();
        if updated.same_content(current) {
            return Ok(false);
        }
        let snapshot = current.snapshot();
        updated.history.insert(0, snapshot);
        let now = kw_core::time::after(current.times.last_modification);
        updated.times.last_modification = now;
        updated.times.last_access = now;
        self.entries.insert(id, updated);
        self.trim_history(id);
        debug!(entry = %id, "entry edited");
        Ok(true)
    }

    /// Record an access without touching history.
    pub fn touch_entry(&mut self, id: Uuid) -> TreeResult<()> {
        let entry = self.entries.get_mut(&id).ok_or(TreeError::UnknownEntry(id))?;
        entry.times.last_access = kw_core::time::now();
        entry.times.usage_count += 1;
        Ok(())
    }

    /// Drop the oldest history items beyond the metadata caps.
    pub fn trim_history(&mut self, id: Uuid) {
        let Some(mut history) = self
            .entries
            .get_mut(&id)
            .map(|e| std::mem::take(&mut e.history))
        else {
            return;
        };
        self.cap_history(&mut history);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.history = history;
        }
    }

    /// Truncate a newest-first history list to the metadata caps.
    pub(crate) fn cap_history(&self, history: &mut Vec<Entry>) {
        let max_items = self.meta.history_max_items;
        let max_size = self.meta.history_max_size;
        if max_items >= 0 {
            history.truncate(max_items as usize);
        }
        if max_size >= 0 {
            let mut total = 0usize;
            let mut keep = 0usize;
            for item in history.iter() {
                total += item.approx_size(|bin| self.binaries.size_of(bin));
                if total as i64 > max_size {
                    break;
                }
                keep += 1;
            }
            history.truncate(keep);
        }
    }

    pub fn move_group(&mut self, id: Uuid, new_parent: Uuid) -> TreeResult<()> {
        if id == self.root {
            return Err(TreeError::RootImmutable);
        }
        if !self.groups.contains_key(&id) {
            return Err(TreeError::UnknownGroup(id));
        }
        if !self.groups.contains_key(&new_parent) {
            return Err(TreeError::UnknownGroup(new_parent));
        }
        if self.is_descendant_of(new_parent, id) {
            return Err(TreeError::Cycle(id));
        }
        self.relink_group(id, new_parent);
        if let Some(group) = self.groups.get_mut(&id) {
            group.times.location_changed = kw_core::time::now();
        }
        Ok(())
    }

    pub fn move_entry(&mut self, id: Uuid, new_parent: Uuid) -> TreeResult<()> {
        if !self.entries.contains_key(&id) {
            return Err(TreeError::UnknownEntry(id));
        }
        if !self.groups.contains_key(&new_parent) {
            return Err(TreeError::UnknownGroup(new_parent));
        }
        self.relink_entry(id, new_parent);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.times.location_changed = kw_core::time::now();
        }
        Ok(())
    }

    fn relink_group(&mut self, id: Uuid, new_parent: Uuid) {
        let old_parent = self.groups.get(&id).and_then(|g| g.parent);
        if let Some(old) = old_parent.and_then(|p| self.groups.get_mut(&p)) {
            old.groups.retain(|c| *c != id);
        }
        if let Some(parent) = self.groups.get_mut(&new_parent) {
            parent.groups.push(id);
        }
        if let Some(group) = self.groups.get_mut(&id) {
            group.parent = Some(new_parent);
        }
    }

    fn relink_entry(&mut self, id: Uuid, new_parent: Uuid) {
        let old_parent = self.entries.get(&id).and_then(|e| e.parent);
        if let Some(old) = old_parent.and_then(|p| self.groups.get_mut(&p)) {
            old.entries.retain(|c| *c != id);
        }
        if let Some(parent) = self.groups.get_mut(&new_parent) {
            parent.entries.push(id);
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.parent = Some(new_parent);
        }
    }

    /// The recycle bin, created under the root if missing.
    pub fn ensure_recycle_bin(&mut self) -> TreeResult<Uuid> {
        if let Some(bin) = self.recycle_bin() {
            return Ok(bin);
        }
        let mut bin = Group::new(RECYCLE_BIN_NAME);
        bin.icon = Icon::Standard(RECYCLE_BIN_ICON);
        bin.is_expanded = false;
        let id = self.add_group(self.root, bin)?;
        self.meta.recycle_bin = Some(id);
        self.meta.settings_changed = kw_core::time::now();
        Ok(id)
    }

    fn recycles(&self, id: Uuid, mode: DeleteMode) -> bool {
        mode == DeleteMode::Recycle && self.meta.recycle_bin_enabled && !self.is_in_recycle_bin(id)
    }

    pub fn delete_entry(&mut self, id: Uuid, mode: DeleteMode) -> TreeResult<Deleted> {
        if !self.entries.contains_key(&id) {
            return Err(TreeError::UnknownEntry(id));
        }
        if self.recycles(id, mode) {
            let bin = self.ensure_recycle_bin()?;
            self.move_entry(id, bin)?;
            debug!(entry = %id, "entry recycled");
            return Ok(Deleted::Recycled);
        }
        let now = kw_core::time::now();
        self.remove_entry_permanently(id, now);
        Ok(Deleted::Permanently)
    }

    pub fn delete_group(&mut self, id: Uuid, mode: DeleteMode) -> TreeResult<Deleted> {
        if id == self.root {
            return Err(TreeError::RootImmutable);
        }
        if !self.groups.contains_key(&id) {
            return Err(TreeError::UnknownGroup(id));
        }
        if self.recycles(id, mode) {
            let bin = self.ensure_recycle_bin()?;
            self.move_group(id, bin)?;
            debug!(group = %id, "group recycled");
            return Ok(Deleted::Recycled);
        }
        let now = kw_core::time::now();
        self.remove_group_permanently(id, now);
        Ok(Deleted::Permanently)
    }

    /// Permanently delete everything inside the recycle bin.
    pub fn empty_recycle_bin(&mut self) -> usize {
        let Some(bin) = self.recycle_bin() else {
            return 0;
        };
        let now = kw_core::time::now();
        let (groups, entries) = match self.groups.get(&bin) {
            Some(g) => (g.groups.clone(), g.entries.clone()),
            None => return 0,
        };
        let mut removed = 0;
        for id in entries {
            removed += self.remove_entry_permanently(id, now);
        }
        for id in groups {
            removed += self.remove_group_permanently(id, now);
        }
        removed
    }

    /// Returns the number of removed nodes (0 or 1).
    pub(crate) fn remove_entry_permanently(&mut self, id: Uuid, at: DateTime<Utc>) -> usize {
        let Some(entry) = self.entries.remove(&id) else {
            return 0;
        };
        if let Some(parent) = entry.parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.entries.retain(|c| *c != id);
        }
        self.deleted.insert(id, at);
        debug!(entry = %id, "entry deleted permanently");
        1
    }

    /// Remove a group and its subtree; returns the number of removed nodes.
    pub(crate) fn remove_group_permanently(&mut self, id: Uuid, at: DateTime<Utc>) -> usize {
        if id == self.root || !self.groups.contains_key(&id) {
            return 0;
        }
        let subtree = self.group_ids_preorder(id);
        if let Some(parent) = self.groups.get(&id).and_then(|g| g.parent) {
            if let Some(parent) = self.groups.get_mut(&parent) {
                parent.groups.retain(|c| *c != id);
            }
        }
        let mut removed = 0;
        for gid in subtree {
            if let Some(group) = self.groups.remove(&gid) {
                for eid in group.entries {
                    if self.entries.remove(&eid).is_some() {
                        self.deleted.insert(eid, at);
                        removed += 1;
                    }
                }
                self.deleted.insert(gid, at);
                removed += 1;
            }
            if self.meta.recycle_bin == Some(gid) {
                self.meta.recycle_bin = None;
            }
        }
        debug!(group = %id, removed, "group deleted permanently");
        removed
    }

    // ── Attachments and icons ────────────────────────────────────────────────

    pub fn set_attachment(&mut self, entry: Uuid, name: &str, data: Vec<u8>) -> TreeResult<bool> {
        if !self.entries.contains_key(&entry) {
            return Err(TreeError::UnknownEntry(entry));
        }
        let id = self.binaries.insert(data);
        self.edit_entry(entry, |e| {
            e.attachments.insert(name.to_string(), id);
        })
    }

    pub fn remove_attachment(&mut self, entry: Uuid, name: &str) -> TreeResult<bool> {
        self.edit_entry(entry, |e| {
            e.attachments.remove(name);
        })
    }

    pub fn add_custom_icon(&mut self, data: Vec<u8>, name: Option<String>) -> Uuid {
        let uuid = Uuid::new_v4();
        self.meta.custom_icons.push(CustomIcon {
            uuid,
            data,
            name,
            last_modification: kw_core::time::now(),
        });
        uuid
    }

    /// Drop binaries no entry or history item references; returns how many.
    pub fn prune_binaries(&mut self) -> usize {
        let mut referenced = BTreeSet::new();
        for entry in self.entries.values() {
            referenced.extend(entry.attachments.values().cloned());
            for item in &entry.history {
                referenced.extend(item.attachments.values().cloned());
            }
        }
        self.binaries.retain_referenced(&referenced)
    }

    // ── Low-level access for the merge engine and codecs ────────────────────

    pub(crate) fn binaries_mut(&mut self) -> &mut BinaryPool {
        &mut self.binaries
    }

    pub(crate) fn group_mut(&mut self, id: Uuid) -> Option<&mut Group> {
        self.groups.get_mut(&id)
    }

    pub(crate) fn entry_mut(&mut self, id: Uuid) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    /// Keep the newest deletion time per uuid.
    pub(crate) fn record_tombstone(&mut self, id: Uuid, at: DateTime<Utc>) {
        let slot = self.deleted.entry(id).or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }

    /// Overwrite a group's properties, keeping its links.
    pub(crate) fn replace_group_properties(&mut self, source: &Group) {
        if let Some(target) = self.groups.get_mut(&source.uuid) {
            let parent = target.parent;
            let groups = std::mem::take(&mut target.groups);
            let entries = std::mem::take(&mut target.entries);
            *target = source.detached();
            target.parent = parent;
            target.groups = groups;
            target.entries = entries;
        }
    }

    /// Overwrite an entry wholesale (history included), keeping its parent.
    pub(crate) fn replace_entry(&mut self, mut entry: Entry) {
        if let Some(target) = self.entries.get_mut(&entry.uuid) {
            entry.parent = target.parent;
            *target = entry;
        }
    }

    /// Move without touching `location_changed`.
    pub(crate) fn relocate_group(&mut self, id: Uuid, new_parent: Uuid) -> TreeResult<()> {
        if id == self.root {
            return Err(TreeError::RootImmutable);
        }
        if self.is_descendant_of(new_parent, id) {
            return Err(TreeError::Cycle(id));
        }
        self.relink_group(id, new_parent);
        Ok(())
    }

    pub(crate) fn relocate_entry(&mut self, id: Uuid, new_parent: Uuid) {
        self.relink_entry(id, new_parent);
    }
}
