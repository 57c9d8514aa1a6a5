//! Two-way reconciliation of trees that share an ancestor
//!
//! `merge(target, source)` folds `source` into `target`:
//!
//! 1. groups, source pre-order: newer properties win, newer location relocates,
//!    source-only groups are inserted unless tombstoned in target;
//! 2. entries: newer content wins, the loser joins the history, histories are
//!    unioned by modification time;
//! 3. source tombstones delete older target items; tombstone lists are unioned;
//! 4. missing binaries, custom icons and custom data keys are copied.
//!
//! Only pairwise merge is guaranteed. Chains of merges across three or more
//! copies are deterministic but not associative.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry::Entry;
use crate::tree::Tree;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeChange {
    GroupAdded(Uuid),
    GroupUpdated(Uuid),
    GroupRelocated(Uuid),
    GroupDeleted(Uuid),
    EntryAdded(Uuid),
    EntryUpdated(Uuid),
    EntryRelocated(Uuid),
    EntryDeleted(Uuid),
    HistoryMerged(Uuid),
    BinaryCopied(String),
    CustomIconCopied(Uuid),
    CustomDataCopied(String),
}

/// Both sides changed an entry at the same instant with different content.
/// The target copy is kept; the source copy lands in its history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub entry: Uuid,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub changes: Vec<MergeChange>,
    pub conflicts: Vec<MergeConflict>,
}

impl MergeReport {
    /// Number of reconciled items shown to the user.
    pub fn reconciled(&self) -> usize {
        self.changes.len() + self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.conflicts.is_empty()
    }
}

pub fn merge(target: &mut Tree, source: &Tree) -> MergeReport {
    let mut report = MergeReport::default();

    copy_binaries(target, source, &mut report);
    merge_groups(target, source, &mut report);
    merge_entries(target, source, &mut report);
    apply_deletions(target, source, &mut report);
    copy_metadata(target, source, &mut report);

    info!(
        changes = report.changes.len(),
        conflicts = report.conflicts.len(),
        "merge complete"
    );
    report
}

/// Where a source node's parent lands in the target: the nearest source
/// ancestor present in target, or the target root.
fn mapped_parent(target: &Tree, source: &Tree, mut parent: Option<Uuid>) -> Uuid {
    while let Some(id) = parent {
        if id == source.root_id() {
            break;
        }
        if target.group(id).is_some() {
            return id;
        }
        parent = source.group(id).and_then(|g| g.parent());
    }
    target.root_id()
}

/// Whether `target` has a tombstone for `id` at or after `modified`.
fn tombstoned(target: &Tree, id: Uuid, modified: DateTime<Utc>) -> bool {
    target.tombstone(id).is_some_and(|at| at >= modified)
}

// ── Step 1: groups ───────────────────────────────────────────────────────────

fn merge_groups(target: &mut Tree, source: &Tree, report: &mut MergeReport) {
    let source_root = source.root_id();
    if source_root == target.root_id() {
        merge_group_properties(target, source, source_root, report);
    }

    for id in source.group_ids_preorder(source_root).into_iter().skip(1) {
        let Some(group) = source.group(id) else {
            continue;
        };
        let parent = mapped_parent(target, source, group.parent());

        if target.group(id).is_some() {
            merge_group_properties(target, source, id, report);
            relocate_group(target, source, id, parent, report);
            continue;
        }
        if target.entry(id).is_some() {
            warn!(id = %id, "source group id is an entry in target, skipped");
            continue;
        }
        if tombstoned(target, id, group.times.last_modification) {
            debug!(group = %id, "source group deleted in target");
            continue;
        }
        match target.add_group(parent, group.detached()) {
            Ok(_) => report.changes.push(MergeChange::GroupAdded(id)),
            Err(e) => warn!(group = %id, error = %e, "could not insert group"),
        }
    }
}

fn merge_group_properties(target: &mut Tree, source: &Tree, id: Uuid, report: &mut MergeReport) {
    let (Some(theirs), Some(ours)) = (source.group(id), target.group(id)) else {
        return;
    };
    if theirs.times.last_modification <= ours.times.last_modification {
        return;
    }
    let location_changed = ours.times.location_changed;
    target.replace_group_properties(theirs);
    if let Some(group) = target.group_mut(id) {
        group.times.location_changed = location_changed;
    }
    report.changes.push(MergeChange::GroupUpdated(id));
}

fn relocate_group(
    target: &mut Tree,
    source: &Tree,
    id: Uuid,
    parent: Uuid,
    report: &mut MergeReport,
) {
    let (Some(theirs), Some(ours)) = (source.group(id), target.group(id)) else {
        return;
    };
    let moved_at = theirs.times.location_changed;
    if moved_at <= ours.times.location_changed || ours.parent() == Some(parent) {
        return;
    }
    match target.relocate_group(id, parent) {
        Ok(()) => {
            if let Some(group) = target.group_mut(id) {
                group.times.location_changed = moved_at;
            }
            report.changes.push(MergeChange::GroupRelocated(id));
        }
        Err(e) => warn!(group = %id, error = %e, "relocation skipped"),
    }
}

// ── Step 2: entries ──────────────────────────────────────────────────────────

fn merge_entries(target: &mut Tree, source: &Tree, report: &mut MergeReport) {
    for theirs in source.iter_entries() {
        let id = theirs.uuid;
        let parent = mapped_parent(target, source, theirs.parent());

        if target.entry(id).is_some() {
            merge_entry_content(target, theirs, report);
            relocate_entry(target, theirs, parent, report);
            continue;
        }
        if target.group(id).is_some() {
            warn!(id = %id, "source entry id is a group in target, skipped");
            continue;
        }
        if tombstoned(target, id, theirs.times.last_modification) {
            debug!(entry = %id, "source entry deleted in target");
            continue;
        }
        match target.add_entry(parent, theirs.clone()) {
            Ok(_) => {
                target.trim_history(id);
                report.changes.push(MergeChange::EntryAdded(id));
            }
            Err(e) => warn!(entry = %id, error = %e, "could not insert entry"),
        }
    }
}

fn merge_entry_content(target: &mut Tree, theirs: &Entry, report: &mut MergeReport) {
    let id = theirs.uuid;
    let Some(ours) = target.entry(id) else {
        return;
    };
    let ours_time = ours.times.last_modification;
    let theirs_time = theirs.times.last_modification;

    // History items keyed by modification time; target copies are inserted
    // first and win ties.
    let mut items: BTreeMap<DateTime<Utc>, Entry> = BTreeMap::new();
    for item in &ours.history {
        items.entry(item.times.last_modification).or_insert_with(|| item.clone());
    }

    let (mut winner, source_won, conflict) = if theirs_time > ours_time {
        items.entry(ours_time).or_insert_with(|| ours.snapshot());
        (theirs.clone(), true, false)
    } else if theirs_time < ours_time || theirs.same_content(ours) {
        if theirs_time < ours_time {
            items.entry(theirs_time).or_insert_with(|| theirs.snapshot());
        }
        (ours.clone(), false, false)
    } else {
        (ours.clone(), false, true)
    };

    for item in &theirs.history {
        items.entry(item.times.last_modification).or_insert_with(|| item.clone());
    }
    // The current state never repeats as a history item.
    let current_time = winner.times.last_modification;
    let mut history: Vec<Entry> = items
        .into_iter()
        .rev()
        .filter(|(at, item)| *at != current_time || !item.same_content(&winner))
        .map(|(_, item)| item)
        .collect();
    let conflict = conflict
        && !history
            .iter()
            .any(|h| h.times.last_modification == theirs_time && h.same_content(theirs));
    if conflict {
        history.insert(0, theirs.snapshot());
    }
    target.cap_history(&mut history);

    let history_changed = !same_history(&history, &ours.history);
    if !source_won && !history_changed {
        return;
    }
    let location_changed = ours.times.location_changed;
    winner.times.location_changed = location_changed;
    winner.history = history;
    target.replace_entry(winner);

    if source_won {
        report.changes.push(MergeChange::EntryUpdated(id));
    }
    if conflict {
        warn!(entry = %id, modified = %theirs_time, "merge conflict, kept target copy");
        report.conflicts.push(MergeConflict {
            entry: id,
            modified: theirs_time,
        });
    } else if history_changed {
        report.changes.push(MergeChange::HistoryMerged(id));
    }
}

fn same_history(a: &[Entry], b: &[Entry]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.times.last_modification == y.times.last_modification && x.same_content(y)
        })
}

fn relocate_entry(target: &mut Tree, theirs: &Entry, parent: Uuid, report: &mut MergeReport) {
    let id = theirs.uuid;
    let Some(ours) = target.entry(id) else {
        return;
    };
    let moved_at = theirs.times.location_changed;
    if moved_at <= ours.times.location_changed || ours.parent() == Some(parent) {
        return;
    }
    target.relocate_entry(id, parent);
    if let Some(entry) = target.entry_mut(id) {
        entry.times.location_changed = moved_at;
    }
    report.changes.push(MergeChange::EntryRelocated(id));
}

// ── Step 3: deletions ────────────────────────────────────────────────────────

fn apply_deletions(target: &mut Tree, source: &Tree, report: &mut MergeReport) {
    let deletable = |target: &Tree, id: Uuid, at: DateTime<Utc>| -> bool {
        let modified = target
            .entry(id)
            .map(|e| e.times.last_modification)
            .or_else(|| target.group(id).map(|g| g.times.last_modification));
        modified.is_some_and(|m| m <= at)
    };

    for deleted in source.deleted_objects() {
        let (id, at) = (deleted.uuid, deleted.deletion_time);
        if !deletable(target, id, at) {
            continue;
        }
        if target.entry(id).is_some() {
            target.remove_entry_permanently(id, at);
            report.changes.push(MergeChange::EntryDeleted(id));
            continue;
        }
        if id == target.root_id() {
            continue;
        }
        let Some(group) = target.group(id) else {
            continue;
        };
        let parent = group.parent().unwrap_or(target.root_id());

        // Children that are not themselves going away move up first.
        let doomed = |child: Uuid| {
            source
                .tombstone(child)
                .is_some_and(|t| deletable(target, child, t))
        };
        let keep_groups: Vec<Uuid> = group
            .group_ids()
            .iter()
            .copied()
            .filter(|c| !doomed(*c))
            .collect();
        let keep_entries: Vec<Uuid> = group
            .entry_ids()
            .iter()
            .copied()
            .filter(|c| !doomed(*c))
            .collect();
        for child in keep_groups {
            if let Err(e) = target.relocate_group(child, parent) {
                warn!(group = %child, error = %e, "could not rescue child group");
            }
        }
        for child in keep_entries {
            target.relocate_entry(child, parent);
        }
        target.remove_group_permanently(id, at);
        report.changes.push(MergeChange::GroupDeleted(id));
    }

    for deleted in source.deleted_objects() {
        if !target.contains(deleted.uuid) {
            target.record_tombstone(deleted.uuid, deleted.deletion_time);
        }
    }
}

// ── Step 4: shared pools and metadata ────────────────────────────────────────

fn copy_binaries(target: &mut Tree, source: &Tree, report: &mut MergeReport) {
    for (id, data) in source.binaries().iter() {
        if !target.binaries().contains(id) {
            target.binaries_mut().insert_with_id(id, data);
            report.changes.push(MergeChange::BinaryCopied(id.to_string()));
        }
    }
}

fn copy_metadata(target: &mut Tree, source: &Tree, report: &mut MergeReport) {
    let known: HashSet<Uuid> = target.meta.custom_icons.iter().map(|i| i.uuid).collect();
    for icon in &source.meta.custom_icons {
        if !known.contains(&icon.uuid) {
            target.meta.custom_icons.push(icon.clone());
            report.changes.push(MergeChange::CustomIconCopied(icon.uuid));
        }
    }

    for (key, value) in &source.meta.custom_data {
        if !target.meta.custom_data.contains_key(key) {
            target.meta.custom_data.insert(key.clone(), value.clone());
            report.changes.push(MergeChange::CustomDataCopied(key.clone()));
        }
    }

    // A recycle bin that arrived from source becomes the target's bin.
    if target.recycle_bin().is_none() {
        if let Some(bin) = source.recycle_bin().filter(|b| target.group(*b).is_some()) {
            target.meta.recycle_bin = Some(bin);
        }
    }
}
