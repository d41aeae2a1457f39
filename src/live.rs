//! Live, sectioned result set over the item store.
//!
//! Every reload fetches a fresh [`ResultSnapshot`] and diffs it against the
//! previous one. The resulting edit script follows batch-update rules:
//! deletions address the old snapshot, insertions, move targets and updates
//! address the new one.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    domain::{Item, ItemId, Section},
    query::{FetchedSection, ItemQuery},
    store::{ChangeBatch, ItemSource, StoreError},
};

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("reload failed: {0}")]
    ReloadFailed(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowPath {
    pub section: usize,
    pub row: usize,
}

impl RowPath {
    pub fn new(section: usize, row: usize) -> Self {
        Self { section, row }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotSection {
    pub section: Section,
    pub name: String,
    pub rows: Vec<ItemId>,
}

/// What the list currently shows: ordered sections of ordered rows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultSnapshot {
    pub sections: Vec<SnapshotSection>,
}

impl ResultSnapshot {
    fn from_fetch(query: &ItemQuery, fetched: &[FetchedSection]) -> Self {
        let sections = fetched
            .iter()
            .map(|bucket| SnapshotSection {
                section: bucket.section,
                name: bucket.section.display_name(query.kind).to_owned(),
                rows: bucket.items.iter().map(|item| item.id.clone()).collect(),
            })
            .collect();
        Self { sections }
    }

    pub fn row_count(&self) -> usize {
        self.sections.iter().map(|section| section.rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn id_at(&self, path: RowPath) -> Option<&ItemId> {
        self.sections.get(path.section)?.rows.get(path.row)
    }

    pub fn path_of(&self, id: &ItemId) -> Option<RowPath> {
        self.sections.iter().enumerate().find_map(|(s, section)| {
            section
                .rows
                .iter()
                .position(|row| row == id)
                .map(|r| RowPath::new(s, r))
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    SectionDeleted { index: usize },
    SectionInserted { index: usize },
    RowDeleted { at: RowPath },
    RowInserted { at: RowPath },
    RowMoved { from: RowPath, to: RowPath },
    RowUpdated { at: RowPath },
}

pub struct LiveResultSet {
    query: ItemQuery,
    snapshot: ResultSnapshot,
    items: BTreeMap<ItemId, Item>,
    failure: Option<String>,
}

impl LiveResultSet {
    pub fn new(query: ItemQuery) -> Self {
        Self {
            query,
            snapshot: ResultSnapshot::default(),
            items: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn query(&self) -> &ItemQuery {
        &self.query
    }

    pub fn snapshot(&self) -> &ResultSnapshot {
        &self.snapshot
    }

    pub fn item(&self, id: &ItemId) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.snapshot
            .sections
            .iter()
            .flat_map(|section| section.rows.iter())
            .filter_map(|id| self.items.get(id))
    }

    /// Reason of the last failed reload, cleared by the next successful one.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Replace the query and re-fetch synchronously.
    pub fn configure<S: ItemSource + ?Sized>(
        &mut self,
        store: &S,
        query: ItemQuery,
    ) -> Result<Vec<ChangeEvent>, LiveError> {
        self.query = query;
        self.reload(store, &BTreeSet::new())
    }

    /// Recompute after the store reported a batch of object-level changes.
    pub fn on_store_change<S: ItemSource + ?Sized>(
        &mut self,
        store: &S,
        batch: &ChangeBatch,
    ) -> Result<Vec<ChangeEvent>, LiveError> {
        self.reload(store, &batch.updated)
    }

    fn reload<S: ItemSource + ?Sized>(
        &mut self,
        store: &S,
        updated: &BTreeSet<ItemId>,
    ) -> Result<Vec<ChangeEvent>, LiveError> {
        let fetched = match store.fetch(&self.query) {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(error = %err, "list reload failed");
                self.snapshot = ResultSnapshot::default();
                self.items.clear();
                self.failure = Some(err.to_string());
                return Err(err.into());
            }
        };

        let next = ResultSnapshot::from_fetch(&self.query, &fetched);
        let next_items: BTreeMap<ItemId, Item> = fetched
            .into_iter()
            .flat_map(|bucket| bucket.items)
            .map(|item| (item.id.clone(), item))
            .collect();

        let changed: BTreeSet<ItemId> = next_items
            .iter()
            .filter(|(id, item)| {
                updated.contains(*id)
                    || self
                        .items
                        .get(*id)
                        .is_some_and(|previous| previous != *item)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let events = diff(&self.snapshot, &next, &changed);
        debug!(
            events = events.len(),
            rows = next.row_count(),
            "list reconciled"
        );
        self.snapshot = next;
        self.items = next_items;
        self.failure = None;
        Ok(events)
    }
}

/// Minimal edit script turning `old` into `new`.
///
/// Sections are matched by identity. Rows are matched per section; a row
/// that changed section is a delete plus an insert. Reordered rows are moves
/// unless the section set itself changed, in which case they are also
/// deletes plus inserts.
pub fn diff(
    old: &ResultSnapshot,
    new: &ResultSnapshot,
    changed: &BTreeSet<ItemId>,
) -> Vec<ChangeEvent> {
    let old_index: HashMap<Section, usize> = old
        .sections
        .iter()
        .enumerate()
        .map(|(i, section)| (section.section, i))
        .collect();
    let new_index: HashMap<Section, usize> = new
        .sections
        .iter()
        .enumerate()
        .map(|(i, section)| (section.section, i))
        .collect();

    let mut section_deletes: Vec<usize> = old
        .sections
        .iter()
        .enumerate()
        .filter(|(_, section)| !new_index.contains_key(&section.section))
        .map(|(i, _)| i)
        .collect();
    let section_inserts: Vec<usize> = new
        .sections
        .iter()
        .enumerate()
        .filter(|(_, section)| !old_index.contains_key(&section.section))
        .map(|(i, _)| i)
        .collect();
    let sections_changed = !section_deletes.is_empty() || !section_inserts.is_empty();

    let mut row_deletes = Vec::new();
    let mut row_inserts = Vec::new();
    let mut moves = Vec::new();
    let mut updates = Vec::new();

    for (new_s, new_section) in new.sections.iter().enumerate() {
        let Some(&old_s) = old_index.get(&new_section.section) else {
            continue;
        };
        let old_rows = &old.sections[old_s].rows;
        let new_rows = &new_section.rows;
        let old_pos: HashMap<&ItemId, usize> =
            old_rows.iter().enumerate().map(|(r, id)| (id, r)).collect();
        let new_pos: HashMap<&ItemId, usize> =
            new_rows.iter().enumerate().map(|(r, id)| (id, r)).collect();

        for (r, id) in old_rows.iter().enumerate() {
            if !new_pos.contains_key(id) {
                row_deletes.push(RowPath::new(old_s, r));
            }
        }
        for (r, id) in new_rows.iter().enumerate() {
            if !old_pos.contains_key(id) {
                row_inserts.push(RowPath::new(new_s, r));
            }
        }

        let common: Vec<(usize, usize)> = old_rows
            .iter()
            .enumerate()
            .filter_map(|(r, id)| new_pos.get(id).map(|&n| (r, n)))
            .collect();
        let targets: Vec<usize> = common.iter().map(|&(_, n)| n).collect();
        let stays = longest_increasing_subsequence(&targets);

        for (k, &(old_r, new_r)) in common.iter().enumerate() {
            let from = RowPath::new(old_s, old_r);
            let to = RowPath::new(new_s, new_r);
            if stays[k] {
                if changed.contains(&new_rows[new_r]) {
                    updates.push(to);
                }
            } else if sections_changed {
                row_deletes.push(from);
                row_inserts.push(to);
            } else {
                moves.push((from, to));
            }
        }
    }

    section_deletes.sort_unstable_by(|a, b| b.cmp(a));
    row_deletes.sort_unstable_by(|a, b| b.cmp(a));
    row_inserts.sort_unstable();
    moves.sort_unstable_by_key(|&(_, to)| to);
    updates.sort_unstable();

    let mut events = Vec::with_capacity(
        section_deletes.len()
            + section_inserts.len()
            + row_deletes.len()
            + row_inserts.len()
            + moves.len()
            + updates.len(),
    );
    events.extend(row_deletes.into_iter().map(|at| ChangeEvent::RowDeleted { at }));
    events.extend(
        section_deletes
            .into_iter()
            .map(|index| ChangeEvent::SectionDeleted { index }),
    );
    events.extend(
        section_inserts
            .into_iter()
            .map(|index| ChangeEvent::SectionInserted { index }),
    );
    events.extend(row_inserts.into_iter().map(|at| ChangeEvent::RowInserted { at }));
    events.extend(
        moves
            .into_iter()
            .map(|(from, to)| ChangeEvent::RowMoved { from, to }),
    );
    events.extend(updates.into_iter().map(|at| ChangeEvent::RowUpdated { at }));
    events
}

/// Flags the members of one longest strictly increasing subsequence.
fn longest_increasing_subsequence(values: &[usize]) -> Vec<bool> {
    // tails[len] = index into `values` of the smallest tail of a run of length len + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; values.len()];

    for (i, &value) in values.iter().enumerate() {
        let slot = tails.partition_point(|&t| values[t] < value);
        if slot > 0 {
            previous[i] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(i);
        } else {
            tails[slot] = i;
        }
    }

    let mut keep = vec![false; values.len()];
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        keep[i] = true;
        cursor = previous[i];
    }
    keep
}
