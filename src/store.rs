use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
        mpsc::{self, Receiver, Sender},
    },
};

use thiserror::Error;
use tracing::debug;

use crate::{
    domain::{ApiServer, GroupingCriterion, Item, ItemId, ItemKind},
    query::{FetchedSection, ItemQuery},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("the item store is unavailable")]
    Unavailable,
    #[error("item {0} is no longer in the store")]
    ItemNotFound(ItemId),
}

/// Object-level changes reported by the store after one write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub inserted: BTreeSet<ItemId>,
    pub deleted: BTreeSet<ItemId>,
    pub updated: BTreeSet<ItemId>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }

    /// Fold a later batch into this one.
    pub fn merge(&mut self, later: ChangeBatch) {
        for id in later.deleted {
            self.inserted.remove(&id);
            self.updated.remove(&id);
            self.deleted.insert(id);
        }
        for id in later.inserted {
            self.deleted.remove(&id);
            self.inserted.insert(id);
        }
        for id in later.updated {
            if !self.inserted.contains(&id) {
                self.updated.insert(id);
            }
        }
    }
}

/// Read side of the store: the query engine the list layer consumes.
pub trait ItemSource {
    fn fetch(&self, query: &ItemQuery) -> Result<Vec<FetchedSection>, StoreError>;

    fn count(&self, query: &ItemQuery) -> Result<usize, StoreError> {
        Ok(self
            .fetch(query)?
            .iter()
            .map(|section| section.items.len())
            .sum())
    }

    fn item(&self, id: &ItemId) -> Result<Option<Item>, StoreError>;

    /// The item owning the comment with the given id.
    fn comment_parent(&self, comment_id: &str) -> Result<Option<Item>, StoreError>;

    fn repo_groups(&self) -> Result<Vec<String>, StoreError>;

    fn servers(&self) -> Result<Vec<ApiServer>, StoreError>;

    /// Flattened page of a query, in display order.
    fn page(&self, query: &ItemQuery, offset: usize, limit: usize) -> Result<Vec<Item>, StoreError> {
        Ok(self
            .fetch(query)?
            .into_iter()
            .flat_map(|section| section.items)
            .skip(offset)
            .take(limit)
            .collect())
    }
}

/// Number of unread, unmuted items of a kind under a criterion.
pub fn badge_count<S: ItemSource + ?Sized>(
    source: &S,
    kind: ItemKind,
    criterion: Option<&GroupingCriterion>,
) -> Result<usize, StoreError> {
    source.count(
        &ItemQuery::new(kind)
            .with_criterion(criterion.cloned())
            .only_unread(),
    )
}

/// Full store contract: reads, writes and change notification.
pub trait ItemStore: ItemSource + Send + Sync {
    fn update(&self, id: &ItemId, change: &mut dyn FnMut(&mut Item)) -> Result<(), StoreError>;

    /// Apply `change` to every listed item that still exists; returns how many were touched.
    fn update_many(
        &self,
        ids: &[ItemId],
        change: &mut dyn FnMut(&mut Item),
    ) -> Result<usize, StoreError>;

    fn delete(&self, ids: &[ItemId]) -> Result<usize, StoreError>;

    fn upsert(&self, items: Vec<Item>) -> Result<(), StoreError>;

    fn set_servers(&self, servers: Vec<ApiServer>) -> Result<(), StoreError>;

    fn subscribe(&self) -> Receiver<ChangeBatch>;

    /// Consistent, isolated copy for background readers.
    fn snapshot(&self) -> Result<StoreSnapshot, StoreError>;
}

#[derive(Clone, Debug, Default)]
pub struct StoreSnapshot {
    items: BTreeMap<ItemId, Item>,
    servers: Vec<ApiServer>,
}

impl StoreSnapshot {
    pub fn all_items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }
}

impl ItemSource for StoreSnapshot {
    fn fetch(&self, query: &ItemQuery) -> Result<Vec<FetchedSection>, StoreError> {
        Ok(query.evaluate(self.items.values()))
    }

    fn count(&self, query: &ItemQuery) -> Result<usize, StoreError> {
        Ok(self.items.values().filter(|item| query.matches(item)).count())
    }

    fn item(&self, id: &ItemId) -> Result<Option<Item>, StoreError> {
        Ok(self.items.get(id).cloned())
    }

    fn comment_parent(&self, comment_id: &str) -> Result<Option<Item>, StoreError> {
        Ok(self
            .items
            .values()
            .find(|item| item.find_comment(comment_id).is_some())
            .cloned())
    }

    fn repo_groups(&self) -> Result<Vec<String>, StoreError> {
        let groups: BTreeSet<&str> = self
            .items
            .values()
            .filter_map(|item| item.repo.group.as_deref())
            .collect();
        Ok(groups.into_iter().map(str::to_owned).collect())
    }

    fn servers(&self) -> Result<Vec<ApiServer>, StoreError> {
        Ok(self.servers.clone())
    }
}

/// In-memory store shared between the UI thread and background readers.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<StoreSnapshot>,
    subscribers: Mutex<Vec<Sender<ChangeBatch>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreSnapshot>, StoreError> {
        self.data.read().map_err(|_| StoreError::Unavailable)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreSnapshot>, StoreError> {
        self.data.write().map_err(|_| StoreError::Unavailable)
    }

    fn publish(&self, batch: ChangeBatch) {
        if batch.is_empty() {
            return;
        }
        debug!(
            inserted = batch.inserted.len(),
            deleted = batch.deleted.len(),
            updated = batch.updated.len(),
            "store changed"
        );
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(batch.clone()).is_ok());
        }
    }
}

impl ItemSource for MemoryStore {
    fn fetch(&self, query: &ItemQuery) -> Result<Vec<FetchedSection>, StoreError> {
        self.read()?.fetch(query)
    }

    fn count(&self, query: &ItemQuery) -> Result<usize, StoreError> {
        self.read()?.count(query)
    }

    fn item(&self, id: &ItemId) -> Result<Option<Item>, StoreError> {
        self.read()?.item(id)
    }

    fn comment_parent(&self, comment_id: &str) -> Result<Option<Item>, StoreError> {
        self.read()?.comment_parent(comment_id)
    }

    fn repo_groups(&self) -> Result<Vec<String>, StoreError> {
        self.read()?.repo_groups()
    }

    fn servers(&self) -> Result<Vec<ApiServer>, StoreError> {
        self.read()?.servers()
    }
}

impl ItemStore for MemoryStore {
    fn update(&self, id: &ItemId, change: &mut dyn FnMut(&mut Item)) -> Result<(), StoreError> {
        let changed = {
            let mut data = self.write()?;
            let item = data
                .items
                .get_mut(id)
                .ok_or_else(|| StoreError::ItemNotFound(id.clone()))?;
            let before = item.clone();
            change(item);
            *item != before
        };
        if changed {
            let mut batch = ChangeBatch::default();
            batch.updated.insert(id.clone());
            self.publish(batch);
        }
        Ok(())
    }

    fn update_many(
        &self,
        ids: &[ItemId],
        change: &mut dyn FnMut(&mut Item),
    ) -> Result<usize, StoreError> {
        let mut batch = ChangeBatch::default();
        let mut touched = 0;
        {
            let mut data = self.write()?;
            for id in ids {
                let Some(item) = data.items.get_mut(id) else {
                    continue;
                };
                touched += 1;
                let before = item.clone();
                change(item);
                if *item != before {
                    batch.updated.insert(id.clone());
                }
            }
        }
        self.publish(batch);
        Ok(touched)
    }

    fn delete(&self, ids: &[ItemId]) -> Result<usize, StoreError> {
        let mut batch = ChangeBatch::default();
        {
            let mut data = self.write()?;
            for id in ids {
                if data.items.remove(id).is_some() {
                    batch.deleted.insert(id.clone());
                }
            }
        }
        let removed = batch.deleted.len();
        self.publish(batch);
        Ok(removed)
    }

    fn upsert(&self, items: Vec<Item>) -> Result<(), StoreError> {
        let mut batch = ChangeBatch::default();
        {
            let mut data = self.write()?;
            for item in items {
                match data.items.get(&item.id) {
                    None => {
                        batch.inserted.insert(item.id.clone());
                    }
                    Some(existing) if *existing != item => {
                        batch.updated.insert(item.id.clone());
                    }
                    Some(_) => continue,
                }
                data.items.insert(item.id.clone(), item);
            }
        }
        self.publish(batch);
        Ok(())
    }

    fn set_servers(&self, servers: Vec<ApiServer>) -> Result<(), StoreError> {
        self.write()?.servers = servers;
        Ok(())
    }

    fn subscribe(&self) -> Receiver<ChangeBatch> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(self.read()?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::*;

    #[test]
    fn writes_notify_subscribers_with_object_level_changes() {
        let store = MemoryStore::new();
        let changes = store.subscribe();

        store
            .upsert(vec![pr("1", "One"), pr("2", "Two")])
            .expect("upsert");
        let inserted = changes.try_recv().expect("insert batch");
        assert_eq!(inserted.inserted.len(), 2);

        store
            .update(&ItemId::new("1"), &mut |item| item.muted = true)
            .expect("update");
        let updated = changes.try_recv().expect("update batch");
        assert!(updated.updated.contains(&ItemId::new("1")));

        store.delete(&[ItemId::new("2")]).expect("delete");
        let deleted = changes.try_recv().expect("delete batch");
        assert!(deleted.deleted.contains(&ItemId::new("2")));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn no_op_writes_stay_silent() {
        let store = MemoryStore::new();
        store.upsert(vec![pr("1", "One")]).expect("upsert");
        let changes = store.subscribe();
        store.upsert(vec![pr("1", "One")]).expect("upsert");
        store
            .update(&ItemId::new("1"), &mut |item| item.muted = false)
            .expect("update");
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn updating_missing_item_is_an_error() {
        let store = MemoryStore::new();
        let err = store
            .update(&ItemId::new("404"), &mut |_| {})
            .expect_err("missing item");
        assert!(matches!(err, StoreError::ItemNotFound(_)));
    }

    #[test]
    fn merge_folds_deletes_over_earlier_inserts() {
        let mut first = ChangeBatch::default();
        first.inserted.insert(ItemId::new("1"));
        first.updated.insert(ItemId::new("2"));
        let mut later = ChangeBatch::default();
        later.deleted.insert(ItemId::new("1"));
        later.updated.insert(ItemId::new("2"));
        first.merge(later);
        assert!(first.inserted.is_empty());
        assert!(first.deleted.contains(&ItemId::new("1")));
        assert!(first.updated.contains(&ItemId::new("2")));
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let store = MemoryStore::new();
        store.upsert(vec![pr("1", "One")]).expect("upsert");
        let snapshot = store.snapshot().expect("snapshot");
        store.delete(&[ItemId::new("1")]).expect("delete");
        assert!(snapshot.item(&ItemId::new("1")).expect("read").is_some());
        assert_eq!(
            badge_count(&store, ItemKind::PullRequest, None).expect("count"),
            0
        );
    }

    #[test]
    fn repo_groups_are_sorted_and_unique() {
        let store = MemoryStore::new();
        let mut a = pr("1", "One");
        a.repo.group = Some("zeta".to_owned());
        let mut b = pr("2", "Two");
        b.repo.group = Some("alpha".to_owned());
        let mut c = issue("3", "Three");
        c.repo.group = Some("zeta".to_owned());
        store.upsert(vec![a, b, c]).expect("upsert");
        assert_eq!(store.repo_groups().expect("groups"), vec!["alpha", "zeta"]);
    }
}
