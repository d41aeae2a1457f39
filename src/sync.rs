//! Sync engine contract and a file-backed implementation.
//!
//! Fetching from GitHub happens elsewhere; [`CacheSync`] picks up the item
//! cache that process leaves in the data directory and folds it into the
//! store while keeping per-item local state.

use std::{
    collections::BTreeMap,
    fs, io,
    path::PathBuf,
    sync::{
        Arc,
        mpsc::{self, Receiver, TryRecvError},
    },
    thread,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    domain::{ApiServer, Item, ItemId},
    store::{ItemStore, StoreError},
};

pub trait SyncEngine {
    fn has_network_connection(&self) -> bool;

    /// Begin a refresh and return its ticket. A refresh already in flight
    /// keeps running but its result is superseded.
    fn start_refresh(&mut self) -> u64;

    fn is_refreshing(&self) -> bool;

    fn last_successful_refresh(&self) -> Option<DateTime<Utc>>;

    /// Collect finished refreshes. Only the latest ticket is ever reported.
    fn poll(&mut self) -> Vec<RefreshCompletion>;
}

#[derive(Debug)]
pub struct RefreshCompletion {
    pub ticket: u64,
    pub result: Result<SyncSummary, SyncError>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub upserted: usize,
    pub removed: usize,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not read the item cache: {0}")]
    Io(#[from] io::Error),
    #[error("the item cache is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync worker disconnected")]
    WorkerGone,
}

/// On-disk shape of the item cache.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemCache {
    pub servers: Vec<ApiServer>,
    pub items: Vec<Item>,
}

type CacheOutcome = Result<ItemCache, SyncError>;

struct PendingRead {
    ticket: u64,
    receiver: Receiver<CacheOutcome>,
}

impl PendingRead {
    fn spawn(ticket: u64, path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let outcome = (|| -> CacheOutcome {
                let contents = fs::read_to_string(&path)?;
                Ok(serde_json::from_str(&contents)?)
            })();
            let _ = tx.send(outcome);
        });
        Self {
            ticket,
            receiver: rx,
        }
    }

    fn try_take(&self) -> Option<CacheOutcome> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SyncError::WorkerGone)),
        }
    }
}

pub struct CacheSync {
    store: Arc<dyn ItemStore>,
    cache_path: PathBuf,
    next_ticket: u64,
    pending: Vec<PendingRead>,
    last_success: Option<DateTime<Utc>>,
}

impl CacheSync {
    pub fn new(store: Arc<dyn ItemStore>, cache_path: PathBuf) -> Self {
        Self {
            store,
            cache_path,
            next_ticket: 1,
            pending: Vec::new(),
            last_success: None,
        }
    }

    fn latest_ticket(&self) -> u64 {
        self.next_ticket - 1
    }

    /// Fold the cache into the store. Read state, mute and snooze stay local.
    fn merge(&self, cache: ItemCache) -> Result<SyncSummary, SyncError> {
        let snapshot = self.store.snapshot()?;
        let mut locals: BTreeMap<&ItemId, &Item> =
            snapshot.all_items().map(|item| (&item.id, item)).collect();

        let mut items = cache.items;
        for item in &mut items {
            if let Some(local) = locals.remove(&item.id) {
                item.last_read_at = local.last_read_at;
                item.alert = local.alert;
                item.muted = local.muted;
                item.snooze = local.snooze.clone();
            }
        }
        // Whatever the cache did not mention is gone upstream.
        let stale: Vec<ItemId> = locals.into_keys().cloned().collect();

        let upserted = items.len();
        self.store.set_servers(cache.servers)?;
        self.store.upsert(items)?;
        let removed = self.store.delete(&stale)?;
        Ok(SyncSummary { upserted, removed })
    }
}

impl SyncEngine for CacheSync {
    /// The cache file is the only upstream; without it there is nothing to sync.
    fn has_network_connection(&self) -> bool {
        self.cache_path.is_file()
    }

    fn start_refresh(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        debug!(ticket, path = %self.cache_path.display(), "refresh started");
        self.pending
            .push(PendingRead::spawn(ticket, self.cache_path.clone()));
        ticket
    }

    fn is_refreshing(&self) -> bool {
        !self.pending.is_empty()
    }

    fn last_successful_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    fn poll(&mut self) -> Vec<RefreshCompletion> {
        let mut finished = Vec::new();
        self.pending.retain(|job| match job.try_take() {
            None => true,
            Some(result) => {
                finished.push((job.ticket, result));
                false
            }
        });

        let latest = self.latest_ticket();
        let mut completions = Vec::new();
        for (ticket, result) in finished {
            if ticket != latest {
                debug!(ticket, latest, "superseded refresh finished");
                continue;
            }
            let result = result.and_then(|cache| self.merge(cache));
            match &result {
                Ok(summary) => {
                    self.last_success = Some(Utc::now());
                    info!(
                        ticket,
                        upserted = summary.upserted,
                        removed = summary.removed,
                        "refresh finished"
                    );
                }
                Err(err) => warn!(ticket, error = %err, "refresh failed"),
            }
            completions.push(RefreshCompletion { ticket, result });
        }
        completions
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        domain::fixtures::*,
        store::{ItemSource, MemoryStore},
    };

    fn wait_idle(sync: &mut CacheSync) -> Vec<RefreshCompletion> {
        let mut completions = Vec::new();
        for _ in 0..500 {
            completions.extend(sync.poll());
            if !sync.is_refreshing() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        completions
    }

    fn write_cache(path: &std::path::Path, items: Vec<Item>) {
        let cache = ItemCache {
            servers: Vec::new(),
            items,
        };
        fs::write(path, serde_json::to_string(&cache).expect("encode")).expect("write");
    }

    #[test]
    fn merge_keeps_local_state_and_drops_missing_items() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("items.json");
        let store = Arc::new(MemoryStore::new());
        let mut local = pr("1", "Old title");
        local.muted = true;
        local.last_read_at = at(20);
        store
            .upsert(vec![local, pr("gone", "Removed upstream")])
            .expect("seed");

        let mut fresh = pr("1", "New title");
        fresh.muted = false;
        write_cache(&path, vec![fresh, issue("2", "New issue")]);

        let mut sync = CacheSync::new(store.clone(), path);
        let ticket = sync.start_refresh();
        let completions = wait_idle(&mut sync);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].ticket, ticket);
        let summary = completions[0].result.as_ref().expect("merged");
        assert_eq!(
            *summary,
            SyncSummary {
                upserted: 2,
                removed: 1
            }
        );

        let merged = store
            .item(&ItemId::new("1"))
            .expect("read")
            .expect("present");
        assert_eq!(merged.title, "New title");
        assert!(merged.muted);
        assert_eq!(merged.last_read_at, at(20));
        assert!(store.item(&ItemId::new("gone")).expect("read").is_none());
        assert!(sync.last_successful_refresh().is_some());
    }

    #[test]
    fn only_the_latest_refresh_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("items.json");
        write_cache(&path, vec![pr("1", "One")]);
        let mut sync = CacheSync::new(Arc::new(MemoryStore::new()), path);

        sync.start_refresh();
        let second = sync.start_refresh();
        let completions = wait_idle(&mut sync);
        let tickets: Vec<u64> = completions.iter().map(|c| c.ticket).collect();
        assert_eq!(tickets, vec![second]);
    }

    #[test]
    fn missing_cache_is_a_failed_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sync = CacheSync::new(
            Arc::new(MemoryStore::new()),
            dir.path().join("absent.json"),
        );
        sync.start_refresh();
        let completions = wait_idle(&mut sync);
        assert!(matches!(completions[0].result, Err(SyncError::Io(_))));
        assert!(sync.last_successful_refresh().is_none());
    }

    #[test]
    fn connectivity_follows_the_cache_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("items.json");
        let sync = CacheSync::new(Arc::new(MemoryStore::new()), path.clone());
        assert!(!sync.has_network_connection());
        write_cache(&path, Vec::new());
        assert!(sync.has_network_connection());
    }
}
