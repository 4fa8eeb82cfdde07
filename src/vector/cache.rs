//! Process-wide cache of loaded subreddit indexes.
//!
//! Each subreddit key owns a slot holding a once-initialised entry and a load
//! lock. The first caller for a key loads from the [`IndexSource`]; callers
//! arriving during that load block on the slot's lock and then read the
//! outcome. Only the slot is locked during a load; the map itself is held
//! just long enough to find or create the slot.
//!
//! A failed load is handed to the callers that waited on it, and its slot is
//! unmapped before the lock is released. Callers arriving afterwards get a
//! fresh slot and try again, so a later build makes the next `get` succeed
//! without a restart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{IndexError, IndexResult};
use crate::vector::ivf::IvfFlatIndex;
use crate::vector::storage::{IndexStamp, IndexStore, StoredIndex};
use crate::vector::types::{IdTable, validate_subreddit};

/// Where the cache loads indexes from.
pub trait IndexSource: Send + Sync {
    fn load(&self, subreddit: &str) -> IndexResult<StoredIndex>;

    /// Version stamp of the current persisted index, read cheaply.
    fn stamp(&self, subreddit: &str) -> IndexResult<IndexStamp>;
}

impl IndexSource for IndexStore {
    fn load(&self, subreddit: &str) -> IndexResult<StoredIndex> {
        IndexStore::load(self, subreddit)
    }

    fn stamp(&self, subreddit: &str) -> IndexResult<IndexStamp> {
        IndexStore::stamp(self, subreddit)
    }
}

/// A loaded index shared read-only by every query for its subreddit.
#[derive(Debug)]
pub struct CacheEntry {
    pub subreddit: String,
    pub index: IvfFlatIndex,
    pub ids: IdTable,
    pub stamp: IndexStamp,
    pub built_at: DateTime<Utc>,
}

#[derive(Default)]
struct Slot {
    entry: OnceLock<Arc<CacheEntry>>,
    /// Guards the load; holds the error once this slot's load has failed
    load_lock: Mutex<Option<IndexError>>,
}

/// Subreddit name to loaded index, with at most one load in flight per key.
pub struct IndexCache {
    source: Arc<dyn IndexSource>,
    slots: DashMap<String, Arc<Slot>>,
    loads: AtomicUsize,
}

impl std::fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCache")
            .field("cached", &self.len())
            .field("loads", &self.loads_performed())
            .finish()
    }
}

impl IndexCache {
    pub fn new(source: Arc<dyn IndexSource>) -> Self {
        Self {
            source,
            slots: DashMap::new(),
            loads: AtomicUsize::new(0),
        }
    }

    /// Returns the cached entry for `subreddit`, loading it on first access.
    ///
    /// Blocks while another thread loads the same key. A load error
    /// (`NotFound`, `Corrupted`, `Io`) is returned to the loader and to every
    /// caller that was waiting on it; nothing is stored.
    pub fn get(&self, subreddit: &str) -> IndexResult<Arc<CacheEntry>> {
        validate_subreddit(subreddit)?;

        let slot = self.slot(subreddit);
        if let Some(entry) = slot.entry.get() {
            debug!(subreddit, "index cache hit");
            return Ok(Arc::clone(entry));
        }

        let mut failure = slot.load_lock.lock();
        if let Some(entry) = slot.entry.get() {
            debug!(subreddit, "index loaded by a concurrent caller");
            return Ok(Arc::clone(entry));
        }
        if let Some(err) = failure.as_ref() {
            debug!(subreddit, error = %err, "concurrent index load failed");
            return Err(err.clone());
        }

        self.loads.fetch_add(1, Ordering::SeqCst);
        let stored = match self.source.load(subreddit) {
            Ok(stored) => stored,
            Err(e) => {
                // Unmap while still locked so no second loader starts before
                // the waiters have seen this outcome.
                self.slots
                    .remove_if(subreddit, |_, s| Arc::ptr_eq(s, &slot));
                debug!(subreddit, error = %e, "index load failed");
                *failure = Some(e.clone());
                return Err(e);
            }
        };

        let entry = Arc::new(CacheEntry {
            subreddit: subreddit.to_string(),
            index: stored.index,
            ids: stored.ids,
            stamp: stored.stamp,
            built_at: stored.built_at,
        });
        let entry = Arc::clone(slot.entry.get_or_init(|| entry));

        info!(
            subreddit,
            vectors = entry.index.vector_count(),
            nlist = entry.index.nlist(),
            stamp = %entry.stamp,
            "index loaded into cache"
        );
        Ok(entry)
    }

    /// Drops the cached entry for `subreddit`. Returns whether one was loaded.
    ///
    /// Queries already holding the old entry finish against it.
    pub fn evict(&self, subreddit: &str) -> bool {
        let removed = self
            .slots
            .remove(subreddit)
            .is_some_and(|(_, slot)| slot.entry.get().is_some());
        if removed {
            info!(subreddit, "evicted index from cache");
        }
        removed
    }

    /// Evicts `subreddit` if the persisted index changed since it was loaded.
    ///
    /// Returns `true` when an entry was evicted. A persisted index that has
    /// disappeared also evicts. Uncached subreddits are left alone.
    pub fn refresh(&self, subreddit: &str) -> IndexResult<bool> {
        let Some(cached) = self.peek(subreddit) else {
            return Ok(false);
        };

        let stale = match self.source.stamp(subreddit) {
            Ok(stamp) => stamp != cached.stamp,
            Err(IndexError::NotFound { .. }) => true,
            Err(e) => return Err(e),
        };

        if stale {
            debug!(subreddit, old = %cached.stamp, "cached index is stale");
            self.evict(subreddit);
        }
        Ok(stale)
    }

    /// The loaded entry for `subreddit`, without triggering a load.
    pub fn peek(&self, subreddit: &str) -> Option<Arc<CacheEntry>> {
        self.slots
            .get(subreddit)
            .and_then(|slot| slot.entry.get().cloned())
    }

    /// Number of store loads attempted since creation.
    pub fn loads_performed(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of loaded entries.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.entry.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of loaded subreddits, sorted.
    pub fn cached_subreddits(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| slot.entry.get().is_some())
            .map(|slot| slot.key().clone())
            .collect();
        names.sort();
        names
    }

    fn slot(&self, subreddit: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(subreddit) {
            return Arc::clone(&slot);
        }
        Arc::clone(&self.slots.entry(subreddit.to_string()).or_default())
    }
}
