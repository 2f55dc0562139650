//! LRU pool of open [`SegmentStore`] handles.
//!
//! The [`CacheManager`] provides:
//! - One open database per (node, tenant) collection
//! - LRU eviction when more than `capacity` collections are open
//! - Transparent reopen of evicted collections on the next acquire
//!
//! Handles that are currently acquired are never evicted. If every open
//! handle is acquired the pool may briefly exceed capacity; it is trimmed
//! back when handles are released.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use nimbus_types::{NodeName, TenantId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::SegmentStore;

/// Default number of simultaneously open collections.
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

/// Configuration for the [`CacheManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root of the node repositories: `{repository}/{node}/databases/...`.
    pub repository_path: PathBuf,
    /// Maximum number of open collections (when none are in use).
    pub capacity: usize,
}

impl CacheConfig {
    pub fn new(repository_path: impl Into<PathBuf>) -> Self {
        Self {
            repository_path: repository_path.into(),
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

/// Identifies one collection database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub node: NodeName,
    pub tenant_id: TenantId,
}

impl std::fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node, self.tenant_id)
    }
}

/// A node in the LRU doubly-linked list.
struct LruNode {
    prev: Option<CollectionKey>,
    next: Option<CollectionKey>,
}

struct Slot {
    store: Arc<SegmentStore>,
    in_use: usize,
}

struct Pool {
    slots: HashMap<CollectionKey, Slot>,
    /// LRU tracking: key -> (prev, next) in LRU order.
    lru: HashMap<CollectionKey, LruNode>,
    /// Most recently used.
    lru_head: Option<CollectionKey>,
    /// Least recently used.
    lru_tail: Option<CollectionKey>,
    shut_down: bool,
}

impl Pool {
    fn touch(&mut self, key: &CollectionKey) {
        if self.lru_head.as_ref() == Some(key) {
            return;
        }
        self.remove_from_lru(key);
        self.add_to_lru(key.clone());
    }

    fn add_to_lru(&mut self, key: CollectionKey) {
        let node = LruNode {
            prev: None,
            next: self.lru_head.clone(),
        };

        if let Some(old_head) = &self.lru_head {
            if let Some(head_node) = self.lru.get_mut(old_head) {
                head_node.prev = Some(key.clone());
            }
        }

        self.lru.insert(key.clone(), node);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(key.clone());
        }
        self.lru_head = Some(key);
    }

    fn remove_from_lru(&mut self, key: &CollectionKey) {
        let Some(node) = self.lru.remove(key) else {
            return;
        };

        match &node.prev {
            Some(prev) => {
                if let Some(prev_node) = self.lru.get_mut(prev) {
                    prev_node.next = node.next.clone();
                }
            }
            None => self.lru_head = node.next.clone(),
        }

        match &node.next {
            Some(next) => {
                if let Some(next_node) = self.lru.get_mut(next) {
                    next_node.prev = node.prev.clone();
                }
            }
            None => self.lru_tail = node.prev,
        }
    }

    /// Closes least-recently-used idle handles until at most `target`
    /// remain open or only acquired handles are left.
    fn trim_to(&mut self, target: usize) {
        let mut cursor = self.lru_tail.clone();
        while self.slots.len() > target {
            let Some(key) = cursor else {
                break;
            };
            cursor = self.lru.get(&key).and_then(|n| n.prev.clone());

            let idle = self.slots.get(&key).is_some_and(|s| s.in_use == 0);
            if idle {
                self.remove_from_lru(&key);
                if let Some(slot) = self.slots.remove(&key) {
                    debug!(collection = %key, path = %slot.store.path().display(), "evicting collection");
                }
            }
        }
    }
}

/// LRU pool of open collection databases, shared by all services on a node.
pub struct CacheManager {
    config: CacheConfig,
    pool: Arc<Mutex<Pool>>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            pool: Arc::new(Mutex::new(Pool {
                slots: HashMap::new(),
                lru: HashMap::new(),
                lru_head: None,
                lru_tail: None,
                shut_down: false,
            })),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Path of the database file for a collection.
    pub fn database_path(&self, node: &NodeName, tenant_id: TenantId) -> PathBuf {
        self.config
            .repository_path
            .join(node.as_str())
            .join("databases")
            .join(format!("{tenant_id}.redb"))
    }

    /// Returns an open handle for the collection, opening it if needed.
    ///
    /// Fails with [`StoreError::Unavailable`] if the node repository does
    /// not exist or the database cannot be opened.
    pub fn acquire(&self, node: &NodeName, tenant_id: TenantId) -> StoreResult<StoreHandle> {
        let key = CollectionKey {
            node: node.clone(),
            tenant_id,
        };
        let mut pool = self.lock_pool()?;
        if pool.shut_down {
            return Err(StoreError::ShutDown);
        }

        if let Some(slot) = pool.slots.get_mut(&key) {
            slot.in_use += 1;
            let store = Arc::clone(&slot.store);
            pool.touch(&key);
            return Ok(self.handle(key, store));
        }

        let capacity = self.config.capacity;
        pool.trim_to(capacity.saturating_sub(1));

        let store = Arc::new(self.open_collection(&key)?);
        pool.slots.insert(
            key.clone(),
            Slot {
                store: Arc::clone(&store),
                in_use: 1,
            },
        );
        pool.add_to_lru(key.clone());
        if pool.slots.len() > capacity {
            warn!(
                open = pool.slots.len(),
                capacity, "all collections in use, cache over capacity"
            );
        }

        Ok(self.handle(key, store))
    }

    /// Returns a handle to the pool. Equivalent to dropping it.
    pub fn release(&self, handle: StoreHandle) {
        drop(handle);
    }

    /// Closes every open collection and rejects later acquires.
    ///
    /// Handles still held by callers stay usable until released.
    pub fn shutdown(&self) {
        let mut pool = match self.pool.lock() {
            Ok(pool) => pool,
            Err(poisoned) => poisoned.into_inner(),
        };
        let open = pool.slots.len();
        pool.shut_down = true;
        pool.slots.clear();
        pool.lru.clear();
        pool.lru_head = None;
        pool.lru_tail = None;
        info!(closed = open, "cache manager shut down");
    }

    /// Number of currently open collections.
    pub fn open_count(&self) -> usize {
        self.pool.lock().map_or(0, |p| p.slots.len())
    }

    pub fn is_open(&self, node: &NodeName, tenant_id: TenantId) -> bool {
        let key = CollectionKey {
            node: node.clone(),
            tenant_id,
        };
        self.pool
            .lock()
            .map(|p| p.slots.contains_key(&key))
            .unwrap_or(false)
    }

    fn lock_pool(&self) -> StoreResult<MutexGuard<'_, Pool>> {
        self.pool.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn handle(&self, key: CollectionKey, store: Arc<SegmentStore>) -> StoreHandle {
        StoreHandle {
            key,
            store: Some(store),
            pool: Arc::clone(&self.pool),
            capacity: self.config.capacity,
        }
    }

    fn open_collection(&self, key: &CollectionKey) -> StoreResult<SegmentStore> {
        let node_dir = self.config.repository_path.join(key.node.as_str());
        let unavailable = |reason: String| StoreError::Unavailable {
            collection: key.to_string(),
            reason,
        };

        if !node_dir.is_dir() {
            return Err(unavailable(format!(
                "node repository {} does not exist",
                node_dir.display()
            )));
        }

        let path = self.database_path(&key.node, key.tenant_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(e.to_string()))?;
        }

        let store =
            SegmentStore::open(&path, key.tenant_id).map_err(|e| unavailable(e.to_string()))?;
        debug!(collection = %key, path = %path.display(), "opened collection");
        Ok(store)
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("open", &self.open_count())
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

/// An acquired collection. Released back to the pool on drop.
pub struct StoreHandle {
    key: CollectionKey,
    store: Option<Arc<SegmentStore>>,
    pool: Arc<Mutex<Pool>>,
    capacity: usize,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("key", &self.key)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl StoreHandle {
    pub fn collection(&self) -> &CollectionKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        self.deref().path()
    }
}

impl Deref for StoreHandle {
    type Target = SegmentStore;

    fn deref(&self) -> &SegmentStore {
        match &self.store {
            Some(store) => store,
            // Only taken in drop.
            None => unreachable!("store handle used after release"),
        }
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        // The handle's reference goes first so an eviction below really
        // closes the database while the pool lock is held.
        let store = self.store.take();
        let Ok(mut pool) = self.pool.lock() else {
            return;
        };
        drop(store);

        if let Some(slot) = pool.slots.get_mut(&self.key) {
            slot.in_use = slot.in_use.saturating_sub(1);
        }
        if pool.slots.len() > self.capacity {
            pool.trim_to(self.capacity);
        }
    }
}
