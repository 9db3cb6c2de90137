use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use drive_lib::{DriveNode, ObjectId};
use log::debug;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default maximum number of cached directory listings.
pub const DEFAULT_MAX_LISTINGS: usize = 10000;

/// Snapshot of one directory's children as last listed from the store.
/// Names map to every child carrying that name, since the store allows duplicates.
#[derive(Clone, Debug)]
pub struct DirListing {
    children: HashMap<String, Vec<DriveNode>>,
    loaded_at: Instant,
    /// Load sequence number; later loads carry larger values.
    seq: u64,
}

impl DirListing {
    pub fn from_nodes(nodes: Vec<DriveNode>) -> Self {
        let mut children: HashMap<String, Vec<DriveNode>> = HashMap::new();
        for node in nodes {
            children.entry(node.name.clone()).or_default().push(node);
        }
        Self {
            children,
            loaded_at: Instant::now(),
            seq: 0,
        }
    }

    /// All children named exactly `name`. Case-sensitive.
    pub fn candidates(&self, name: &str) -> &[DriveNode] {
        self.children.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.children.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn without_id(&self, id: &ObjectId) -> Self {
        let mut next = self.clone();
        next.children.retain(|_, nodes| {
            nodes.retain(|n| &n.id != id);
            !nodes.is_empty()
        });
        next
    }

    fn with_node(&self, node: DriveNode) -> Self {
        let mut next = self.without_id(&node.id);
        next.children.entry(node.name.clone()).or_default().push(node);
        next
    }
}

/// Directory Cache: parent id -> listing. Entries are immutable `Arc`
/// snapshots swapped under the map's per-shard lock, so readers never see a
/// half-applied update and unrelated parents never contend.
pub struct DirCache {
    listings: DashMap<ObjectId, Arc<DirListing>>,
    /// Per-parent load guards; concurrent misses on one parent share one list call.
    loading: DashMap<ObjectId, Arc<Mutex<()>>>,
    load_seq: AtomicU64,
    ttl: Duration,
    max_entries: usize,
}

impl DirCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            listings: DashMap::new(),
            loading: DashMap::new(),
            load_seq: AtomicU64::new(0),
            ttl,
            max_entries,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    /// Sequence number of the most recent `put`. A listing whose `seq()` is
    /// greater was loaded after this call returned.
    pub fn current_seq(&self) -> u64 {
        self.load_seq.load(Ordering::SeqCst)
    }

    pub fn get(&self, parent: &ObjectId) -> Option<Arc<DirListing>> {
        self.listings.get(parent).map(|l| l.value().clone())
    }

    /// The listing for `parent` if it was loaded less than `max_age` ago.
    pub fn get_fresh(&self, parent: &ObjectId, max_age: Duration) -> Option<Arc<DirListing>> {
        let listing = self.get(parent)?;
        if listing.age() < max_age {
            Some(listing)
        } else {
            None
        }
    }

    /// Store a complete listing for `parent`, evicting the oldest one when full.
    pub fn put(&self, parent: ObjectId, nodes: Vec<DriveNode>) -> Arc<DirListing> {
        let mut listing = DirListing::from_nodes(nodes);
        listing.seq = self.load_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let listing = Arc::new(listing);
        if self.max_entries == 0 {
            return listing;
        }
        if !self.listings.contains_key(&parent) && self.listings.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.listings.insert(parent, listing.clone());
        listing
    }

    /// Record a created or updated child. Parents not cached are left alone:
    /// a partial listing must never pass for a complete one.
    pub fn upsert_child(&self, parent: &ObjectId, node: DriveNode) {
        if let Some(mut entry) = self.listings.get_mut(parent) {
            let next = entry.value().with_node(node);
            *entry.value_mut() = Arc::new(next);
        }
    }

    pub fn remove_child(&self, parent: &ObjectId, id: &ObjectId) {
        if let Some(mut entry) = self.listings.get_mut(parent) {
            let next = entry.value().without_id(id);
            *entry.value_mut() = Arc::new(next);
        }
    }

    pub fn invalidate(&self, parent: &ObjectId) {
        if self.listings.remove(parent).is_some() {
            debug!("dir cache: invalidated listing of {}", parent);
        }
    }

    pub fn clear(&self) {
        self.listings.clear();
    }

    /// Load guard for `parent`. Hold the lock while listing from the store.
    pub fn load_guard(&self, parent: &ObjectId) -> Arc<Mutex<()>> {
        self.loading
            .entry(parent.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop listings older than the TTL and idle load guards. Returns the number of listings dropped.
    pub fn sweep_expired(&self) -> usize {
        let before = self.listings.len();
        let ttl = self.ttl;
        self.listings.retain(|_, listing| listing.age() < ttl);
        self.loading.retain(|_, guard| Arc::strong_count(guard) > 1);
        before.saturating_sub(self.listings.len())
    }

    fn evict_oldest(&self) {
        let oldest = self
            .listings
            .iter()
            .min_by_key(|entry| entry.value().loaded_at())
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            debug!("dir cache: evicting listing of {}", key);
            self.listings.remove(&key);
        }
    }
}
