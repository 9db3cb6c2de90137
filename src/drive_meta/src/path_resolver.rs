use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use drive_lib::{DriveError, DriveNode, DrivePath, DriveResult, NodeKind, ObjectId, ObjectStore};
use log::{debug, warn};

use crate::dir_cache::{DirCache, DirListing};

/// How much staleness a lookup tolerates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Any listing younger than the cache TTL. Used by reads.
    Cached,
    /// Only listings loaded within the write window. Used by mutations.
    Reconcile,
    /// Always list from the store.
    Authoritative,
}

/// Deterministic pick among same-named children: newest modification time
/// wins, equal times fall back to the smallest object id.
pub fn pick_winner(candidates: &[DriveNode]) -> Option<&DriveNode> {
    candidates
        .iter()
        .max_by_key(|n| (n.modified_at, Reverse(n.id.clone())))
}

/// Maps hierarchical paths to object ids by walking parent links, one
/// directory listing at a time.
pub struct PathResolver {
    store: Arc<dyn ObjectStore>,
    cache: Arc<DirCache>,
    root_id: ObjectId,
    write_window: Duration,
    reported_dups: DashSet<(ObjectId, String, usize)>,
}

impl PathResolver {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<DirCache>, write_window: Duration) -> Self {
        let root_id = store.root_id();
        Self {
            store,
            cache,
            root_id,
            write_window,
            reported_dups: DashSet::new(),
        }
    }

    pub fn root_id(&self) -> &ObjectId {
        &self.root_id
    }

    pub fn cache(&self) -> &Arc<DirCache> {
        &self.cache
    }

    /// Placeholder node for `/`, used when no store metadata is needed.
    pub fn root_node(&self) -> DriveNode {
        DriveNode {
            id: self.root_id.clone(),
            name: String::new(),
            kind: NodeKind::Dir,
            size: 0,
            revision: None,
            modified_at: 0,
            parents: Vec::new(),
        }
    }

    fn max_age(&self, freshness: Freshness) -> Option<Duration> {
        match freshness {
            Freshness::Cached => Some(self.cache.ttl()),
            Freshness::Reconcile => Some(self.write_window.min(self.cache.ttl())),
            Freshness::Authoritative => None,
        }
    }

    /// Children of `parent`. A miss lists the whole directory once and caches
    /// it; concurrent misses on the same parent share that call.
    pub async fn listing(
        &self,
        parent: &ObjectId,
        freshness: Freshness,
    ) -> DriveResult<Arc<DirListing>> {
        let max_age = self.max_age(freshness);
        if let Some(age) = max_age {
            if let Some(listing) = self.cache.get_fresh(parent, age) {
                return Ok(listing);
            }
        }

        let seq_at_start = self.cache.current_seq();
        let guard = self.cache.load_guard(parent);
        let _loading = guard.lock().await;

        // Someone else finished a load while we waited.
        if let Some(listing) = self.cache.get(parent) {
            if listing.seq() > seq_at_start {
                return Ok(listing);
            }
        }

        match self.store.list_children(parent).await {
            Ok(nodes) => {
                debug!("resolver: listed {} children of {}", nodes.len(), parent);
                Ok(self.cache.put(parent.clone(), nodes))
            }
            Err(err) => {
                if err.is_not_found() {
                    self.cache.invalidate(parent);
                }
                Err(err)
            }
        }
    }

    /// The child named `name` under `parent` after applying the tie-break.
    pub async fn lookup_child(
        &self,
        parent: &ObjectId,
        name: &str,
        freshness: Freshness,
    ) -> DriveResult<Option<DriveNode>> {
        let listing = self.listing(parent, freshness).await?;
        let candidates = listing.candidates(name);
        if candidates.len() > 1 {
            self.report_duplicates(parent, name, candidates);
        }
        Ok(pick_winner(candidates).cloned())
    }

    fn report_duplicates(&self, parent: &ObjectId, name: &str, candidates: &[DriveNode]) {
        let key = (parent.clone(), name.to_string(), candidates.len());
        if !self.reported_dups.insert(key) {
            return;
        }
        let ids: Vec<&str> = candidates.iter().map(|n| n.id.as_str()).collect();
        let winner = pick_winner(candidates).map(|n| n.id.as_str()).unwrap_or("");
        warn!(
            "resolver: {} objects named {:?} under {}: {:?}, using {}",
            candidates.len(),
            name,
            parent,
            ids,
            winner
        );
    }

    /// Resolve `path` to a node. Intermediate segments use cached listings;
    /// the final segment honors `freshness`.
    pub async fn resolve(&self, path: &DrivePath, freshness: Freshness) -> DriveResult<DriveNode> {
        if path.is_root() {
            return Ok(self.root_node());
        }
        let found = match self.walk(path, Freshness::Cached, freshness).await {
            // A cached intermediate may point at an object that is gone.
            Err(err) if err.is_not_found() => {
                debug!("resolver: stale walk for {}, reconciling", path);
                self.walk(path, Freshness::Reconcile, freshness).await?
            }
            other => other?,
        };
        found.ok_or_else(|| DriveError::NotFound(format!("path not found: {}", path)))
    }

    /// `Ok(None)` when a segment is absent; `Err(NotFound)` when a listed
    /// parent no longer exists in the store.
    async fn walk(
        &self,
        path: &DrivePath,
        intermediate: Freshness,
        last: Freshness,
    ) -> DriveResult<Option<DriveNode>> {
        let segments = path.components();
        let mut current = self.root_node();
        let mut parent_id: Option<ObjectId> = None;
        for (i, segment) in segments.iter().enumerate() {
            if !current.is_dir() {
                return Err(DriveError::NotADirectory(format!(
                    "{} is not a directory in {}",
                    current.name, path
                )));
            }
            let freshness = if i + 1 == segments.len() {
                last
            } else {
                intermediate
            };
            let child = match self.lookup_child(&current.id, segment, freshness).await {
                Ok(child) => child,
                Err(err) => {
                    if err.is_not_found() {
                        if let Some(parent) = &parent_id {
                            // The listing that produced `current` is stale.
                            self.cache.invalidate(parent);
                        }
                    }
                    return Err(err);
                }
            };
            match child {
                Some(child) => {
                    parent_id = Some(current.id.clone());
                    current = child;
                }
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Resolve the parent directory of `path`, returning it with the final name.
    pub async fn resolve_parent(&self, path: &DrivePath) -> DriveResult<(DriveNode, String)> {
        let (parent_path, name) = path
            .split_parent_name()
            .ok_or_else(|| DriveError::InvalidParam("root has no parent".to_string()))?;
        let parent = self.resolve(&parent_path, Freshness::Cached).await?;
        if !parent.is_dir() {
            return Err(DriveError::NotADirectory(format!(
                "parent is not a directory: {}",
                parent_path
            )));
        }
        Ok((parent, name))
    }

    /// Visible children of `dir`, one per name, sorted by name.
    pub async fn list_dir(&self, dir: &ObjectId, freshness: Freshness) -> DriveResult<Vec<DriveNode>> {
        let listing = self.listing(dir, freshness).await?;
        let mut names: Vec<&String> = listing.names().collect();
        names.sort();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let candidates = listing.candidates(name);
            if candidates.len() > 1 {
                self.report_duplicates(dir, name, candidates);
            }
            if let Some(winner) = pick_winner(candidates) {
                out.push(winner.clone());
            }
        }
        Ok(out)
    }
}
