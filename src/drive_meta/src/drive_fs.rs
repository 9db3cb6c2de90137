use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashSet;
use drive_lib::{
    ContentReader, DriveError, DriveNode, DrivePath, DriveResult, MetadataUpdate, NodeKind,
    ObjectId, ObjectStore,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, ReadBuf};

use crate::dir_cache::{DirCache, DEFAULT_MAX_LISTINGS};
use crate::edge_locks::{EdgeKey, EdgeLocks};
use crate::file_writer::{Committed, DriveFileWriter, WriteMode};
use crate::path_resolver::{Freshness, PathResolver};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveFsConfig {
    /// How long read paths may trust a cached listing.
    #[serde(alias = "cache_ttl")]
    pub cache_ttl_secs: u64,
    /// How old a cached listing may be before mutations re-list.
    pub write_window_ms: u64,
    pub cache_max_entries: usize,
    /// Upper bound on one buffered upload.
    pub max_write_size: u64,
}

impl Default for DriveFsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            write_window_ms: 1000,
            cache_max_entries: DEFAULT_MAX_LISTINGS,
            max_write_size: 256 * 1024 * 1024,
        }
    }
}

impl DriveFsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn write_window(&self) -> Duration {
        Duration::from_millis(self.write_window_ms)
    }
}

pub(crate) struct FsCore {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) resolver: PathResolver,
    pub(crate) cache: Arc<DirCache>,
    pub(crate) config: DriveFsConfig,
    edges: EdgeLocks,
    reserved: Arc<DashSet<EdgeKey>>,
}

/// Holds a create-exclusive claim on one (parent, name) slot until dropped.
pub(crate) struct Reservation {
    key: EdgeKey,
    reserved: Arc<DashSet<EdgeKey>>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reserved.remove(&self.key);
    }
}

/// Content stream opened by `DriveFs::open_for_read`.
pub struct DriveReader {
    pub node: DriveNode,
    pub range: Option<Range<u64>>,
    reader: ContentReader,
}

impl DriveReader {
    /// Bytes this reader yields.
    pub fn content_length(&self) -> u64 {
        match &self.range {
            None => self.node.size,
            Some(r) => r.end.min(self.node.size).saturating_sub(r.start),
        }
    }

    pub fn into_inner(self) -> ContentReader {
        self.reader
    }
}

impl AsyncRead for DriveReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.reader.as_mut().poll_read(cx, buf)
    }
}

/// Filesystem view over the object store: stat, list, read, buffered write,
/// mkdir, remove and rename by path.
#[derive(Clone)]
pub struct DriveFs {
    core: Arc<FsCore>,
}

impl DriveFs {
    pub fn new(store: Arc<dyn ObjectStore>, config: DriveFsConfig) -> Self {
        let cache = Arc::new(DirCache::new(config.cache_ttl(), config.cache_max_entries));
        let resolver = PathResolver::new(store.clone(), cache.clone(), config.write_window());
        info!(
            "drive fs: root {}, cache ttl {}s, write window {}ms",
            resolver.root_id(),
            config.cache_ttl_secs,
            config.write_window_ms
        );
        Self {
            core: Arc::new(FsCore {
                store,
                resolver,
                cache,
                config,
                edges: EdgeLocks::new(),
                reserved: Arc::new(DashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &DriveFsConfig {
        &self.core.config
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.core.resolver
    }

    pub fn cache(&self) -> &Arc<DirCache> {
        &self.core.cache
    }

    /// Drop expired directory listings. Returns how many were dropped.
    pub fn sweep_cache(&self) -> usize {
        self.core.cache.sweep_expired()
    }

    /// Current metadata for `path`. Size and modification time come from
    /// the store, not from the cached listing.
    pub async fn stat(&self, path: &DrivePath) -> DriveResult<DriveNode> {
        let core = &self.core;
        if path.is_root() {
            return core.store.get_metadata(core.resolver.root_id()).await;
        }
        let (parent, name) = core.resolver.resolve_parent(path).await?;
        let cached = core
            .resolver
            .lookup_child(&parent.id, &name, Freshness::Cached)
            .await?
            .ok_or_else(|| DriveError::NotFound(format!("path not found: {}", path)))?;

        match core.store.get_metadata(&cached.id).await {
            Ok(fresh) if fresh.name == name && fresh.has_parent(&parent.id) => {
                core.cache.upsert_child(&parent.id, fresh.clone());
                Ok(fresh)
            }
            Ok(_) | Err(DriveError::NotFound(_)) => {
                debug!("drive fs: {} moved or deleted remotely, re-listing", path);
                core.cache.invalidate(&parent.id);
                core.resolver
                    .lookup_child(&parent.id, &name, Freshness::Authoritative)
                    .await?
                    .ok_or_else(|| DriveError::NotFound(format!("path not found: {}", path)))
            }
            Err(err) => Err(err),
        }
    }

    /// Children of the directory at `path`, listed from the store.
    pub async fn list_children(&self, path: &DrivePath) -> DriveResult<Vec<DriveNode>> {
        let core = &self.core;
        let dir = core.resolver.resolve(path, Freshness::Reconcile).await?;
        if !dir.is_dir() {
            return Err(DriveError::NotADirectory(format!("not a directory: {}", path)));
        }
        core.resolver.list_dir(&dir.id, Freshness::Authoritative).await
    }

    /// Open the file at `path` for reading, optionally limited to `range`.
    pub async fn open_for_read(
        &self,
        path: &DrivePath,
        range: Option<Range<u64>>,
    ) -> DriveResult<DriveReader> {
        let node = self.stat(path).await?;
        if node.is_dir() {
            return Err(DriveError::IsADirectory(format!("is a directory: {}", path)));
        }
        let reader = self
            .core
            .store
            .download_content(&node.id, range.clone())
            .await?;
        Ok(DriveReader {
            node,
            range,
            reader,
        })
    }

    /// Start a buffered write. Nothing reaches the store until
    /// `DriveFileWriter::close`.
    pub async fn open_for_write(
        &self,
        path: &DrivePath,
        mode: WriteMode,
    ) -> DriveResult<DriveFileWriter> {
        let core = &self.core;
        if path.is_root() {
            return Err(DriveError::IsADirectory("cannot write to root".to_string()));
        }
        let (parent, name) = core.resolver.resolve_parent(path).await?;
        let existing = core
            .resolver
            .lookup_child(&parent.id, &name, Freshness::Reconcile)
            .await?;
        if let Some(node) = &existing {
            if node.is_dir() {
                return Err(DriveError::IsADirectory(format!("is a directory: {}", path)));
            }
            if mode == WriteMode::CreateExclusive {
                return Err(DriveError::AlreadyExists(format!("already exists: {}", path)));
            }
        }

        let reservation = if mode == WriteMode::CreateExclusive {
            let key = (parent.id.clone(), name.clone());
            if !core.reserved.insert(key.clone()) {
                return Err(DriveError::AlreadyExists(format!(
                    "exclusive create in progress: {}",
                    path
                )));
            }
            Some(Reservation {
                key,
                reserved: core.reserved.clone(),
            })
        } else {
            None
        };

        Ok(DriveFileWriter::new(
            self.core.clone(),
            path.clone(),
            parent.id,
            name,
            mode,
            reservation,
        ))
    }

    /// Create the directory at `path`. The parent must exist.
    pub async fn mkdir(&self, path: &DrivePath) -> DriveResult<DriveNode> {
        let core = &self.core;
        if path.is_root() {
            return Err(DriveError::AlreadyExists("root already exists".to_string()));
        }
        let (parent, name) = core.resolver.resolve_parent(path).await?;
        let _edge = core.edges.lock((parent.id.clone(), name.clone())).await;
        if core
            .resolver
            .lookup_child(&parent.id, &name, Freshness::Reconcile)
            .await?
            .is_some()
        {
            return Err(DriveError::AlreadyExists(format!("already exists: {}", path)));
        }
        let id = core.store.allocate_id().await?;
        let node = core
            .store
            .create_object(&id, &parent.id, &name, NodeKind::Dir)
            .await?;
        core.cache.upsert_child(&parent.id, node.clone());
        core.cache.put(node.id.clone(), Vec::new());
        info!("drive fs: mkdir {} -> {}", path, node.id);
        Ok(node)
    }

    /// Remove the file or empty directory at `path`. An object linked under
    /// several parents only loses the link this path goes through.
    pub async fn remove(&self, path: &DrivePath) -> DriveResult<()> {
        let core = &self.core;
        if path.is_root() {
            return Err(DriveError::InvalidParam("cannot remove root".to_string()));
        }
        let (parent, name) = core.resolver.resolve_parent(path).await?;
        let _edge = core.edges.lock((parent.id.clone(), name.clone())).await;
        let node = core
            .resolver
            .lookup_child(&parent.id, &name, Freshness::Reconcile)
            .await?
            .ok_or_else(|| DriveError::NotFound(format!("path not found: {}", path)))?;

        if node.is_dir() {
            let children = core.resolver.list_dir(&node.id, Freshness::Authoritative).await?;
            if !children.is_empty() {
                return Err(DriveError::DirectoryNotEmpty(format!(
                    "{} has {} entries",
                    path,
                    children.len()
                )));
            }
        }

        let current = match core.store.get_metadata(&node.id).await {
            Ok(current) => current,
            Err(err) => {
                if err.is_not_found() {
                    core.cache.remove_child(&parent.id, &node.id);
                }
                return Err(err);
            }
        };
        if current.parents.len() > 1 {
            let update = MetadataUpdate {
                remove_parent: Some(parent.id.clone()),
                ..Default::default()
            };
            core.store.update_metadata(&node.id, &update).await?;
            info!("drive fs: unlinked {} ({}) from {}", path, node.id, parent.id);
        } else {
            core.store.delete_object(&node.id).await?;
            info!("drive fs: deleted {} ({})", path, node.id);
        }

        core.cache.remove_child(&parent.id, &node.id);
        if node.is_dir() {
            core.cache.invalidate(&node.id);
        }
        Ok(())
    }

    /// Check everything `rename(from, to)` requires except a free
    /// destination: neither side is root, `to` is not inside `from`, the
    /// source exists and the destination's parent is a directory. Callers
    /// that replace the destination run this before touching it.
    pub async fn check_rename(&self, from: &DrivePath, to: &DrivePath) -> DriveResult<()> {
        self.rename_sides(from, to).await?;
        self.stat(from).await?;
        Ok(())
    }

    async fn rename_sides(
        &self,
        from: &DrivePath,
        to: &DrivePath,
    ) -> DriveResult<((DriveNode, String), (DriveNode, String))> {
        let core = &self.core;
        if from.is_root() || to.is_root() {
            return Err(DriveError::InvalidParam("cannot rename root".to_string()));
        }
        if from != to && to.is_descendant_of(from) {
            return Err(DriveError::InvalidParam(format!(
                "cannot move {} into itself at {}",
                from, to
            )));
        }
        let src = core.resolver.resolve_parent(from).await?;
        let dst = core.resolver.resolve_parent(to).await?;
        Ok((src, dst))
    }

    /// Move `from` to `to` with one metadata update, keeping the object id.
    /// An occupied destination is never overwritten.
    pub async fn rename(&self, from: &DrivePath, to: &DrivePath) -> DriveResult<DriveNode> {
        let core = &self.core;
        let ((src_parent, src_name), (dst_parent, dst_name)) = self.rename_sides(from, to).await?;
        if from == to {
            return self.stat(from).await;
        }
        let (_g1, _g2) = core
            .edges
            .lock_pair(
                (src_parent.id.clone(), src_name.clone()),
                (dst_parent.id.clone(), dst_name.clone()),
            )
            .await;

        let src = core
            .resolver
            .lookup_child(&src_parent.id, &src_name, Freshness::Reconcile)
            .await?
            .ok_or_else(|| DriveError::NotFound(format!("path not found: {}", from)))?;
        if core
            .resolver
            .lookup_child(&dst_parent.id, &dst_name, Freshness::Reconcile)
            .await?
            .is_some()
        {
            return Err(DriveError::AlreadyExists(format!("already exists: {}", to)));
        }

        let mut update = MetadataUpdate::default();
        if src_name != dst_name {
            update.name = Some(dst_name.clone());
        }
        if src_parent.id != dst_parent.id {
            update.add_parent = Some(dst_parent.id.clone());
            update.remove_parent = Some(src_parent.id.clone());
        }
        let node = core.store.update_metadata(&src.id, &update).await?;

        core.cache.remove_child(&src_parent.id, &src.id);
        core.cache.upsert_child(&dst_parent.id, node.clone());
        info!("drive fs: renamed {} -> {} ({})", from, to, node.id);
        Ok(node)
    }
}

impl FsCore {
    /// Upload buffered content for (parent, name), re-checking the slot
    /// against the store first. A new file is created with its content in
    /// a single store call.
    pub(crate) async fn commit(
        &self,
        parent: &ObjectId,
        name: &str,
        mode: WriteMode,
        data: Bytes,
    ) -> DriveResult<Committed> {
        let _edge = self.edges.lock((parent.clone(), name.to_string())).await;
        let existing = self
            .resolver
            .lookup_child(parent, name, Freshness::Authoritative)
            .await?;

        let (node, created) = match existing {
            Some(node) if node.is_dir() => {
                return Err(DriveError::IsADirectory(format!("{} is a directory", name)));
            }
            Some(_) if mode == WriteMode::CreateExclusive => {
                return Err(DriveError::AlreadyExists(format!(
                    "{} appeared under {} before commit",
                    name, parent
                )));
            }
            Some(node) => (self.store.upload_content(&node.id, data).await?, false),
            None => {
                let id = self.store.allocate_id().await?;
                let node = self
                    .store
                    .create_with_content(&id, parent, name, data)
                    .await?;
                (node, true)
            }
        };

        self.cache.upsert_child(parent, node.clone());
        debug!(
            "drive fs: committed {} bytes to {}/{} ({}, created: {})",
            node.size, parent, name, node.id, created
        );
        Ok(Committed { node, created })
    }
}
