use std::ops::Range;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::{DriveNode, DriveResult, MetadataUpdate, NodeKind, ObjectId};

pub type ContentReader = Pin<Box<dyn AsyncRead + Unpin + Send>>;

/// Backing cloud object store. Every call may fail with a transient
/// (retry-eligible) or permanent `DriveError`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Identifier of the top-level container all paths are rooted at.
    fn root_id(&self) -> ObjectId;

    async fn get_metadata(&self, id: &ObjectId) -> DriveResult<DriveNode>;

    /// Reserve an id for a later create.
    async fn allocate_id(&self) -> DriveResult<ObjectId>;
    /// Create an empty object under `id`. Repeating the call with the same
    /// id, parent, name and kind returns the object already created, so a
    /// create whose reply was lost can be retried without duplicating it.
    async fn create_object(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        kind: NodeKind,
    ) -> DriveResult<DriveNode>;
    /// Create a file together with its content in one call; readers never
    /// see it empty. Idempotent per id like `create_object`.
    async fn create_with_content(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        data: Bytes,
    ) -> DriveResult<DriveNode>;
    async fn update_metadata(
        &self,
        id: &ObjectId,
        update: &MetadataUpdate,
    ) -> DriveResult<DriveNode>;
    async fn delete_object(&self, id: &ObjectId) -> DriveResult<()>;

    /// Replace the whole content and commit size, hash and mtime in one call.
    async fn upload_content(&self, id: &ObjectId, data: Bytes) -> DriveResult<DriveNode>;
    /// Open a content stream, optionally limited to `range` (end exclusive).
    async fn download_content(
        &self,
        id: &ObjectId,
        range: Option<Range<u64>>,
    ) -> DriveResult<ContentReader>;

    /// Immediate children of `parent`. Fails with NotFound if the parent is gone.
    async fn list_children(&self, parent: &ObjectId) -> DriveResult<Vec<DriveNode>>;
}
