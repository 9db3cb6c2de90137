use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::{
    ContentReader, DriveError, DriveNode, DriveResult, MetadataUpdate, NodeKind, ObjectId,
    ObjectStore, RetryPolicy,
};

pub const DEFAULT_MAX_OUTBOUND: usize = 8;

/// Wraps a raw store with the retry policy and a bound on in-flight calls,
/// so concurrent requests cannot trip the store's own rate limits.
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    permits: Semaphore,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, policy: RetryPolicy, max_outbound: usize) -> Self {
        Self {
            inner,
            policy,
            permits: Semaphore::new(max_outbound.max(1)),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn permit(&self) -> DriveResult<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| DriveError::Cancelled("outbound limiter closed".to_string()))
    }
}

// The permit is taken per attempt, so a task sleeping in backoff does not
// hold a slot other tasks could use.
#[async_trait]
impl ObjectStore for RetryingStore {
    fn root_id(&self) -> ObjectId {
        self.inner.root_id()
    }

    async fn get_metadata(&self, id: &ObjectId) -> DriveResult<DriveNode> {
        self.policy
            .run("get_metadata", || async move {
                let _permit = self.permit().await?;
                self.inner.get_metadata(id).await
            })
            .await
    }

    async fn allocate_id(&self) -> DriveResult<ObjectId> {
        self.policy
            .run("allocate_id", || async move {
                let _permit = self.permit().await?;
                self.inner.allocate_id().await
            })
            .await
    }

    // Creates carry a caller-allocated id, so a retry after a lost reply
    // lands on the object the first attempt made.
    async fn create_object(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        kind: NodeKind,
    ) -> DriveResult<DriveNode> {
        self.policy
            .run("create_object", || async move {
                let _permit = self.permit().await?;
                self.inner.create_object(id, parent, name, kind).await
            })
            .await
    }

    async fn create_with_content(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        data: Bytes,
    ) -> DriveResult<DriveNode> {
        self.policy
            .run("create_with_content", || {
                let data = data.clone();
                async move {
                    let _permit = self.permit().await?;
                    self.inner.create_with_content(id, parent, name, data).await
                }
            })
            .await
    }

    async fn update_metadata(
        &self,
        id: &ObjectId,
        update: &MetadataUpdate,
    ) -> DriveResult<DriveNode> {
        self.policy
            .run("update_metadata", || async move {
                let _permit = self.permit().await?;
                self.inner.update_metadata(id, update).await
            })
            .await
    }

    async fn delete_object(&self, id: &ObjectId) -> DriveResult<()> {
        self.policy
            .run("delete_object", || async move {
                let _permit = self.permit().await?;
                self.inner.delete_object(id).await
            })
            .await
    }

    async fn upload_content(&self, id: &ObjectId, data: Bytes) -> DriveResult<DriveNode> {
        self.policy
            .run("upload_content", || {
                let data = data.clone();
                async move {
                    let _permit = self.permit().await?;
                    self.inner.upload_content(id, data).await
                }
            })
            .await
    }

    async fn download_content(
        &self,
        id: &ObjectId,
        range: Option<Range<u64>>,
    ) -> DriveResult<ContentReader> {
        self.policy
            .run("download_content", || {
                let range = range.clone();
                async move {
                    let _permit = self.permit().await?;
                    self.inner.download_content(id, range).await
                }
            })
            .await
    }

    async fn list_children(&self, parent: &ObjectId) -> DriveResult<Vec<DriveNode>> {
        self.policy
            .run("list_children", || async move {
                let _permit = self.permit().await?;
                self.inner.list_children(parent).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryObjectStore;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mem = Arc::new(MemoryObjectStore::new());
        let store = RetryingStore::new(mem.clone(), fast_policy(), 2);
        let id = store.allocate_id().await.unwrap();
        mem.inject_failure(DriveError::Transient("503".to_string()));
        mem.inject_failure(DriveError::Transient("429".to_string()));

        let node = store
            .create_object(&id, &store.root_id(), "a", NodeKind::Dir)
            .await
            .unwrap();
        assert_eq!(node.name, "a");
        assert_eq!(mem.call_count(), 4);
    }

    #[tokio::test]
    async fn test_create_retried_after_lost_reply_is_not_duplicated() {
        let mem = Arc::new(MemoryObjectStore::new());
        let store = RetryingStore::new(mem.clone(), fast_policy(), 2);
        let root = store.root_id();
        let id = store.allocate_id().await.unwrap();
        mem.inject_lost_reply(DriveError::Transient("connection reset".to_string()));

        let node = store
            .create_object(&id, &root, "a", NodeKind::Dir)
            .await
            .unwrap();
        assert_eq!(node.id, id);
        let children = store.list_children(&root).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, id);

        let fid = store.allocate_id().await.unwrap();
        mem.inject_lost_reply(DriveError::Transient("timeout".to_string()));
        let node = store
            .create_with_content(&fid, &root, "f", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(node.size, 4);
        assert_eq!(store.list_children(&root).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_attempts() {
        let mem = Arc::new(MemoryObjectStore::new());
        let store = RetryingStore::new(mem.clone(), fast_policy(), 2);
        for _ in 0..3 {
            mem.inject_failure(DriveError::Transient("503".to_string()));
        }
        let err = store.list_children(&store.root_id()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mem.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_propagates_immediately() {
        let mem = Arc::new(MemoryObjectStore::new());
        let store = RetryingStore::new(mem.clone(), fast_policy(), 2);
        mem.inject_failure(DriveError::PermissionDenied("denied".to_string()));
        let err = store.list_children(&store.root_id()).await.unwrap_err();
        assert_eq!(err, DriveError::PermissionDenied("denied".to_string()));
        assert_eq!(mem.call_count(), 1);
    }

    #[tokio::test]
    async fn test_permits_released_after_calls() {
        let mem = Arc::new(MemoryObjectStore::new());
        let store = RetryingStore::new(mem, fast_policy(), 4);
        let root = store.root_id();
        let mut handles = Vec::new();
        let store = Arc::new(store);
        for i in 0..16 {
            let store = store.clone();
            let root = root.clone();
            handles.push(tokio::spawn(async move {
                let id = store.allocate_id().await?;
                store
                    .create_object(&id, &root, &format!("f{}", i), NodeKind::File)
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.available_permits(), 4);
        assert_eq!(store.list_children(&root).await.unwrap().len(), 16);
    }
}
