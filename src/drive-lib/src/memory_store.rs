use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;

use crate::{
    ContentReader, DriveError, DriveNode, DriveResult, MetadataUpdate, NodeKind, ObjectId,
    ObjectStore,
};

const MEMORY_ROOT_ID: &str = "root";

struct MemObject {
    node: DriveNode,
    content: Bytes,
}

/// Scripted outcome for one upcoming store call.
enum Fault {
    Pass,
    Fail(DriveError),
    /// Apply the call, then report the error as if the reply was lost.
    LoseReply(DriveError),
}

/// In-process object store with Drive-like semantics: flat id space, parent
/// references, duplicate names allowed. Used for local runs and tests; supports
/// queued fault injection.
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectId, MemObject>>,
    faults: Mutex<VecDeque<Fault>>,
    calls: AtomicU64,
    last_ts: AtomicU64,
    rev_seq: AtomicU64,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        let store = Self {
            objects: RwLock::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            last_ts: AtomicU64::new(0),
            rev_seq: AtomicU64::new(1),
        };
        let root = DriveNode {
            id: ObjectId::new(MEMORY_ROOT_ID),
            name: String::new(),
            kind: NodeKind::Dir,
            size: 0,
            revision: None,
            modified_at: store.next_timestamp(),
            parents: Vec::new(),
        };
        if let Ok(mut objects) = store.objects.write() {
            objects.insert(
                root.id.clone(),
                MemObject {
                    node: root,
                    content: Bytes::new(),
                },
            );
        }
        store
    }

    /// Queue an error returned by the next store call (FIFO).
    pub fn inject_failure(&self, err: DriveError) {
        self.inject_failure_after(0, err);
    }

    /// Let `skip` more calls succeed, then fail one with `err`.
    pub fn inject_failure_after(&self, skip: usize, err: DriveError) {
        self.push_fault(skip, Fault::Fail(err));
    }

    /// The next call takes effect but reports `err`. Only creates honor the
    /// lost reply; any other call simply fails with `err`.
    pub fn inject_lost_reply(&self, err: DriveError) {
        self.inject_lost_reply_after(0, err);
    }

    /// Let `skip` more calls succeed, then lose the reply of the next one.
    pub fn inject_lost_reply_after(&self, skip: usize, err: DriveError) {
        self.push_fault(skip, Fault::LoseReply(err));
    }

    fn push_fault(&self, skip: usize, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.extend(std::iter::repeat_with(|| Fault::Pass).take(skip));
            faults.push_back(fault);
        }
    }

    /// Allocate an id and create an empty object in one step.
    pub async fn add_object(
        &self,
        parent: &ObjectId,
        name: &str,
        kind: NodeKind,
    ) -> DriveResult<DriveNode> {
        let id = self.allocate_id().await?;
        self.create_object(&id, parent, name, kind).await
    }

    /// Number of store calls made so far, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn content_of(&self, id: &ObjectId) -> Option<Bytes> {
        let objects = self.objects.read().ok()?;
        objects.get(id).map(|o| o.content.clone())
    }

    /// Overwrite an object's modification time, bypassing call accounting.
    pub fn set_modified_at(&self, id: &ObjectId, modified_at: u64) -> DriveResult<()> {
        let mut objects = self.write_objects()?;
        let obj = objects
            .get_mut(id)
            .ok_or_else(|| DriveError::NotFound(format!("object {}", id)))?;
        obj.node.modified_at = modified_at;
        Ok(())
    }

    /// Attach an extra parent reference, as a Drive item shared into two folders.
    pub fn add_parent_link(&self, id: &ObjectId, parent: &ObjectId) -> DriveResult<()> {
        let mut objects = self.write_objects()?;
        if !objects.contains_key(parent) {
            return Err(DriveError::NotFound(format!("parent {}", parent)));
        }
        let obj = objects
            .get_mut(id)
            .ok_or_else(|| DriveError::NotFound(format!("object {}", id)))?;
        if !obj.node.has_parent(parent) {
            obj.node.parents.push(parent.clone());
        }
        Ok(())
    }

    fn next_fault(&self) -> DriveResult<Fault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = self
            .faults
            .lock()
            .map_err(|e| DriveError::Internal(format!("lock faults: {}", e)))?
            .pop_front();
        Ok(fault.unwrap_or(Fault::Pass))
    }

    fn begin_call(&self) -> DriveResult<()> {
        match self.next_fault()? {
            Fault::Pass => Ok(()),
            Fault::Fail(err) | Fault::LoseReply(err) => {
                debug!("memory store: injected failure {}", err);
                Err(err)
            }
        }
    }

    /// Like `begin_call`, but hands back a lost-reply error to report once
    /// the call has been applied.
    fn begin_create(&self) -> DriveResult<Option<DriveError>> {
        match self.next_fault()? {
            Fault::Pass => Ok(None),
            Fault::Fail(err) => {
                debug!("memory store: injected failure {}", err);
                Err(err)
            }
            Fault::LoseReply(err) => Ok(Some(err)),
        }
    }

    fn settle(lost: Option<DriveError>, result: DriveResult<DriveNode>) -> DriveResult<DriveNode> {
        match (lost, result) {
            (Some(err), Ok(node)) => {
                debug!("memory store: applied create of {}, reply lost: {}", node.id, err);
                Err(err)
            }
            (_, result) => result,
        }
    }

    /// Insert a new object, or return the existing one when `id` was
    /// already created with the same parent, name and kind.
    fn insert_new(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        kind: NodeKind,
        content: Bytes,
    ) -> DriveResult<DriveNode> {
        if name.is_empty() || name.contains('/') {
            return Err(DriveError::InvalidParam(format!("invalid name '{}'", name)));
        }
        let modified_at = self.next_timestamp();
        let mut objects = self.write_objects()?;
        if let Some(existing) = objects.get(id) {
            let node = &existing.node;
            if node.name == name && node.kind == kind && node.has_parent(parent) {
                return Ok(node.clone());
            }
            return Err(DriveError::AlreadyExists(format!("object id {}", id)));
        }
        Self::ensure_dir(&objects, parent)?;
        let revision = match kind {
            NodeKind::File if !content.is_empty() => Some(format!(
                "rev-{}",
                self.rev_seq.fetch_add(1, Ordering::SeqCst)
            )),
            _ => None,
        };
        let node = DriveNode {
            id: id.clone(),
            name: name.to_string(),
            kind,
            size: content.len() as u64,
            revision,
            modified_at,
            parents: vec![parent.clone()],
        };
        objects.insert(
            node.id.clone(),
            MemObject {
                node: node.clone(),
                content,
            },
        );
        Ok(node)
    }

    /// Strictly increasing unix-millisecond clock.
    fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut prev = self.last_ts.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_ts
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn write_objects(
        &self,
    ) -> DriveResult<std::sync::RwLockWriteGuard<'_, HashMap<ObjectId, MemObject>>> {
        self.objects
            .write()
            .map_err(|e| DriveError::Internal(format!("lock objects: {}", e)))
    }

    fn read_objects(
        &self,
    ) -> DriveResult<std::sync::RwLockReadGuard<'_, HashMap<ObjectId, MemObject>>> {
        self.objects
            .read()
            .map_err(|e| DriveError::Internal(format!("lock objects: {}", e)))
    }

    fn ensure_dir(objects: &HashMap<ObjectId, MemObject>, id: &ObjectId) -> DriveResult<()> {
        match objects.get(id) {
            None => Err(DriveError::NotFound(format!("parent {}", id))),
            Some(obj) if !obj.node.is_dir() => {
                Err(DriveError::InvalidParam(format!("parent {} is not a folder", id)))
            }
            Some(_) => Ok(()),
        }
    }

    /// Drop `id` and every descendant left without parents.
    fn delete_recursive(objects: &mut HashMap<ObjectId, MemObject>, id: &ObjectId) {
        let mut pending = vec![id.clone()];
        while let Some(cur) = pending.pop() {
            objects.remove(&cur);
            for (child_id, child) in objects.iter_mut() {
                if child.node.has_parent(&cur) {
                    child.node.parents.retain(|p| p != &cur);
                    if child.node.parents.is_empty() {
                        pending.push(child_id.clone());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn root_id(&self) -> ObjectId {
        ObjectId::new(MEMORY_ROOT_ID)
    }

    async fn get_metadata(&self, id: &ObjectId) -> DriveResult<DriveNode> {
        self.begin_call()?;
        let objects = self.read_objects()?;
        objects
            .get(id)
            .map(|o| o.node.clone())
            .ok_or_else(|| DriveError::NotFound(format!("object {}", id)))
    }

    async fn allocate_id(&self) -> DriveResult<ObjectId> {
        self.begin_call()?;
        Ok(ObjectId::new(uuid::Uuid::new_v4().simple().to_string()))
    }

    async fn create_object(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        kind: NodeKind,
    ) -> DriveResult<DriveNode> {
        let lost = self.begin_create()?;
        Self::settle(lost, self.insert_new(id, parent, name, kind, Bytes::new()))
    }

    async fn create_with_content(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        data: Bytes,
    ) -> DriveResult<DriveNode> {
        let lost = self.begin_create()?;
        Self::settle(lost, self.insert_new(id, parent, name, NodeKind::File, data))
    }

    async fn update_metadata(
        &self,
        id: &ObjectId,
        update: &MetadataUpdate,
    ) -> DriveResult<DriveNode> {
        self.begin_call()?;
        let mut objects = self.write_objects()?;
        if let Some(parent) = update.add_parent.as_ref() {
            Self::ensure_dir(&objects, parent)?;
        }
        let obj = objects
            .get_mut(id)
            .ok_or_else(|| DriveError::NotFound(format!("object {}", id)))?;
        if let Some(name) = update.name.as_ref() {
            if name.is_empty() || name.contains('/') {
                return Err(DriveError::InvalidParam(format!("invalid name '{}'", name)));
            }
            obj.node.name = name.clone();
        }
        if let Some(parent) = update.add_parent.as_ref() {
            if !obj.node.has_parent(parent) {
                obj.node.parents.push(parent.clone());
            }
        }
        if let Some(parent) = update.remove_parent.as_ref() {
            obj.node.parents.retain(|p| p != parent);
        }
        Ok(obj.node.clone())
    }

    async fn delete_object(&self, id: &ObjectId) -> DriveResult<()> {
        self.begin_call()?;
        if *id == self.root_id() {
            return Err(DriveError::PermissionDenied("cannot delete root".to_string()));
        }
        let mut objects = self.write_objects()?;
        if !objects.contains_key(id) {
            return Err(DriveError::NotFound(format!("object {}", id)));
        }
        Self::delete_recursive(&mut objects, id);
        Ok(())
    }

    async fn upload_content(&self, id: &ObjectId, data: Bytes) -> DriveResult<DriveNode> {
        self.begin_call()?;
        let modified_at = self.next_timestamp();
        let revision = self.rev_seq.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.write_objects()?;
        let obj = objects
            .get_mut(id)
            .ok_or_else(|| DriveError::NotFound(format!("object {}", id)))?;
        if obj.node.is_dir() {
            return Err(DriveError::IsADirectory(format!("object {}", id)));
        }
        obj.node.size = data.len() as u64;
        obj.node.revision = Some(format!("rev-{}", revision));
        obj.node.modified_at = modified_at;
        obj.content = data;
        Ok(obj.node.clone())
    }

    async fn download_content(
        &self,
        id: &ObjectId,
        range: Option<Range<u64>>,
    ) -> DriveResult<ContentReader> {
        self.begin_call()?;
        let objects = self.read_objects()?;
        let obj = objects
            .get(id)
            .ok_or_else(|| DriveError::NotFound(format!("object {}", id)))?;
        if obj.node.is_dir() {
            return Err(DriveError::IsADirectory(format!("object {}", id)));
        }
        let len = obj.content.len() as u64;
        let data = match range {
            None => obj.content.clone(),
            Some(r) => {
                if r.start > len || (r.start == len && len > 0) || r.start > r.end {
                    return Err(DriveError::InvalidParam(format!(
                        "range {}..{} not satisfiable for size {}",
                        r.start, r.end, len
                    )));
                }
                let end = r.end.min(len);
                obj.content.slice(r.start as usize..end as usize)
            }
        };
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn list_children(&self, parent: &ObjectId) -> DriveResult<Vec<DriveNode>> {
        self.begin_call()?;
        let objects = self.read_objects()?;
        match objects.get(parent) {
            None => return Err(DriveError::NotFound(format!("parent {}", parent))),
            Some(obj) if !obj.node.is_dir() => return Ok(Vec::new()),
            Some(_) => {}
        }
        let mut children: Vec<DriveNode> = objects
            .values()
            .filter(|o| o.node.has_parent(parent))
            .map(|o| o.node.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(children)
    }
}
