use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DriveError, DriveResult};

/// Opaque backing-store object identifier, stable for the object's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

/// Read-through copy of one backing-store object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveNode {
    pub id: ObjectId,
    pub name: String,
    pub kind: NodeKind,
    /// Content size in bytes, always 0 for directories.
    pub size: u64,
    /// Content hash or revision marker, when the store provides one.
    pub revision: Option<String>,
    /// Modification time in unix milliseconds.
    pub modified_at: u64,
    /// Zero parents means detached, more than one means several paths.
    pub parents: Vec<ObjectId>,
}

impl DriveNode {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn has_parent(&self, parent: &ObjectId) -> bool {
        self.parents.iter().any(|p| p == parent)
    }
}

/// Fields changed by `ObjectStore::update_metadata`. `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataUpdate {
    pub name: Option<String>,
    pub add_parent: Option<ObjectId>,
    pub remove_parent: Option<ObjectId>,
}

impl MetadataUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.add_parent.is_none() && self.remove_parent.is_none()
    }
}

/// Client-visible hierarchical path, normalized to `/a/b/c` form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrivePath(String);

impl DrivePath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Normalize a protocol path. Empty segments and `.` are dropped; `..` is rejected.
    pub fn parse(path: &str) -> DriveResult<Self> {
        let mut segments = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(DriveError::InvalidParam(format!(
                        "parent segment not allowed in path: {}",
                        path
                    )))
                }
                s => segments.push(s),
            }
        }
        Ok(Self::from_segments(&segments))
    }

    fn from_segments<S: AsRef<str>>(segments: &[S]) -> Self {
        if segments.is_empty() {
            return Self::root();
        }
        let mut out = String::new();
        for s in segments {
            out.push('/');
            out.push_str(s.as_ref());
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn components(&self) -> Vec<&str> {
        self.0.split('/').filter(|s| !s.is_empty()).collect()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.components().last().copied()
    }

    pub fn parent(&self) -> Option<DrivePath> {
        let comps = self.components();
        if comps.is_empty() {
            return None;
        }
        Some(Self::from_segments(&comps[..comps.len() - 1]))
    }

    pub fn split_parent_name(&self) -> Option<(DrivePath, String)> {
        let name = self.file_name()?.to_string();
        let parent = self.parent()?;
        Some((parent, name))
    }

    pub fn join(&self, name: &str) -> DrivePath {
        if self.is_root() {
            Self(format!("/{}", name))
        } else {
            Self(format!("{}/{}", self.0, name))
        }
    }

    /// True when `self` is a strict descendant of `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &DrivePath) -> bool {
        if self == ancestor {
            return false;
        }
        if ancestor.is_root() {
            return true;
        }
        self.0
            .strip_prefix(ancestor.as_str())
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }

    /// True when `self` equals `other` or lies below it.
    pub fn is_same_or_descendant_of(&self, other: &DrivePath) -> bool {
        self == other || self.is_descendant_of(other)
    }

    /// Re-root `self` from `old_prefix` to `new_prefix`. Returns `None` when
    /// `self` is not under `old_prefix`.
    pub fn rebase(&self, old_prefix: &DrivePath, new_prefix: &DrivePath) -> Option<DrivePath> {
        if self == old_prefix {
            return Some(new_prefix.clone());
        }
        if !self.is_descendant_of(old_prefix) {
            return None;
        }
        let old_len = old_prefix.components().len();
        let comps = self.components();
        let mut out = new_prefix.clone();
        for c in &comps[old_len..] {
            out = out.join(c);
        }
        Some(out)
    }
}

impl fmt::Display for DrivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
