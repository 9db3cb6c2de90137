use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use drive_lib::{DriveError, DrivePath, DriveResult};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub const LOCK_TOKEN_PREFIX: &str = "opaquelocktoken:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockDepth {
    /// The path itself.
    Zero,
    /// The path and everything below it.
    Infinity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockScope {
    Exclusive,
    Shared,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRequest {
    pub depth: LockDepth,
    pub scope: LockScope,
    pub owner: Option<String>,
}

impl LockRequest {
    pub fn exclusive(depth: LockDepth) -> Self {
        Self {
            depth,
            scope: LockScope::Exclusive,
            owner: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub token: String,
    pub path: DrivePath,
    pub depth: LockDepth,
    pub scope: LockScope,
    pub owner: Option<String>,
    pub timeout: Duration,
    pub expires_at: Instant,
}

impl LockInfo {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// True when this lock applies to `path`.
    pub fn covers(&self, path: &DrivePath) -> bool {
        *path == self.path
            || (self.depth == LockDepth::Infinity && path.is_descendant_of(&self.path))
    }

    fn overlaps(&self, path: &DrivePath, depth: LockDepth) -> bool {
        self.covers(path) || (depth == LockDepth::Infinity && self.path.is_descendant_of(path))
    }

    fn conflicts_with(&self, path: &DrivePath, request: &LockRequest) -> bool {
        self.overlaps(path, request.depth)
            && (self.scope == LockScope::Exclusive || request.scope == LockScope::Exclusive)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockMgrConfig {
    /// Timeout used when the client does not ask for one.
    pub default_timeout_secs: u64,
    /// Upper bound on any granted timeout.
    pub max_timeout_secs: u64,
}

impl Default for LockMgrConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            max_timeout_secs: 3600,
        }
    }
}

/// In-memory lock table. Locks are keyed by path so unrelated paths never
/// contend; nothing survives a restart.
pub struct LockMgr {
    config: LockMgrConfig,
    by_path: DashMap<DrivePath, Vec<LockInfo>>,
    // Lock order: a `by_path` guard may be held while touching `token_paths`,
    // never the other way round.
    token_paths: DashMap<String, DrivePath>,
}

impl LockMgr {
    pub fn new(config: LockMgrConfig) -> Self {
        Self {
            config,
            by_path: DashMap::new(),
            token_paths: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LockMgrConfig {
        &self.config
    }

    /// Number of lock entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.token_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_paths.is_empty()
    }

    fn grant_timeout(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_secs(self.config.max_timeout_secs.max(1));
        requested
            .unwrap_or(Duration::from_secs(self.config.default_timeout_secs))
            .clamp(Duration::from_secs(1), max)
    }

    fn new_token() -> String {
        format!("{}{}", LOCK_TOKEN_PREFIX, uuid::Uuid::new_v4())
    }

    /// Live locks that overlap (`path`, `depth`), skipping `exclude`.
    fn overlapping(
        &self,
        path: &DrivePath,
        depth: LockDepth,
        exclude: Option<&str>,
        now: Instant,
    ) -> Vec<LockInfo> {
        let mut out = Vec::new();
        let mut keep = |lock: &LockInfo| {
            if !lock.is_expired(now)
                && exclude != Some(lock.token.as_str())
                && lock.overlaps(path, depth)
            {
                out.push(lock.clone());
            }
        };

        let mut cursor = Some(path.clone());
        while let Some(p) = cursor {
            if let Some(locks) = self.by_path.get(&p) {
                locks.iter().for_each(&mut keep);
            }
            cursor = p.parent();
        }
        if depth == LockDepth::Infinity {
            for entry in self.by_path.iter() {
                if entry.key().is_descendant_of(path) {
                    entry.value().iter().for_each(&mut keep);
                }
            }
        }
        out
    }

    /// Grant a new lock on `path` unless a live lock conflicts with it.
    pub fn create_lock(
        &self,
        path: &DrivePath,
        request: LockRequest,
        requested_timeout: Option<Duration>,
    ) -> DriveResult<LockInfo> {
        let now = Instant::now();
        if let Some(held) = self
            .overlapping(path, request.depth, None, now)
            .into_iter()
            .find(|l| l.conflicts_with(path, &request))
        {
            return Err(DriveError::Conflict(format!(
                "{} is locked by {} at {}",
                path, held.token, held.path
            )));
        }

        let timeout = self.grant_timeout(requested_timeout);
        let lock = LockInfo {
            token: Self::new_token(),
            path: path.clone(),
            depth: request.depth,
            scope: request.scope,
            owner: request.owner.clone(),
            timeout,
            expires_at: now + timeout,
        };
        {
            let mut locks = self.by_path.entry(path.clone()).or_default();
            // Expired entries at this path are reclaimed here.
            locks.retain(|l| {
                let live = !l.is_expired(now);
                if !live {
                    self.token_paths.remove(&l.token);
                }
                live
            });
            locks.push(lock.clone());
            self.token_paths.insert(lock.token.clone(), path.clone());
        }

        // A racing creator on an overlapping path may have inserted between
        // our check and insert; if either sees the other, ours backs out.
        fence(Ordering::SeqCst);
        let raced = self
            .overlapping(path, request.depth, Some(&lock.token), now)
            .into_iter()
            .any(|l| l.conflicts_with(path, &request));
        if raced {
            self.remove_token(&lock.token);
            return Err(DriveError::Conflict(format!(
                "{} was locked concurrently",
                path
            )));
        }

        info!(
            "lock: granted {:?} {:?} lock {} on {} for {}s",
            lock.scope,
            lock.depth,
            lock.token,
            path,
            timeout.as_secs()
        );
        Ok(lock)
    }

    /// Extend a live lock. An expired token is reclaimed and reported as `Expired`.
    pub fn refresh_lock(
        &self,
        token: &str,
        requested_timeout: Option<Duration>,
    ) -> DriveResult<LockInfo> {
        self.refresh(token, None, requested_timeout)
    }

    /// `refresh_lock` for a request on `target`: expiry is reported first,
    /// then a lock that does not cover `target` is a `Conflict` and stays
    /// as it was.
    pub fn refresh_lock_on(
        &self,
        target: &DrivePath,
        token: &str,
        requested_timeout: Option<Duration>,
    ) -> DriveResult<LockInfo> {
        self.refresh(token, Some(target), requested_timeout)
    }

    fn refresh(
        &self,
        token: &str,
        target: Option<&DrivePath>,
        requested_timeout: Option<Duration>,
    ) -> DriveResult<LockInfo> {
        let path = self.token_path(token)?;
        let now = Instant::now();
        let timeout = self.grant_timeout(requested_timeout);
        let refreshed = {
            let mut locks = self
                .by_path
                .get_mut(&path)
                .ok_or_else(|| DriveError::NotFound(format!("lock {}", token)))?;
            let lock = locks
                .iter_mut()
                .find(|l| l.token == token)
                .ok_or_else(|| DriveError::NotFound(format!("lock {}", token)))?;
            if lock.is_expired(now) {
                None
            } else if target.is_some_and(|t| !lock.covers(t)) {
                return Err(DriveError::Conflict(format!(
                    "lock {} does not cover {}",
                    token,
                    target.map(|t| t.to_string()).unwrap_or_default()
                )));
            } else {
                lock.timeout = timeout;
                lock.expires_at = now + timeout;
                Some(lock.clone())
            }
        };
        match refreshed {
            Some(lock) => {
                debug!("lock: refreshed {} for {}s", token, timeout.as_secs());
                Ok(lock)
            }
            None => {
                self.remove_token(token);
                Err(DriveError::Expired(format!("lock {} has expired", token)))
            }
        }
    }

    /// Check that `token` is a live lock applying to `path`.
    pub fn confirm_lock(&self, path: &DrivePath, token: &str) -> DriveResult<LockInfo> {
        let lock = self.live_lock(token)?;
        if !lock.covers(path) {
            return Err(DriveError::Conflict(format!(
                "lock {} does not cover {}",
                token, path
            )));
        }
        Ok(lock)
    }

    pub fn release_lock(&self, token: &str) -> DriveResult<()> {
        let lock = self.live_lock(token)?;
        self.remove_token(token);
        info!("lock: released {} on {}", token, lock.path);
        Ok(())
    }

    /// Check that a mutation of `path` presents a token for every live lock
    /// applying to it. With `include_descendants`, locks below `path` count too.
    pub fn confirm_write(
        &self,
        path: &DrivePath,
        tokens: &[String],
        include_descendants: bool,
    ) -> DriveResult<()> {
        let depth = if include_descendants {
            LockDepth::Infinity
        } else {
            LockDepth::Zero
        };
        let now = Instant::now();
        for lock in self.overlapping(path, depth, None, now) {
            if !tokens.iter().any(|t| *t == lock.token) {
                return Err(DriveError::Conflict(format!(
                    "{} is locked by {}",
                    path, lock.token
                )));
            }
        }
        Ok(())
    }

    /// Live locks that apply to `path`.
    pub fn locks_covering(&self, path: &DrivePath) -> Vec<LockInfo> {
        self.overlapping(path, LockDepth::Zero, None, Instant::now())
    }

    pub fn get_lock(&self, token: &str) -> Option<LockInfo> {
        self.live_lock(token).ok()
    }

    /// Re-key locks on `from` and below it to the matching paths under `to`.
    pub fn move_locks(&self, from: &DrivePath, to: &DrivePath) -> usize {
        let keys: Vec<DrivePath> = self
            .by_path
            .iter()
            .filter(|e| e.key().is_same_or_descendant_of(from))
            .map(|e| e.key().clone())
            .collect();
        let mut moved = 0;
        for old in keys {
            let Some(new_path) = old.rebase(from, to) else {
                continue;
            };
            let Some((_, locks)) = self.by_path.remove(&old) else {
                continue;
            };
            let mut target = self.by_path.entry(new_path.clone()).or_default();
            for mut lock in locks {
                lock.path = new_path.clone();
                self.token_paths.insert(lock.token.clone(), new_path.clone());
                target.push(lock);
                moved += 1;
            }
        }
        if moved > 0 {
            info!("lock: moved {} locks from {} to {}", moved, from, to);
        }
        moved
    }

    /// Drop locks on `path` and below it, after the resource is deleted.
    pub fn remove_locks_under(&self, path: &DrivePath) -> usize {
        let keys: Vec<DrivePath> = self
            .by_path
            .iter()
            .filter(|e| e.key().is_same_or_descendant_of(path))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if let Some((_, locks)) = self.by_path.remove(&key) {
                for lock in locks {
                    self.token_paths.remove(&lock.token);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("lock: dropped {} locks under {}", removed, path);
        }
        removed
    }

    /// Drop every expired lock. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.by_path.retain(|_, locks| {
            locks.retain(|l| {
                if l.is_expired(now) {
                    expired.push(l.token.clone());
                    false
                } else {
                    true
                }
            });
            !locks.is_empty()
        });
        for token in &expired {
            self.token_paths.remove(token);
        }
        if !expired.is_empty() {
            debug!("lock: swept {} expired locks", expired.len());
        }
        expired.len()
    }

    fn token_path(&self, token: &str) -> DriveResult<DrivePath> {
        self.token_paths
            .get(token)
            .map(|p| p.value().clone())
            .ok_or_else(|| DriveError::NotFound(format!("lock {}", token)))
    }

    /// The lock for `token` if it exists and has not expired. Expired
    /// entries are removed and reported as `NotFound`.
    fn live_lock(&self, token: &str) -> DriveResult<LockInfo> {
        let path = self.token_path(token)?;
        let lock = self
            .by_path
            .get(&path)
            .and_then(|locks| locks.iter().find(|l| l.token == token).cloned())
            .ok_or_else(|| DriveError::NotFound(format!("lock {}", token)))?;
        if lock.is_expired(Instant::now()) {
            self.remove_token(token);
            return Err(DriveError::NotFound(format!("lock {} has expired", token)));
        }
        Ok(lock)
    }

    fn remove_token(&self, token: &str) {
        let Some((_, path)) = self.token_paths.remove(token) else {
            return;
        };
        if let Some(mut locks) = self.by_path.get_mut(&path) {
            locks.retain(|l| l.token != token);
        }
        self.by_path.remove_if(&path, |_, locks| locks.is_empty());
    }
}
