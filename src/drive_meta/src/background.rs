// ========== Maintenance ==========

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::drive_fs::DriveFs;
use crate::lock_mgr::LockMgr;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub listings: usize,
    pub locks: usize,
}

/// One pass over the expiring state: stale directory listings and dead locks.
pub fn sweep_once(fs: &DriveFs, locks: &LockMgr) -> SweepStats {
    SweepStats {
        listings: fs.sweep_cache(),
        locks: locks.sweep_expired(),
    }
}

/// Periodic sweeper. The task stops when this handle is dropped.
pub struct Maintenance {
    handle: Option<JoinHandle<()>>,
}

impl Maintenance {
    pub fn start(fs: DriveFs, locks: Arc<LockMgr>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; nothing has expired yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = sweep_once(&fs, &locks);
                if stats.listings > 0 || stats.locks > 0 {
                    info!(
                        "maintenance: dropped {} listings, {} locks",
                        stats.listings, stats.locks
                    );
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
