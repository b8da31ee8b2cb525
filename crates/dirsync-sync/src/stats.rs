//! Lock-free session counters

use std::sync::atomic::{AtomicU64, Ordering};

use dirsync_core::domain::SessionStats;

/// Shared counters bumped by the engine's tasks
///
/// [`snapshot`](SyncCounters::snapshot) reads them into a plain
/// [`SessionStats`] value.
#[derive(Debug, Default)]
pub struct SyncCounters {
    files_downloaded: AtomicU64,
    events_received: AtomicU64,
    syncs_scheduled: AtomicU64,
    files_uploaded: AtomicU64,
    files_deleted: AtomicU64,
    retries: AtomicU64,
    retries_superseded: AtomicU64,
    failures: AtomicU64,
}

impl SyncCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_downloaded(&self, n: u64) {
        self.files_downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_events(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scheduled(&self) {
        self.syncs_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_uploaded(&self) {
        self.files_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deleted(&self) {
        self.files_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_superseded(&self) {
        self.retries_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            syncs_scheduled: self.syncs_scheduled.load(Ordering::Relaxed),
            files_uploaded: self.files_uploaded.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            retries_superseded: self.retries_superseded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
