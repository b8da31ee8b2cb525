//! Upload scheduler - bounded worker pool with per-path exclusivity
//!
//! Settled [`PendingSync`] entries are submitted here and executed against
//! the [`IRemoteStore`] by a fixed pool of worker tasks.
//!
//! ## Per-path ordering
//!
//! A path enters the in-flight map when it is queued and leaves it only when
//! its work is finished (success, permanent failure or abandoned retry).
//! While a path is in flight, newer submissions for it are parked; only the
//! latest parked state is kept. Finishing a path promotes its parked state
//! to the ready queue, so the remote store sees states in the order they
//! were finalized.
//!
//! ## Retries
//!
//! Transient failures are retried after an exponential backoff, on a timer
//! task so the worker is free for other paths. A retry is abandoned if a
//! newer state of the path was parked in the meantime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dirsync_core::domain::{RelativePath, RemoteKey, RemotePrefix};
use dirsync_core::ports::IRemoteStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coalescer::{PendingSink, PendingSync};
use crate::retry::{is_transient_error, RetryPolicy};
use crate::snapshot::{FileStamp, SyncedSnapshot};
use crate::stats::SyncCounters;
use crate::{SyncError, SyncFailure};

// ============================================================================
// Types
// ============================================================================

/// A path that currently owns its slot in the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightUpload {
    pub path: RelativePath,
    /// Remote key the path maps to
    pub key: RemoteKey,
    /// When the current attempt was queued or started
    pub started_at: DateTime<Utc>,
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub local_root: PathBuf,
    pub prefix: RemotePrefix,
    pub worker_count: usize,
    pub retry: RetryPolicy,
}

/// Outcome of a single successful attempt
enum Applied {
    Uploaded(FileStamp),
    Deleted,
    Skipped(&'static str),
}

#[derive(Default)]
struct SchedulerState {
    in_flight: HashMap<RelativePath, InFlightUpload>,
    parked: HashMap<RelativePath, PendingSync>,
}

/// State shared by the scheduler handle, its workers and retry timers
struct Shared {
    config: SchedulerConfig,
    store: Arc<dyn IRemoteStore>,
    snapshot: Arc<SyncedSnapshot>,
    counters: Arc<SyncCounters>,
    failures: mpsc::UnboundedSender<SyncFailure>,
    state: Mutex<SchedulerState>,
    ready_tx: mpsc::UnboundedSender<PendingSync>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingSync>>,
    in_flight_count: watch::Sender<usize>,
    cancel: CancellationToken,
}

// ============================================================================
// UploadScheduler
// ============================================================================

/// Handle to a running worker pool
pub struct UploadScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl UploadScheduler {
    /// Spawns `config.worker_count` workers on the current runtime
    pub fn start(
        config: SchedulerConfig,
        store: Arc<dyn IRemoteStore>,
        snapshot: Arc<SyncedSnapshot>,
        counters: Arc<SyncCounters>,
        failures: mpsc::UnboundedSender<SyncFailure>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (in_flight_count, _) = watch::channel(0usize);
        let worker_count = config.worker_count.max(1);

        info!(
            workers = worker_count,
            max_attempts = config.retry.max_attempts,
            prefix = %config.prefix,
            "Starting upload scheduler"
        );

        let shared = Arc::new(Shared {
            config,
            store,
            snapshot,
            counters,
            failures,
            state: Mutex::new(SchedulerState::default()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            in_flight_count,
            cancel: CancellationToken::new(),
        });

        let workers = (0..worker_count)
            .map(|id| tokio::spawn(worker_loop(id, shared.clone())))
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queues a settled path, or parks it behind in-flight work for the same path
    pub fn submit(&self, pending: PendingSync) {
        self.shared.submit(pending);
    }

    /// Number of paths queued, running or waiting on a retry
    pub fn in_flight_count(&self) -> usize {
        *self.shared.in_flight_count.borrow()
    }

    /// Current in-flight entries, in no particular order
    pub fn in_flight(&self) -> Vec<InFlightUpload> {
        self.shared.lock_state().in_flight.values().cloned().collect()
    }

    /// Waits until no path is in flight
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        let mut count_rx = self.shared.in_flight_count.subscribe();
        let idle = async move { count_rx.wait_for(|count| *count == 0).await.is_ok() };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, idle).await.unwrap_or(false),
            None => idle.await,
        }
    }

    /// Stops the workers
    ///
    /// Idle workers exit on their own. With `abort` set, workers still busy
    /// are aborted and pending retry timers are dropped.
    pub async fn shutdown(&self, abort: bool) {
        self.shared.cancel.cancel();
        let workers = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };

        for handle in &workers {
            if abort {
                handle.abort();
            }
        }
        for handle in workers {
            let _ = handle.await;
        }
        debug!("Upload scheduler stopped");
    }
}

impl PendingSink for UploadScheduler {
    fn submit(&self, pending: PendingSync) {
        UploadScheduler::submit(self, pending);
    }
}

// ============================================================================
// Workers
// ============================================================================

async fn worker_loop(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "Upload worker started");

    loop {
        let next = {
            let mut ready_rx = shared.ready_rx.lock().await;
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => None,
                job = ready_rx.recv() => job,
            }
        };

        let Some(job) = next else {
            break;
        };
        shared.execute(job).await;
    }

    debug!(worker = id, "Upload worker exiting");
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish_count(&self, state: &SchedulerState) {
        self.in_flight_count.send_replace(state.in_flight.len());
    }

    fn enqueue(&self, state: &mut SchedulerState, job: PendingSync) {
        if let Err(err) = self.ready_tx.send(job) {
            let job = err.0;
            warn!(path = %job.path, "Ready queue closed, dropping job");
            state.in_flight.remove(&job.path);
            state.parked.remove(&job.path);
        }
    }

    fn submit(&self, pending: PendingSync) {
        let mut state = self.lock_state();

        if state.in_flight.contains_key(&pending.path) {
            debug!(
                path = %pending.path,
                kind = %pending.kind,
                "Path in flight, deferring newer state"
            );
            state.parked.insert(pending.path.clone(), pending);
            return;
        }

        state.in_flight.insert(
            pending.path.clone(),
            InFlightUpload {
                path: pending.path.clone(),
                key: self.config.prefix.key_for(&pending.path),
                started_at: Utc::now(),
            },
        );
        self.enqueue(&mut state, pending);
        self.publish_count(&state);
    }

    /// Releases `path`, promoting its parked state if there is one
    fn finish(&self, path: &RelativePath) {
        let mut state = self.lock_state();
        self.release_locked(&mut state, path);
        self.publish_count(&state);
    }

    fn release_locked(&self, state: &mut SchedulerState, path: &RelativePath) {
        match state.parked.remove(path) {
            Some(next) => {
                debug!(path = %path, kind = %next.kind, "Promoting deferred state");
                if let Some(entry) = state.in_flight.get_mut(path) {
                    entry.started_at = Utc::now();
                }
                self.enqueue(state, next);
            }
            None => {
                state.in_flight.remove(path);
            }
        }
    }

    fn has_parked(&self, path: &RelativePath) -> bool {
        self.lock_state().parked.contains_key(path)
    }

    /// Puts a retry back on the ready queue unless a newer state superseded it
    fn requeue_retry(&self, job: PendingSync) {
        let mut state = self.lock_state();
        if state.parked.contains_key(&job.path) {
            info!(path = %job.path, attempt = job.attempt, "Abandoning stale retry");
            self.counters.inc_superseded();
            self.release_locked(&mut state, &job.path);
            self.publish_count(&state);
            return;
        }
        if let Some(entry) = state.in_flight.get_mut(&job.path) {
            entry.started_at = Utc::now();
        }
        self.enqueue(&mut state, job);
    }

    async fn execute(self: &Arc<Self>, mut job: PendingSync) {
        let key = self.config.prefix.key_for(&job.path);
        let local = job.path.to_local(&self.config.local_root);
        job.attempt += 1;

        debug!(path = %job.path, kind = %job.kind, attempt = job.attempt, key = %key, "Executing sync");

        let result = if job.kind.is_delete() {
            self.store.delete(&key).await.map(|()| Applied::Deleted)
        } else {
            self.upload(&job.path, &local, &key).await
        };

        match result {
            Ok(Applied::Uploaded(stamp)) => {
                info!(path = %job.path, attempt = job.attempt, size = stamp.size, "Uploaded");
                self.snapshot.record(job.path.clone(), stamp);
                self.counters.inc_uploaded();
            }
            Ok(Applied::Deleted) => {
                info!(path = %job.path, attempt = job.attempt, "Deleted remote object");
                self.snapshot.remove(&job.path);
                self.counters.inc_deleted();
            }
            Ok(Applied::Skipped(reason)) => {
                debug!(path = %job.path, reason, "Skipping upload");
            }
            Err(err) => {
                if !job.kind.is_delete() && !local_exists(&local).await {
                    debug!(path = %job.path, error = %err, "Local file vanished during upload");
                } else if is_transient_error(&err) && self.config.retry.allows_another(job.attempt) {
                    self.schedule_retry(job, err);
                    return;
                } else {
                    self.report_failure(&job, err);
                }
            }
        }

        self.finish(&job.path);
    }

    async fn upload(
        &self,
        path: &RelativePath,
        local: &Path,
        key: &RemoteKey,
    ) -> anyhow::Result<Applied> {
        let metadata = match tokio::fs::metadata(local).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Applied::Skipped("local file no longer exists"));
            }
            Err(err) => return Err(err.into()),
        };
        if metadata.is_dir() {
            return Ok(Applied::Skipped("path is a directory"));
        }

        let stamp = FileStamp::from_metadata(&metadata);
        // A rescan can re-submit a path whose upload was still running
        if stamp.mtime.is_some() && !self.snapshot.is_changed(path, &stamp) {
            return Ok(Applied::Skipped("unchanged since last sync"));
        }
        self.store.upload(local, key).await?;
        Ok(Applied::Uploaded(stamp))
    }

    fn schedule_retry(self: &Arc<Self>, job: PendingSync, err: anyhow::Error) {
        if self.has_parked(&job.path) {
            info!(path = %job.path, attempt = job.attempt, "Newer state pending, dropping retry");
            self.counters.inc_superseded();
            self.finish(&job.path);
            return;
        }

        let delay = self.config.retry.delay_for(job.attempt);
        let transient = SyncError::TransientUpload {
            path: job.path.clone(),
            reason: format!("{err:#}"),
        };
        warn!(
            path = %job.path,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %transient,
            "Sync failed, retrying"
        );
        self.counters.inc_retries();

        let shared = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.cancel.cancelled() => {
                    debug!(path = %job.path, "Scheduler stopping, dropping retry timer");
                }
                _ = tokio::time::sleep(delay) => shared.requeue_retry(job),
            }
        });
    }

    fn report_failure(&self, job: &PendingSync, err: anyhow::Error) {
        let error = SyncError::PermanentSyncFailure {
            path: job.path.clone(),
            attempts: job.attempt,
            reason: format!("{err:#}"),
        };
        warn!(path = %job.path, attempts = job.attempt, error = %error, "Giving up on path");
        self.counters.inc_failures();
        let _ = self.failures.send(SyncFailure {
            path: job.path.clone(),
            error,
        });
    }
}

async fn local_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(true)
}

// ============================================================================
// Unit tests
// ============================================================================
