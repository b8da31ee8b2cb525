//! Sync session - lifecycle facade over the propagation engine
//!
//! ```text
//! Initializing ──start()──→ Syncing ──stop() / watcher failure──→ Stopping ──drain──→ Stopped
//!      │                                                                              ▲
//!      └──────────────── initial sync failed / stop() before start ──────────────────┘
//! ```
//!
//! `start()` returns once the initial copy finished and the watch phase is
//! running in the background. A supervisor task owns shutdown: when the
//! coalescer exits it runs the final rescan, flushes every pending path,
//! waits for the scheduler to drain, and moves the session to `Stopped`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dirsync_core::config::Config;
use dirsync_core::domain::{
    DomainError, RemotePrefix, SessionId, SessionState, SessionStats,
};
use dirsync_core::ports::{IRemoteStore, IWatcher, WatchGuard};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::coalescer::{flush_into, CoalescerActor};
use crate::initial_sync::InitialSync;
use crate::reconcile::Reconciler;
use crate::retry::RetryPolicy;
use crate::scheduler::{SchedulerConfig, UploadScheduler};
use crate::snapshot::SyncedSnapshot;
use crate::stats::SyncCounters;
use crate::{SyncError, SyncFailure};

/// Capacity of the channel carrying rescan results into the coalescer
const RESCAN_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// SessionConfig
// ============================================================================

/// Engine settings for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub remote_dir: RemotePrefix,
    pub local_dir: PathBuf,
    pub debounce: Duration,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    pub worker_pool_size: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// `None` disables periodic rescans
    pub rescan_interval: Option<Duration>,
    pub final_rescan: bool,
    /// `None` waits for the drain indefinitely
    pub drain_timeout: Option<Duration>,
    pub initial_sync_concurrency: usize,
    pub initial_sync_retry: RetryPolicy,
}

impl SessionConfig {
    /// Defaults for everything except the two directories
    pub fn new(remote_dir: RemotePrefix, local_dir: PathBuf) -> Self {
        Self {
            remote_dir,
            local_dir,
            debounce: Duration::from_secs(2),
            max_retries: 5,
            worker_pool_size: 4,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            rescan_interval: Some(Duration::from_secs(360)),
            final_rescan: true,
            drain_timeout: None,
            initial_sync_concurrency: 4,
            initial_sync_retry: RetryPolicy::new(
                3,
                Duration::from_secs(1),
                Duration::from_secs(30),
            ),
        }
    }

    /// Derives the engine view from the file configuration
    ///
    /// # Errors
    /// Returns `SyncError::Domain` if `remote_dir` is not a usable URI
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        let sync = &config.sync;
        let initial = &config.initial_sync;
        let non_zero = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

        Ok(Self {
            remote_dir: RemotePrefix::parse(&sync.remote_dir)?,
            local_dir: sync.local_dir.clone(),
            debounce: Duration::from_millis(sync.debounce_ms),
            max_retries: sync.max_retries,
            worker_pool_size: sync.worker_pool_size,
            retry_base_delay: Duration::from_millis(sync.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(sync.retry_max_delay_ms),
            rescan_interval: non_zero(sync.rescan_interval_secs),
            final_rescan: sync.final_rescan,
            drain_timeout: non_zero(sync.drain_timeout_secs),
            initial_sync_concurrency: initial.concurrency,
            initial_sync_retry: RetryPolicy::new(
                initial.attempts,
                Duration::from_millis(initial.base_delay_ms),
                Duration::from_millis(sync.retry_max_delay_ms),
            ),
        })
    }

    /// Retry policy for uploads and deletes
    pub fn upload_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries.saturating_add(1),
            self.retry_base_delay,
            self.retry_max_delay,
        )
    }
}

// ============================================================================
// SyncSession
// ============================================================================

/// State shared between the session handle and its supervisor task
struct SessionInner {
    id: SessionId,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    counters: Arc<SyncCounters>,
    snapshot: Arc<SyncedSnapshot>,
    kick: Arc<Notify>,
    cancel: CancellationToken,
    failures_tx: Mutex<Option<mpsc::UnboundedSender<SyncFailure>>>,
    fatal: Mutex<Option<String>>,
}

impl SessionInner {
    fn transition(&self, target: SessionState) -> Result<(), DomainError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state.transition_to(target) {
            Ok(next) => {
                info!(session_id = %self.id, from = %state, to = %next, "Session state change");
                *state = next;
                true
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });
        outcome
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// A local → remote mirroring session
///
/// ```ignore
/// let session = SyncSession::new(config, store, Arc::new(NotifyWatcher::new()));
/// let mut failures = session.take_failures().unwrap();
/// session.start().await?;
/// // ...
/// session.stop().await;
/// ```
pub struct SyncSession {
    inner: Arc<SessionInner>,
    store: Arc<dyn IRemoteStore>,
    watcher: Arc<dyn IWatcher>,
    started: AtomicBool,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncFailure>>>,
}

impl SyncSession {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn IRemoteStore>,
        watcher: Arc<dyn IWatcher>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(SessionInner {
                id: SessionId::new(),
                config,
                state,
                counters: Arc::new(SyncCounters::new()),
                snapshot: Arc::new(SyncedSnapshot::new()),
                kick: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
                failures_tx: Mutex::new(Some(failures_tx)),
                fatal: Mutex::new(None),
            }),
            store,
            watcher,
            started: AtomicBool::new(false),
            failures_rx: Mutex::new(Some(failures_rx)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.current()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.counters.snapshot()
    }

    /// Takes the receiving end of the permanent-failure channel
    ///
    /// Returns `None` after the first call. The channel closes once the
    /// session is stopped.
    pub fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<SyncFailure>> {
        lock(&self.failures_rx).take()
    }

    /// Runs the initial sync, then starts watching in the background
    ///
    /// # Errors
    /// - `InvalidState` if called more than once, or after `stop()`
    /// - `InitialSync` if the remote could not be copied; the session is
    ///   then `Stopped`
    /// - `WatcherFailure` if the local directory cannot be watched
    pub async fn start(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        if self.started.swap(true, Ordering::SeqCst) || inner.current() != SessionState::Initializing
        {
            return Err(SyncError::InvalidState(DomainError::InvalidState {
                from: inner.current().to_string(),
                to: SessionState::Syncing.to_string(),
            }));
        }

        let config = &inner.config;
        info!(
            session_id = %inner.id,
            remote = %config.remote_dir,
            local = %config.local_dir.display(),
            "Starting sync session"
        );

        let initial = InitialSync::new(
            self.store.clone(),
            config.local_dir.clone(),
            config.remote_dir.clone(),
            inner.snapshot.clone(),
        )
        .with_concurrency(config.initial_sync_concurrency)
        .with_retry(config.initial_sync_retry);

        match initial.run().await {
            Ok(report) => inner.counters.add_downloaded(report.files_downloaded as u64),
            Err(err) => {
                error!(session_id = %inner.id, error = %err, "Initial sync failed");
                self.abort_start();
                return Err(err);
            }
        }

        if inner.cancel.is_cancelled() {
            info!(session_id = %inner.id, "Stopped during initial sync");
            self.abort_start();
            return Ok(());
        }

        let subscription = match self.watcher.subscribe(&config.local_dir) {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(session_id = %inner.id, error = %err, "Cannot watch local directory");
                self.abort_start();
                return Err(SyncError::WatcherFailure(format!("{err:#}")));
            }
        };

        let Some(failures_tx) = lock(&inner.failures_tx).take() else {
            return Err(SyncError::InvalidState(DomainError::InvalidState {
                from: inner.current().to_string(),
                to: SessionState::Syncing.to_string(),
            }));
        };
        inner.transition(SessionState::Syncing).map_err(SyncError::InvalidState)?;

        let (watch_rx, guard) = subscription.into_parts();
        let scheduler = Arc::new(UploadScheduler::start(
            SchedulerConfig {
                local_root: config.local_dir.clone(),
                prefix: config.remote_dir.clone(),
                worker_count: config.worker_pool_size,
                retry: config.upload_retry(),
            },
            self.store.clone(),
            inner.snapshot.clone(),
            inner.counters.clone(),
            failures_tx,
        ));

        let reconciler = Arc::new(Reconciler::new(
            config.local_dir.clone(),
            inner.snapshot.clone(),
        ));
        let (rescan_tx, rescan_rx) = mpsc::channel(RESCAN_CHANNEL_CAPACITY);
        if let Some(period) = config.rescan_interval {
            tokio::spawn(reconciler.clone().run_periodic(
                period,
                rescan_tx,
                inner.cancel.clone(),
            ));
        }

        let actor = CoalescerActor::new(
            config.debounce,
            watch_rx,
            rescan_rx,
            inner.kick.clone(),
            inner.cancel.clone(),
            scheduler.clone(),
            inner.counters.clone(),
        );

        tokio::spawn(supervise(inner.clone(), actor, scheduler, reconciler, guard));
        info!(session_id = %inner.id, "Watching for local changes");
        Ok(())
    }

    /// Stops the session and waits until every pending change is drained
    ///
    /// Idempotent: repeated and concurrent calls all return once the session
    /// is `Stopped`. On a session that was never started this only marks it
    /// `Stopped`.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            if self.inner.transition(SessionState::Stopped).is_ok() {
                lock(&self.inner.failures_tx).take();
            }
            return;
        }

        self.inner.cancel.cancel();
        self.wait_stopped().await;
    }

    /// Flushes every pending path to the scheduler without waiting for debounce
    pub fn kick(&self) {
        if self.state() == SessionState::Syncing {
            self.inner.kick.notify_one();
        }
    }

    /// Resolves once the session is `Stopped`
    ///
    /// # Errors
    /// Returns `WatcherFailure` if the session ended because the watcher
    /// failed rather than through `stop()`.
    pub async fn wait(&self) -> Result<(), SyncError> {
        self.wait_stopped().await;
        match lock(&self.inner.fatal).clone() {
            Some(reason) => Err(SyncError::WatcherFailure(reason)),
            None => Ok(()),
        }
    }

    async fn wait_stopped(&self) {
        let mut state_rx = self.inner.state.subscribe();
        let _ = state_rx.wait_for(|state| state.is_terminal()).await;
    }

    fn abort_start(&self) {
        lock(&self.inner.failures_tx).take();
        if let Err(err) = self.inner.transition(SessionState::Stopped) {
            warn!(session_id = %self.inner.id, error = %err, "Unexpected state after failed start");
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        // Background tasks keep draining on their own
        self.inner.cancel.cancel();
    }
}

/// Owns the shutdown sequence of a running session
async fn supervise(
    inner: Arc<SessionInner>,
    actor: CoalescerActor,
    scheduler: Arc<UploadScheduler>,
    reconciler: Arc<Reconciler>,
    guard: WatchGuard,
) {
    let (mut queue, outcome) = actor.run().await;

    drop(guard);
    inner.cancel.cancel();
    if let Err(err) = outcome {
        error!(session_id = %inner.id, error = %err, "Session ending after fatal error");
        *lock(&inner.fatal) = Some(match err {
            SyncError::WatcherFailure(reason) => reason,
            other => other.to_string(),
        });
    }

    if let Err(err) = inner.transition(SessionState::Stopping) {
        warn!(session_id = %inner.id, error = %err, "Unexpected state while stopping");
    }

    if inner.config.final_rescan {
        match reconciler.scan().await {
            Ok(events) => {
                for event in events {
                    inner.counters.inc_events();
                    queue.push(event, Instant::now());
                }
            }
            Err(err) => warn!(error = %err, "Final rescan failed"),
        }
    }

    let flushed = flush_into(&mut queue, scheduler.as_ref(), &inner.counters);
    info!(
        session_id = %inner.id,
        flushed,
        in_flight = scheduler.in_flight_count(),
        "Draining uploads"
    );

    let drained = scheduler.drain(inner.config.drain_timeout).await;
    if !drained {
        warn!(
            session_id = %inner.id,
            remaining = scheduler.in_flight_count(),
            "Drain timeout exceeded, abandoning remaining uploads"
        );
        for upload in scheduler.in_flight() {
            warn!(
                path = %upload.path,
                key = %upload.key,
                since = %upload.started_at,
                "Abandoned without syncing"
            );
        }
    }
    scheduler.shutdown(!drained).await;
    drop(scheduler);

    let stats = inner.counters.snapshot();
    info!(
        session_id = %inner.id,
        uploaded = stats.files_uploaded,
        deleted = stats.files_deleted,
        failures = stats.failures,
        "Session stopped"
    );
    if let Err(err) = inner.transition(SessionState::Stopped) {
        warn!(session_id = %inner.id, error = %err, "Unexpected state at shutdown");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use dirsync_core::config::ConfigBuilder;

    use super::*;

    #[test]
    fn test_from_config_defaults() {
        let config = ConfigBuilder::new()
            .remote_dir("s3://bucket/run")
            .local_dir(PathBuf::from("/data/run"))
            .build();
        let session = SessionConfig::from_config(&config).unwrap();

        assert_eq!(session.remote_dir.to_string(), "s3://bucket/run");
        assert_eq!(session.debounce, Duration::from_secs(2));
        assert_eq!(session.worker_pool_size, 4);
        assert_eq!(session.rescan_interval, Some(Duration::from_secs(360)));
        assert_eq!(session.drain_timeout, None);
        assert_eq!(session.initial_sync_retry.max_attempts, 3);
        assert_eq!(session.upload_retry().max_attempts, 6);
    }

    #[test]
    fn test_from_config_zero_disables() {
        let config = ConfigBuilder::new()
            .remote_dir("s3://bucket/run")
            .local_dir(PathBuf::from("/data/run"))
            .rescan_interval_secs(0)
            .drain_timeout_secs(15)
            .build();
        let session = SessionConfig::from_config(&config).unwrap();

        assert_eq!(session.rescan_interval, None);
        assert_eq!(session.drain_timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_from_config_rejects_bad_remote() {
        let config = ConfigBuilder::new()
            .local_dir(PathBuf::from("/data/run"))
            .build();
        assert!(matches!(
            SessionConfig::from_config(&config),
            Err(SyncError::Domain(_))
        ));
    }
}
