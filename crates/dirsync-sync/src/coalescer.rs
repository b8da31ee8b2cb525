//! Change coalescer - debounces raw filesystem events into pending syncs
//!
//! [`ChangeCoalescer`] keeps at most one [`PendingSync`] per path. Every new
//! event for a pending path updates its kind and pushes its deadline out to
//! `now + debounce`, so a burst of writes settles into a single sync of the
//! final state.
//!
//! [`CoalescerActor`] owns the queue and runs the event loop:
//!
//! ```text
//! watcher rx ──┐
//! rescan rx ───┼──→ ChangeCoalescer ──(deadline / kick)──→ PendingSink
//! kick ────────┘
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dirsync_core::domain::{ChangeKind, FileChangeEvent, RelativePath};
use dirsync_core::ports::WatchMessage;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stats::SyncCounters;
use crate::SyncError;

// ============================================================================
// PendingSync
// ============================================================================

/// A coalesced unit of work for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSync {
    pub path: RelativePath,
    /// Latest effective kind
    pub kind: ChangeKind,
    /// Observation time of the event that set `kind`
    pub observed_at: DateTime<Utc>,
    /// When the path is considered settled
    pub deadline: Instant,
    /// Attempts already made by the scheduler
    pub attempt: u32,
}

impl PendingSync {
    fn from_event(event: FileChangeEvent, deadline: Instant) -> Self {
        Self {
            path: event.path,
            kind: event.kind,
            observed_at: event.observed_at,
            deadline,
            attempt: 0,
        }
    }

    /// Folds a later event for the same path into this entry
    ///
    /// The newer observation wins; on a timestamp tie the higher-precedence
    /// kind wins. The deadline is reset either way.
    fn absorb(&mut self, event: FileChangeEvent, deadline: Instant) {
        let newer = event.observed_at > self.observed_at
            || (event.observed_at == self.observed_at && event.kind.outranks(self.kind));
        if newer {
            self.kind = event.kind;
            self.observed_at = event.observed_at;
        }
        self.deadline = deadline;
    }
}

// ============================================================================
// ChangeCoalescer
// ============================================================================

/// Per-path debounce queue
pub struct ChangeCoalescer {
    pending: HashMap<RelativePath, PendingSync>,
    debounce: Duration,
}

impl ChangeCoalescer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce,
        }
    }

    /// Inserts or updates the pending entry for the event's path
    pub fn push(&mut self, event: FileChangeEvent, now: Instant) {
        let deadline = now + self.debounce;
        debug!(path = %event.path, kind = %event.kind, "Coalescing change event");

        match self.pending.entry(event.path.clone()) {
            Entry::Occupied(mut existing) => existing.get_mut().absorb(event, deadline),
            Entry::Vacant(slot) => {
                slot.insert(PendingSync::from_event(event, deadline));
            }
        }
    }

    /// Removes and returns every entry whose deadline has passed
    pub fn poll(&mut self, now: Instant) -> Vec<PendingSync> {
        let settled_paths: Vec<RelativePath> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.path.clone())
            .collect();

        let mut settled: Vec<PendingSync> = settled_paths
            .iter()
            .filter_map(|path| self.pending.remove(path))
            .collect();
        settled.sort_by_key(|p| p.deadline);
        settled
    }

    /// Removes and returns every entry regardless of deadline
    pub fn flush_all(&mut self) -> Vec<PendingSync> {
        let mut all: Vec<PendingSync> = self.pending.drain().map(|(_, p)| p).collect();
        all.sort_by_key(|p| p.deadline);
        all
    }

    /// Earliest deadline among pending entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn get(&self, path: &RelativePath) -> Option<&PendingSync> {
        self.pending.get(path)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// Actor
// ============================================================================

/// Receiver of settled pending syncs
pub trait PendingSink: Send + Sync {
    fn submit(&self, pending: PendingSync);
}

impl PendingSink for mpsc::UnboundedSender<PendingSync> {
    fn submit(&self, pending: PendingSync) {
        let _ = self.send(pending);
    }
}

/// Event loop that owns a [`ChangeCoalescer`]
///
/// Exits when cancelled (returning `Ok`) or when the watcher reports an error
/// or closes its channel (returning [`SyncError::WatcherFailure`]). Pending
/// entries are handed back to the caller rather than flushed, so the caller
/// decides when the final flush happens.
pub struct CoalescerActor {
    queue: ChangeCoalescer,
    watch_rx: mpsc::Receiver<WatchMessage>,
    rescan_rx: mpsc::Receiver<FileChangeEvent>,
    kick: Arc<Notify>,
    cancel: CancellationToken,
    sink: Arc<dyn PendingSink>,
    counters: Arc<SyncCounters>,
}

impl CoalescerActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        debounce: Duration,
        watch_rx: mpsc::Receiver<WatchMessage>,
        rescan_rx: mpsc::Receiver<FileChangeEvent>,
        kick: Arc<Notify>,
        cancel: CancellationToken,
        sink: Arc<dyn PendingSink>,
        counters: Arc<SyncCounters>,
    ) -> Self {
        Self {
            queue: ChangeCoalescer::new(debounce),
            watch_rx,
            rescan_rx,
            kick,
            cancel,
            sink,
            counters,
        }
    }

    pub async fn run(mut self) -> (ChangeCoalescer, Result<(), SyncError>) {
        info!(
            debounce_ms = self.queue.debounce.as_millis() as u64,
            "Change coalescer starting"
        );
        let mut rescan_open = true;

        let result = loop {
            let next_deadline = self.queue.next_deadline();
            let settle = async move {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.absorb_queued(rescan_open);
                    info!(pending = self.queue.pending_count(), "Change coalescer cancelled");
                    break Ok(());
                }

                message = self.watch_rx.recv() => match message {
                    Some(WatchMessage::Event(event)) => self.accept(event),
                    Some(WatchMessage::Error(reason)) => {
                        error!(error = %reason, "Watcher reported an error");
                        break Err(SyncError::WatcherFailure(reason));
                    }
                    None => {
                        error!("Watcher event stream closed unexpectedly");
                        break Err(SyncError::WatcherFailure(
                            "event stream closed".to_string(),
                        ));
                    }
                },

                event = self.rescan_rx.recv(), if rescan_open => match event {
                    Some(event) => self.accept(event),
                    None => rescan_open = false,
                },

                _ = settle => {
                    let settled = self.queue.poll(Instant::now());
                    self.dispatch(settled);
                }

                _ = self.kick.notified() => {
                    let all = self.queue.flush_all();
                    info!(count = all.len(), "Kick: flushing all pending paths");
                    self.dispatch(all);
                }
            }
        };

        (self.queue, result)
    }

    /// Folds events already delivered but not yet received into the queue
    fn absorb_queued(&mut self, rescan_open: bool) {
        while let Ok(message) = self.watch_rx.try_recv() {
            match message {
                WatchMessage::Event(event) => self.accept(event),
                WatchMessage::Error(reason) => {
                    warn!(error = %reason, "Watcher error while stopping, ignored");
                }
            }
        }
        if rescan_open {
            while let Ok(event) = self.rescan_rx.try_recv() {
                self.accept(event);
            }
        }
    }

    fn accept(&mut self, event: FileChangeEvent) {
        self.counters.inc_events();
        self.queue.push(event, Instant::now());
    }

    fn dispatch(&self, settled: Vec<PendingSync>) {
        for pending in settled {
            debug!(path = %pending.path, kind = %pending.kind, "Path settled");
            self.counters.inc_scheduled();
            self.sink.submit(pending);
        }
    }
}

/// Hands every remaining entry of `queue` to `sink`
pub fn flush_into(
    queue: &mut ChangeCoalescer,
    sink: &dyn PendingSink,
    counters: &SyncCounters,
) -> usize {
    let all = queue.flush_all();
    let count = all.len();
    for pending in all {
        counters.inc_scheduled();
        sink.submit(pending);
    }
    count
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn path(p: &str) -> RelativePath {
        RelativePath::new(p).unwrap()
    }

    fn event_at(p: &str, kind: ChangeKind, offset_ms: i64) -> FileChangeEvent {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        FileChangeEvent::with_timestamp(
            path(p),
            kind,
            base + ChronoDuration::milliseconds(offset_ms),
        )
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    #[test]
    fn test_push_keeps_one_entry_per_path() {
        let mut queue = ChangeCoalescer::new(Duration::from_secs(2));
        let now = Instant::now();
        queue.push(event_at("log.txt", ChangeKind::Created, 0), now);
        queue.push(event_at("log.txt", ChangeKind::Modified, 10), now);
        queue.push(event_at("log.txt", ChangeKind::Modified, 20), now);
        queue.push(event_at("other.txt", ChangeKind::Created, 0), now);

        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.get(&path("log.txt")).unwrap().kind, ChangeKind::Modified);
    }

    #[test]
    fn test_later_event_wins_by_recency() {
        let mut queue = ChangeCoalescer::new(Duration::from_secs(2));
        let now = Instant::now();
        queue.push(event_at("a.bin", ChangeKind::Deleted, 0), now);
        queue.push(event_at("a.bin", ChangeKind::Created, 5), now);

        assert_eq!(queue.get(&path("a.bin")).unwrap().kind, ChangeKind::Created);
    }

    #[test]
    fn test_tie_broken_by_precedence() {
        let mut queue = ChangeCoalescer::new(Duration::from_secs(2));
        let now = Instant::now();
        queue.push(event_at("a.bin", ChangeKind::Modified, 0), now);
        queue.push(event_at("a.bin", ChangeKind::Deleted, 0), now);
        queue.push(event_at("a.bin", ChangeKind::Created, 0), now);

        assert_eq!(queue.get(&path("a.bin")).unwrap().kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_stale_event_keeps_kind_but_resets_deadline() {
        let mut queue = ChangeCoalescer::new(Duration::from_secs(2));
        let t0 = Instant::now();
        queue.push(event_at("a.bin", ChangeKind::Deleted, 100), t0);

        let t1 = t0 + Duration::from_secs(1);
        queue.push(event_at("a.bin", ChangeKind::Modified, 50), t1);

        let pending = queue.get(&path("a.bin")).unwrap();
        assert_eq!(pending.kind, ChangeKind::Deleted);
        assert_eq!(pending.deadline, t1 + Duration::from_secs(2));
    }

    #[test]
    fn test_poll_respects_deadline() {
        let mut queue = ChangeCoalescer::new(Duration::from_millis(100));
        let now = Instant::now();
        queue.push(event_at("a.bin", ChangeKind::Created, 0), now);

        assert!(queue.poll(now).is_empty());
        assert_eq!(queue.pending_count(), 1);

        let settled = queue.poll(now + Duration::from_millis(100));
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].attempt, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_new_event_extends_window() {
        let mut queue = ChangeCoalescer::new(Duration::from_millis(100));
        let t0 = Instant::now();
        queue.push(event_at("a.bin", ChangeKind::Created, 0), t0);
        queue.push(
            event_at("a.bin", ChangeKind::Modified, 80),
            t0 + Duration::from_millis(80),
        );

        assert!(queue.poll(t0 + Duration::from_millis(120)).is_empty());
        assert_eq!(queue.poll(t0 + Duration::from_millis(180)).len(), 1);
    }

    #[test]
    fn test_zero_debounce_settles_immediately() {
        let mut queue = ChangeCoalescer::new(Duration::ZERO);
        let now = Instant::now();
        queue.push(event_at("a.bin", ChangeKind::Modified, 0), now);
        assert_eq!(queue.poll(now).len(), 1);
    }

    #[test]
    fn test_flush_all_and_next_deadline() {
        let mut queue = ChangeCoalescer::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(queue.next_deadline().is_none());

        queue.push(event_at("b.bin", ChangeKind::Created, 0), t0 + Duration::from_secs(1));
        queue.push(event_at("a.bin", ChangeKind::Created, 0), t0);
        assert_eq!(queue.next_deadline(), Some(t0 + Duration::from_secs(60)));

        let all = queue.flush_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, path("a.bin"));
        assert!(queue.is_empty());
    }

    // ------------------------------------------------------------------
    // Actor
    // ------------------------------------------------------------------

    struct Harness {
        watch_tx: mpsc::Sender<WatchMessage>,
        _rescan_tx: mpsc::Sender<FileChangeEvent>,
        out_rx: mpsc::UnboundedReceiver<PendingSync>,
        kick: Arc<Notify>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<(ChangeCoalescer, Result<(), SyncError>)>,
    }

    fn spawn_actor(debounce: Duration) -> Harness {
        let (watch_tx, watch_rx) = mpsc::channel(16);
        let (rescan_tx, rescan_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let kick = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let actor = CoalescerActor::new(
            debounce,
            watch_rx,
            rescan_rx,
            kick.clone(),
            cancel.clone(),
            Arc::new(out_tx),
            Arc::new(SyncCounters::new()),
        );
        Harness {
            watch_tx,
            _rescan_tx: rescan_tx,
            out_rx,
            kick,
            cancel,
            handle: tokio::spawn(actor.run()),
        }
    }

    #[tokio::test]
    async fn test_actor_emits_after_debounce() {
        let mut h = spawn_actor(Duration::from_millis(50));
        for _ in 0..5 {
            h.watch_tx
                .send(WatchMessage::Event(FileChangeEvent::modified(path("log.txt"))))
                .await
                .unwrap();
        }

        let settled = tokio::time::timeout(Duration::from_secs(5), h.out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.path, path("log.txt"));

        h.cancel.cancel();
        let (queue, result) = h.handle.await.unwrap();
        assert!(result.is_ok());
        assert!(queue.is_empty());
        assert!(h.out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_actor_kick_bypasses_debounce() {
        let mut h = spawn_actor(Duration::from_secs(3600));
        h.watch_tx
            .send(WatchMessage::Event(FileChangeEvent::created(path("a.bin"))))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        h.kick.notify_one();

        let settled = tokio::time::timeout(Duration::from_secs(5), h.out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.path, path("a.bin"));
        h.cancel.cancel();
        let _ = h.handle.await;
    }

    #[tokio::test]
    async fn test_actor_returns_pending_on_cancel() {
        let h = spawn_actor(Duration::from_secs(3600));
        h.watch_tx
            .send(WatchMessage::Event(FileChangeEvent::created(path("a.bin"))))
            .await
            .unwrap();

        // Give the actor time to absorb the event before cancelling
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.cancel.cancel();
        let (queue, result) = h.handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_actor_keeps_queued_events_on_cancel() {
        let (watch_tx, watch_rx) = mpsc::channel(16);
        let (rescan_tx, rescan_rx) = mpsc::channel(16);
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let actor = CoalescerActor::new(
            Duration::from_secs(3600),
            watch_rx,
            rescan_rx,
            Arc::new(Notify::new()),
            cancel.clone(),
            Arc::new(out_tx),
            Arc::new(SyncCounters::new()),
        );

        // Delivered, but the actor has not received them yet
        watch_tx
            .send(WatchMessage::Event(FileChangeEvent::modified(path("late.txt"))))
            .await
            .unwrap();
        watch_tx
            .send(WatchMessage::Event(FileChangeEvent::deleted(path("gone.bin"))))
            .await
            .unwrap();
        rescan_tx
            .send(FileChangeEvent::modified(path("missed.txt")))
            .await
            .unwrap();
        cancel.cancel();

        let (queue, result) = actor.run().await;
        assert!(result.is_ok());
        assert_eq!(queue.pending_count(), 3);
        assert_eq!(queue.get(&path("gone.bin")).unwrap().kind, ChangeKind::Deleted);
        assert!(queue.get(&path("late.txt")).is_some());
        assert!(queue.get(&path("missed.txt")).is_some());
    }

    #[tokio::test]
    async fn test_actor_fails_on_watcher_error() {
        let h = spawn_actor(Duration::from_millis(10));
        h.watch_tx
            .send(WatchMessage::Error("inotify overflow".into()))
            .await
            .unwrap();

        let (_, result) = h.handle.await.unwrap();
        assert!(matches!(result, Err(SyncError::WatcherFailure(reason)) if reason == "inotify overflow"));
    }

    #[tokio::test]
    async fn test_actor_fails_when_watcher_closes() {
        let h = spawn_actor(Duration::from_millis(10));
        drop(h.watch_tx);

        let (_, result) = h.handle.await.unwrap();
        assert!(matches!(result, Err(SyncError::WatcherFailure(_))));
    }
}
