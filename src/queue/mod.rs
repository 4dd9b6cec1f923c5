//! Download queue: admission, bounded dispatch, cancellation and retry.
//!
//! This module owns every [`ItemState`] transition. Items are admitted in FIFO
//! order, dispatched to [`TransferWorker`]s while fewer than `concurrency`
//! items are active, and handed to classification exactly once when they
//! complete.
//!
//! # Overview
//!
//! - [`DownloadQueue`] - Cloneable handle; all mutations go through one mutex
//! - [`DownloadQueue::run`] - Dispatch loop, woken by queue events and a safety-net tick
//! - [`CompletedDownload`] - Handoff record sent on the completion channel
//! - [`Statistics`] / [`QueueSnapshot`] - Lifetime totals and the derived view
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use media_intake::download::{SourceRef, SourceRouter, SpeedLimiter, TransferWorker, WorkerSettings};
//! use media_intake::notify::LogNotifier;
//! use media_intake::queue::{DownloadQueue, QueueSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = TransferWorker::new(
//!     Arc::new(SourceRouter::with_defaults()?),
//!     Arc::new(SpeedLimiter::disabled()),
//!     WorkerSettings::default(),
//! );
//! let (queue, mut completed) =
//!     DownloadQueue::new(QueueSettings::default(), worker, Arc::new(LogNotifier))?;
//! tokio::spawn({
//!     let queue = queue.clone();
//!     async move { queue.run().await }
//! });
//!
//! let admission = queue
//!     .enqueue(SourceRef::parse("https://example.com/Movie.2010.mkv"), "Movie.2010.mkv", None)
//!     .await?;
//! println!("queued #{} at position {}", admission.id, admission.position);
//!
//! if let Some(done) = completed.recv().await {
//!     println!("ready: {}", done.path.display());
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod item;
mod stats;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

pub use error::{MAX_CONCURRENCY, MIN_CONCURRENCY, QueueError};
pub use item::{FailureReason, ItemId, ItemState, ItemView};
pub use stats::{QueueSnapshot, Statistics};

use item::DownloadItem;
use stats::StatsCounters;

use crate::download::filename::{sanitize_filename, temp_path_for};
use crate::download::{
    ProgressPolicy, RetryDecision, RetryPolicy, SourceRef, TransferError, TransferJob,
    TransferOutcome, TransferProgress, TransferWorker, classify_error, remove_partial,
};
use crate::notify::{Notifier, StatusEvent};

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default interval between progress evaluations (5 seconds).
pub const DEFAULT_PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Safety-net tick for the dispatch loop.
const DISPATCH_SAFETY_TICK: Duration = Duration::from_secs(1);

/// Queue-level settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Maximum simultaneously active items.
    pub concurrency: usize,
    /// Directory for partial files.
    pub temp_dir: PathBuf,
    /// Automatic retry budget and delay.
    pub retry: RetryPolicy,
    /// How often active items are evaluated for progress reports.
    pub progress_update_interval: Duration,
    /// Large/small file reporting policy.
    pub progress: ProgressPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            temp_dir: std::env::temp_dir().join("media-intake"),
            retry: RetryPolicy::default(),
            progress_update_interval: DEFAULT_PROGRESS_UPDATE_INTERVAL,
            progress: ProgressPolicy::default(),
        }
    }
}

/// Result of [`DownloadQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    /// Id assigned to the item.
    pub id: ItemId,
    /// 1-based place in the pending sequence at admission time.
    pub position: usize,
}

/// What a cancel request did. Callers may ignore it; the result is also
/// observable through status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The item was waiting and is now Cancelled.
    Removed,
    /// The item is active; its worker stops at the next chunk boundary.
    Requested,
    /// Cancellation was already requested for this active item.
    AlreadyRequested,
    /// The item is terminal; nothing happened.
    AlreadyTerminal,
    /// No such item; nothing happened.
    Unknown,
}

/// A finished transfer handed to classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedDownload {
    /// Queue item id.
    pub id: ItemId,
    /// Sanitized declared filename.
    pub filename: String,
    /// Temp path holding the complete file.
    pub path: PathBuf,
    /// Final size.
    pub bytes: u64,
}

/// Cloneable handle to the download queue.
#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    /// Wakes the dispatch loop.
    wake: Notify,
    /// Wakes `wait_idle` callers on every state change.
    changed: Notify,
    settings: QueueSettings,
    worker: TransferWorker,
    notifier: Arc<dyn Notifier>,
}

struct QueueState {
    items: BTreeMap<ItemId, DownloadItem>,
    pending: VecDeque<ItemId>,
    active: BTreeSet<ItemId>,
    stats: StatsCounters,
    next_id: u64,
    shut_down: bool,
    /// Dropped on shutdown so the consumer sees the channel close.
    handoff: Option<mpsc::UnboundedSender<CompletedDownload>>,
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl DownloadQueue {
    /// Creates a queue and the receiving end of its completion channel.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConcurrency`] if concurrency is outside
    /// `1..=100`.
    #[instrument(skip(worker, notifier), fields(concurrency = settings.concurrency))]
    pub fn new(
        settings: QueueSettings,
        worker: TransferWorker,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CompletedDownload>), QueueError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&settings.concurrency) {
            return Err(QueueError::InvalidConcurrency {
                value: settings.concurrency,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = QueueState {
            items: BTreeMap::new(),
            pending: VecDeque::new(),
            active: BTreeSet::new(),
            stats: StatsCounters::new(),
            next_id: 1,
            shut_down: false,
            handoff: Some(tx),
        };

        debug!("download queue created");
        let queue = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                wake: Notify::new(),
                changed: Notify::new(),
                settings,
                worker,
                notifier,
            }),
        };
        Ok((queue, rx))
    }

    /// Returns the queue settings.
    #[must_use]
    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Admits an item at the tail of the pending sequence. Never waits for a slot.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] after [`DownloadQueue::shutdown`].
    #[instrument(skip(self, source), fields(source = %source))]
    pub async fn enqueue(
        &self,
        source: SourceRef,
        filename: &str,
        declared_size: Option<u64>,
    ) -> Result<Admission, QueueError> {
        let filename = sanitize_filename(filename);
        let admission = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return Err(QueueError::ShutDown);
            }
            let id = ItemId::new(state.next_id);
            state.next_id += 1;

            let temp_path = temp_path_for(&self.inner.settings.temp_dir, id.get(), &filename);
            let item = DownloadItem::new(
                id,
                source,
                filename.clone(),
                declared_size,
                temp_path,
                self.inner.settings.progress.clone(),
            );
            state.items.insert(id, item);
            state.pending.push_back(id);
            state.stats.files_handled += 1;

            Admission {
                id,
                position: state.pending.len(),
            }
        };

        info!(id = %admission.id, position = admission.position, "item queued");
        self.inner.notifier.notify(StatusEvent::Queued {
            id: admission.id,
            filename,
            position: admission.position,
            size: declared_size,
        });
        self.inner.wake.notify_one();
        self.inner.changed.notify_waiters();
        Ok(admission)
    }

    /// Cancels an item by id. Fire-and-forget: unknown and terminal items are
    /// a silent no-op.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: ItemId) -> CancelOutcome {
        let mut events = Vec::new();
        let mut cleanup = None;

        let outcome = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(item) = state.items.get_mut(&id) else {
                return CancelOutcome::Unknown;
            };

            match item.state {
                ItemState::Queued => {
                    state.pending.retain(|pending| *pending != id);
                    item.state = ItemState::Cancelled;
                    state.stats.cancelled += 1;
                    cleanup = Some(item.temp_path.clone());
                    events.push(cancelled_event(item, item.bytes()));
                    CancelOutcome::Removed
                }
                ItemState::Failed if item.retry_scheduled => {
                    item.retry_scheduled = false;
                    item.state = ItemState::Cancelled;
                    state.stats.cancelled += 1;
                    cleanup = Some(item.temp_path.clone());
                    events.push(cancelled_event(item, item.bytes()));
                    CancelOutcome::Removed
                }
                ItemState::Active if item.cancel_requested => CancelOutcome::AlreadyRequested,
                ItemState::Active => {
                    item.cancel_requested = true;
                    item.progress.cancel();
                    CancelOutcome::Requested
                }
                ItemState::Completed | ItemState::Failed | ItemState::Cancelled => {
                    CancelOutcome::AlreadyTerminal
                }
            }
        };

        debug!(?outcome, "cancel handled");
        if let Some(path) = cleanup {
            remove_partial(&path).await;
        }
        self.emit(events);
        if outcome == CancelOutcome::Removed {
            self.inner.wake.notify_one();
            self.inner.changed.notify_waiters();
        }
        outcome
    }

    /// Re-queues a terminally failed item as a fresh attempt.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ItemNotFound`] for unknown ids and
    /// [`QueueError::NotRetryable`] unless the item is terminally `Failed`.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: ItemId) -> Result<Admission, QueueError> {
        let (admission, event) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if state.shut_down {
                return Err(QueueError::ShutDown);
            }
            let item = state
                .items
                .get_mut(&id)
                .ok_or(QueueError::ItemNotFound(id))?;
            if item.state != ItemState::Failed || item.retry_scheduled {
                return Err(QueueError::NotRetryable {
                    id,
                    state: item.state,
                });
            }

            item.state = ItemState::Queued;
            item.retry_count += 1;
            item.failure = None;
            state.stats.failed = state.stats.failed.saturating_sub(1);
            state.stats.retries += 1;
            state.pending.push_back(id);

            let admission = Admission {
                id,
                position: state.pending.len(),
            };
            let event = StatusEvent::Queued {
                id,
                filename: item.filename.clone(),
                position: admission.position,
                size: item.declared_size,
            };
            (admission, event)
        };

        info!(position = admission.position, "item re-queued by operator");
        self.emit(vec![event]);
        self.inner.wake.notify_one();
        self.inner.changed.notify_waiters();
        Ok(admission)
    }

    /// Returns a copy of one item.
    pub async fn item(&self, id: ItemId) -> Option<ItemView> {
        let state = self.inner.state.lock().await;
        state
            .items
            .get(&id)
            .map(|item| item.view(pending_position(&state.pending, id)))
    }

    /// Returns copies of the active items in id order.
    pub async fn active_items(&self) -> Vec<ItemView> {
        let state = self.inner.state.lock().await;
        state
            .active
            .iter()
            .filter_map(|id| state.items.get(id))
            .map(|item| item.view(None))
            .collect()
    }

    /// Returns copies of the waiting items in dispatch order.
    pub async fn queued_items(&self) -> Vec<ItemView> {
        let state = self.inner.state.lock().await;
        state
            .pending
            .iter()
            .enumerate()
            .filter_map(|(index, id)| state.items.get(id).map(|item| item.view(Some(index + 1))))
            .collect()
    }

    /// Recomputes the snapshot from the current item set.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock().await;
        let mut snapshot = QueueSnapshot {
            peak_concurrency: state.stats.peak_concurrency,
            concurrency_limit: self.inner.settings.concurrency,
            ..QueueSnapshot::default()
        };
        for item in state.items.values() {
            match item.state {
                ItemState::Queued => snapshot.queued += 1,
                ItemState::Active => snapshot.active += 1,
                ItemState::Completed => snapshot.completed += 1,
                ItemState::Failed if item.retry_scheduled => snapshot.retrying += 1,
                ItemState::Failed => snapshot.failed += 1,
                ItemState::Cancelled => snapshot.cancelled += 1,
            }
            snapshot.bytes_transferred += item.bytes();
        }
        snapshot
    }

    /// Returns a copy of the lifetime statistics.
    pub async fn statistics(&self) -> Statistics {
        self.inner.state.lock().await.stats.copy()
    }

    /// Waits until nothing is active, queued or waiting for a retry.
    pub async fn wait_idle(&self) {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if self.snapshot().await.is_idle() {
                return;
            }
            changed.await;
        }
    }

    /// Stops dispatch and cancels waiting and active items.
    ///
    /// The completion channel closes once no worker is active, so a transfer
    /// that finishes while stopping is still handed off. Use
    /// [`DownloadQueue::drain`] to wait for that with a bound.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let mut events = Vec::new();
        let mut cleanup = Vec::new();
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            if state.active.is_empty() {
                state.handoff = None;
            }

            for id in std::mem::take(&mut state.pending) {
                if let Some(item) = state.items.get_mut(&id) {
                    item.state = ItemState::Cancelled;
                    state.stats.cancelled += 1;
                    cleanup.push(item.temp_path.clone());
                    events.push(cancelled_event(item, item.bytes()));
                }
            }
            for item in state.items.values_mut() {
                match item.state {
                    ItemState::Active => {
                        item.cancel_requested = true;
                        item.progress.cancel();
                    }
                    ItemState::Failed if item.retry_scheduled => {
                        item.retry_scheduled = false;
                        item.state = ItemState::Cancelled;
                        state.stats.cancelled += 1;
                        cleanup.push(item.temp_path.clone());
                        events.push(cancelled_event(item, item.bytes()));
                    }
                    _ => {}
                }
            }
        }

        info!("download queue shutting down");
        for path in cleanup {
            remove_partial(&path).await;
        }
        self.emit(events);
        self.inner.wake.notify_one();
        self.inner.changed.notify_waiters();
    }

    /// Waits up to `grace` for workers to stop after
    /// [`DownloadQueue::shutdown`], then closes the completion channel.
    ///
    /// Returns `false` if a worker was still active when `grace` ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = tokio::time::timeout(grace, self.wait_idle()).await.is_ok();
        let mut state = self.inner.state.lock().await;
        if !drained {
            warn!(active = state.active.len(), "workers still active after shutdown grace");
        }
        state.handoff = None;
        drained
    }

    /// Runs the dispatch loop until [`DownloadQueue::shutdown`].
    ///
    /// Woken by admission, completion, failure and cancellation, by a
    /// one-second safety tick, and by the progress tick that emits reports
    /// for active items.
    pub async fn run(&self) {
        let mut safety_tick = tokio::time::interval(DISPATCH_SAFETY_TICK);
        safety_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut progress_tick = tokio::time::interval_at(
            Instant::now() + self.inner.settings.progress_update_interval,
            self.inner.settings.progress_update_interval,
        );
        progress_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            concurrency = self.inner.settings.concurrency,
            "dispatch loop started"
        );

        loop {
            tokio::select! {
                () = self.inner.wake.notified() => {}
                _ = safety_tick.tick() => {}
                _ = progress_tick.tick() => {
                    self.emit_progress().await;
                }
            }

            if self.inner.state.lock().await.shut_down {
                break;
            }
            self.try_fill_slots().await;
        }

        info!("dispatch loop stopped");
    }

    async fn try_fill_slots(&self) {
        let mut started = Vec::new();
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            while state.active.len() < self.inner.settings.concurrency {
                let Some(id) = state.pending.pop_front() else {
                    break;
                };
                let Some(item) = state.items.get_mut(&id) else {
                    continue;
                };
                if item.state != ItemState::Queued {
                    continue;
                }

                item.state = ItemState::Active;
                item.started_at.get_or_insert_with(Instant::now);
                item.progress = Arc::new(TransferProgress::new(item.declared_size));

                let job = TransferJob {
                    source: item.source.clone(),
                    temp_path: item.temp_path.clone(),
                    declared_size: item.declared_size,
                };
                let event = StatusEvent::Started {
                    id,
                    filename: item.filename.clone(),
                    total: item.declared_size,
                    attempt: item.retry_count + 1,
                };
                started.push((id, job, Arc::clone(&item.progress), event));

                state.active.insert(id);
                state.stats.observe_concurrency(state.active.len());
            }
        }

        for (id, job, progress, event) in started {
            debug!(%id, "dispatching transfer");
            self.inner.notifier.notify(event);
            let queue = self.clone();
            tokio::spawn(async move {
                let result = queue.inner.worker.run(&job, &progress).await;
                queue.finish(id, result).await;
            });
        }
    }

    async fn finish(&self, id: ItemId, result: Result<TransferOutcome, TransferError>) {
        let mut events = Vec::new();
        let mut cleanup = None;
        let mut retry_after = None;
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.active.remove(&id);
            let Some(item) = state.items.get_mut(&id) else {
                warn!(%id, "finished transfer for unknown item");
                return;
            };
            let elapsed = item.started_at.map_or(Duration::ZERO, |t| t.elapsed());

            match result {
                Ok(TransferOutcome::Completed { bytes }) => {
                    item.state = ItemState::Completed;
                    item.final_bytes = Some(bytes);
                    state.stats.succeeded += 1;
                    state.stats.total_bytes += bytes;
                    info!(%id, bytes, "transfer completed");

                    let handoff = CompletedDownload {
                        id,
                        filename: item.filename.clone(),
                        path: item.temp_path.clone(),
                        bytes,
                    };
                    let sent = state
                        .handoff
                        .as_ref()
                        .is_some_and(|tx| tx.send(handoff).is_ok());
                    if !sent {
                        warn!(%id, "completion channel closed, file left in temp");
                    }
                    events.push(StatusEvent::Completed {
                        id,
                        filename: item.filename.clone(),
                        bytes,
                        elapsed,
                    });
                }
                Ok(TransferOutcome::Cancelled { bytes }) => {
                    item.state = ItemState::Cancelled;
                    state.stats.cancelled += 1;
                    events.push(cancelled_event(item, bytes));
                }
                Err(error) if item.cancel_requested => {
                    debug!(%id, %error, "error after cancel request, treating as cancelled");
                    item.state = ItemState::Cancelled;
                    state.stats.cancelled += 1;
                    cleanup = Some(item.temp_path.clone());
                    events.push(cancelled_event(item, item.progress.bytes()));
                }
                Err(error) => {
                    let reason = FailureReason::from_error(&error);
                    item.state = ItemState::Failed;
                    item.failure = Some(reason.clone());

                    let failure_type = classify_error(&error);
                    match self.inner.settings.retry.should_retry(failure_type, item.retry_count) {
                        RetryDecision::Retry { delay, attempt } if !state.shut_down => {
                            warn!(%id, %error, attempt, "transfer failed, retry scheduled");
                            item.retry_scheduled = true;
                            state.stats.retries += 1;
                            retry_after = Some(delay);
                            events.push(StatusEvent::Retrying {
                                id,
                                filename: item.filename.clone(),
                                attempt,
                                max_retries: self.inner.settings.retry.max_retries(),
                                delay,
                                reason,
                            });
                        }
                        _ => {
                            warn!(%id, %error, retries = item.retry_count, "transfer failed");
                            state.stats.failed += 1;
                            cleanup = Some(item.temp_path.clone());
                            events.push(StatusEvent::Failed {
                                id,
                                filename: item.filename.clone(),
                                reason,
                                retries: item.retry_count,
                            });
                        }
                    }
                }
            }
            // Last worker out closes the channel after its own handoff.
            if state.shut_down && state.active.is_empty() {
                state.handoff = None;
            }
        }

        if let Some(path) = cleanup {
            remove_partial(&path).await;
        }
        self.emit(events);
        if let Some(delay) = retry_after {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.requeue_after_delay(id).await;
            });
        }
        self.inner.wake.notify_one();
        self.inner.changed.notify_waiters();
    }

    async fn requeue_after_delay(&self, id: ItemId) {
        let event = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(item) = state.items.get_mut(&id) else {
                return;
            };
            // Cancelled (or shut down) while waiting.
            if item.state != ItemState::Failed || !item.retry_scheduled || state.shut_down {
                return;
            }
            item.state = ItemState::Queued;
            item.retry_scheduled = false;
            item.retry_count += 1;
            state.pending.push_back(id);
            StatusEvent::Queued {
                id,
                filename: item.filename.clone(),
                position: state.pending.len(),
                size: item.declared_size,
            }
        };
        debug!(%id, "retry re-queued");
        self.emit(vec![event]);
        self.inner.wake.notify_one();
        self.inner.changed.notify_waiters();
    }

    async fn emit_progress(&self) {
        let events: Vec<StatusEvent> = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state
                .active
                .iter()
                .filter_map(|id| {
                    let item = state.items.get_mut(id)?;
                    let progress = Arc::clone(&item.progress);
                    let elapsed = item
                        .started_at
                        .map_or_else(|| progress.elapsed(), |t| t.elapsed());
                    let report = item.tracker.observe(
                        progress.bytes(),
                        item.declared_size.or_else(|| progress.total()),
                        elapsed,
                    )?;
                    Some(StatusEvent::Progress {
                        id: *id,
                        filename: item.filename.clone(),
                        report,
                    })
                })
                .collect()
        };
        self.emit(events);
    }

    fn emit(&self, events: Vec<StatusEvent>) {
        for event in events {
            self.inner.notifier.notify(event);
        }
    }
}

fn cancelled_event(item: &DownloadItem, bytes: u64) -> StatusEvent {
    StatusEvent::Cancelled {
        id: item.id,
        filename: item.filename.clone(),
        bytes,
        total: item.total(),
    }
}

fn pending_position(pending: &VecDeque<ItemId>, id: ItemId) -> Option<usize> {
    pending.iter().position(|p| *p == id).map(|index| index + 1)
}
