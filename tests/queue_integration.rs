//! Integration tests for the download queue.
//!
//! These tests drive the queue through in-memory sources that hold each
//! transfer open until the test releases it, so the set of active items is
//! fully controlled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use media_intake::download::{
    ChunkStream, SourceRef, SpeedLimiter, TransferError, TransferSource, TransferWorker,
    WorkerSettings,
};
use media_intake::notify::{Notifier, StatusEvent};
use media_intake::queue::{
    CancelOutcome, CompletedDownload, DownloadQueue, ItemId, ItemState, QueueSettings,
};
use tempfile::TempDir;
use tokio::sync::{Semaphore, mpsc};

/// Records every event.
#[derive(Default)]
struct Recorder(Mutex<Vec<StatusEvent>>);

impl Recorder {
    fn events(&self) -> Vec<StatusEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl Notifier for Recorder {
    fn notify(&self, event: StatusEvent) {
        self.0.lock().unwrap().push(event);
    }
}

/// Source whose transfers each wait for one permit before yielding their payload.
struct GatedSource {
    gate: Arc<Semaphore>,
    payload: usize,
}

struct GatedStream {
    gate: Arc<Semaphore>,
    payload: Option<Bytes>,
}

#[async_trait]
impl TransferSource for GatedSource {
    fn name(&self) -> &str {
        "gated"
    }

    fn can_handle(&self, _source: &SourceRef) -> bool {
        true
    }

    async fn open(
        &self,
        _source: &SourceRef,
        _offset: u64,
    ) -> Result<Box<dyn ChunkStream>, TransferError> {
        Ok(Box::new(GatedStream {
            gate: Arc::clone(&self.gate),
            payload: Some(Bytes::from(vec![7_u8; self.payload])),
        }))
    }
}

#[async_trait]
impl ChunkStream for GatedStream {
    fn total_len(&self) -> Option<u64> {
        None
    }

    fn start_offset(&self) -> u64 {
        0
    }

    async fn next_chunk(&mut self, _max_len: usize) -> Result<Option<Bytes>, TransferError> {
        if self.payload.is_some() {
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
        }
        Ok(self.payload.take())
    }
}

/// Source that streams `total` bytes and pauses once `pause_at` bytes are out.
struct PausingSource {
    total: u64,
    pause_at: u64,
    resume: Arc<Semaphore>,
}

struct PausingStream {
    sent: u64,
    total: u64,
    pause_at: u64,
    paused: bool,
    resume: Arc<Semaphore>,
}

#[async_trait]
impl TransferSource for PausingSource {
    fn name(&self) -> &str {
        "pausing"
    }

    fn can_handle(&self, _source: &SourceRef) -> bool {
        true
    }

    async fn open(
        &self,
        _source: &SourceRef,
        _offset: u64,
    ) -> Result<Box<dyn ChunkStream>, TransferError> {
        Ok(Box::new(PausingStream {
            sent: 0,
            total: self.total,
            pause_at: self.pause_at,
            paused: false,
            resume: Arc::clone(&self.resume),
        }))
    }
}

#[async_trait]
impl ChunkStream for PausingStream {
    fn total_len(&self) -> Option<u64> {
        Some(self.total)
    }

    fn start_offset(&self) -> u64 {
        0
    }

    async fn next_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, TransferError> {
        if self.sent >= self.total {
            return Ok(None);
        }
        if self.sent == self.pause_at && !self.paused {
            self.paused = true;
            let permit = self.resume.acquire().await.unwrap();
            permit.forget();
            // Empty chunk: the worker looks at the cancel flag before reading on.
            return Ok(Some(Bytes::new()));
        }
        let limit = if self.sent < self.pause_at {
            self.pause_at
        } else {
            self.total
        };
        let len = (limit - self.sent).min(max_len as u64);
        self.sent += len;
        Ok(Some(Bytes::from(vec![1_u8; usize::try_from(len).unwrap()])))
    }
}

struct Harness {
    queue: DownloadQueue,
    completed: mpsc::UnboundedReceiver<CompletedDownload>,
    recorder: Arc<Recorder>,
    runner: tokio::task::JoinHandle<()>,
    dir: TempDir,
}

fn start(source: Arc<dyn TransferSource>, concurrency: usize, chunk_size: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let worker = TransferWorker::new(
        source,
        Arc::new(SpeedLimiter::disabled()),
        WorkerSettings {
            chunk_size,
            ..WorkerSettings::default()
        },
    );
    let settings = QueueSettings {
        concurrency,
        temp_dir: dir.path().to_path_buf(),
        ..QueueSettings::default()
    };
    let notifier: Arc<dyn Notifier> = recorder.clone();
    let (queue, completed) = DownloadQueue::new(settings, worker, notifier).unwrap();
    let runner = tokio::spawn({
        let queue = queue.clone();
        async move { queue.run().await }
    });
    Harness {
        queue,
        completed,
        recorder,
        runner,
        dir,
    }
}

/// Polls `check` until it holds, failing the test after five seconds.
async fn eventually<F, Fut>(queue: &DownloadQueue, what: &str, check: F)
where
    F: Fn(DownloadQueue) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check(queue.clone()).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn state_of(queue: &DownloadQueue, id: ItemId) -> ItemState {
    queue.item(id).await.unwrap().state
}

// ==================== Admission and Dispatch ====================

#[tokio::test]
async fn test_item_waits_behind_full_slots_and_dispatches_when_one_frees() {
    let gate = Arc::new(Semaphore::new(0));
    let h = start(
        Arc::new(GatedSource {
            gate: Arc::clone(&gate),
            payload: 64,
        }),
        3,
        1024,
    );

    for name in ["Severance.S02E01.mkv", "Andor.S01E03.mkv", "Dune.2021.mkv"] {
        h.queue
            .enqueue(SourceRef::Opaque(name.into()), name, None)
            .await
            .unwrap();
    }
    eventually(&h.queue, "three active items", |q| async move {
        q.snapshot().await.active == 3
    })
    .await;

    let admission = h
        .queue
        .enqueue(
            SourceRef::Opaque("daredevil".into()),
            "Daredevil.S01E05.mkv",
            Some(220_000_000),
        )
        .await
        .unwrap();
    assert_eq!(admission.position, 1, "first in line behind three active");
    assert_eq!(admission.id, ItemId::new(4));

    // Nothing frees up, so nothing is dispatched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state_of(&h.queue, admission.id).await, ItemState::Queued);
    assert_eq!(h.queue.active_items().await.len(), 3);
    let queued = h.queue.queued_items().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].position, Some(1));

    gate.add_permits(1);
    eventually(&h.queue, "daredevil dispatched", |q| async move {
        state_of(&q, admission.id).await != ItemState::Queued
    })
    .await;
    assert!(h.queue.snapshot().await.active <= 3);

    h.queue.shutdown().await;
    h.runner.await.unwrap();
}

#[tokio::test]
async fn test_dispatch_is_fifo_and_never_exceeds_limit() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = start(
        Arc::new(GatedSource {
            gate: Arc::clone(&gate),
            payload: 32,
        }),
        2,
        1024,
    );

    let mut ids = Vec::new();
    for n in 1..=5 {
        let name = format!("Episode.S01E0{n}.mkv");
        let admission = h
            .queue
            .enqueue(SourceRef::Opaque(name.clone()), &name, None)
            .await
            .unwrap();
        ids.push(admission.id);
    }

    eventually(&h.queue, "two active items", |q| async move {
        q.snapshot().await.active == 2
    })
    .await;
    let active: Vec<ItemId> = h.queue.active_items().await.iter().map(|v| v.id).collect();
    assert_eq!(active, vec![ids[0], ids[1]]);

    // Release one transfer at a time; completions arrive in admission order.
    let mut finished = Vec::new();
    for _ in 0..ids.len() {
        gate.add_permits(1);
        let done = h.completed.recv().await.unwrap();
        finished.push(done.id);
        assert!(h.queue.snapshot().await.active <= 2);
    }
    assert_eq!(finished.len(), 5);
    let mut sorted = finished.clone();
    sorted.sort();
    assert_eq!(sorted, ids);

    h.queue.wait_idle().await;
    let stats = h.queue.statistics().await;
    assert_eq!(stats.succeeded, 5);
    assert_eq!(stats.peak_concurrency, 2);
    assert_eq!(stats.total_bytes, 5 * 32);

    let started: Vec<ItemId> = h
        .recorder
        .events()
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Started { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(started, ids, "items start in FIFO order");

    h.queue.shutdown().await;
    h.runner.await.unwrap();
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancel_mid_transfer_removes_partial_and_counts_once() {
    const TOTAL: u64 = 740_700;
    const CANCEL_AT: u64 = 485_200;

    let resume = Arc::new(Semaphore::new(0));
    let mut h = start(
        Arc::new(PausingSource {
            total: TOTAL,
            pause_at: CANCEL_AT,
            resume: Arc::clone(&resume),
        }),
        3,
        16 * 1024,
    );

    let admission = h
        .queue
        .enqueue(
            SourceRef::Opaque("bigfile".into()),
            "The.Bear.S03E01.mkv",
            Some(TOTAL),
        )
        .await
        .unwrap();

    eventually(&h.queue, "transfer to reach the cancel point", |q| async move {
        q.item(admission.id).await.unwrap().bytes == CANCEL_AT
    })
    .await;
    let partials = std::fs::read_dir(h.dir.path()).unwrap().count();
    assert_eq!(partials, 1, "partial file exists while active");

    assert_eq!(h.queue.cancel(admission.id).await, CancelOutcome::Requested);
    assert_eq!(
        h.queue.cancel(admission.id).await,
        CancelOutcome::AlreadyRequested
    );
    resume.add_permits(1);

    eventually(&h.queue, "item cancelled", |q| async move {
        state_of(&q, admission.id).await == ItemState::Cancelled
    })
    .await;

    let view = h.queue.item(admission.id).await.unwrap();
    assert_eq!(view.bytes, CANCEL_AT);
    assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);

    let cancellations: Vec<StatusEvent> = h
        .recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, StatusEvent::Cancelled { .. }))
        .collect();
    assert_eq!(cancellations.len(), 1);
    assert!(matches!(
        &cancellations[0],
        StatusEvent::Cancelled { bytes: CANCEL_AT, total: Some(TOTAL), .. }
    ));

    let stats = h.queue.statistics().await;
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.succeeded, 0);
    assert_eq!(stats.total_bytes, 0);

    assert_eq!(
        h.queue.cancel(admission.id).await,
        CancelOutcome::AlreadyTerminal
    );
    h.queue.shutdown().await;
    assert!(h.completed.recv().await.is_none(), "cancelled items are never handed off");
    h.runner.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_waiting_and_active_items() {
    let gate = Arc::new(Semaphore::new(0));
    let h = start(
        Arc::new(GatedSource {
            gate: Arc::clone(&gate),
            payload: 8,
        }),
        1,
        1024,
    );

    let first = h
        .queue
        .enqueue(SourceRef::Opaque("a".into()), "a.mkv", None)
        .await
        .unwrap();
    let second = h
        .queue
        .enqueue(SourceRef::Opaque("b".into()), "b.mkv", None)
        .await
        .unwrap();
    eventually(&h.queue, "first active", |q| async move {
        state_of(&q, first.id).await == ItemState::Active
    })
    .await;

    h.queue.shutdown().await;
    assert_eq!(state_of(&h.queue, second.id).await, ItemState::Cancelled);
    gate.add_permits(1);
    eventually(&h.queue, "active item stops", |q| async move {
        state_of(&q, first.id).await == ItemState::Cancelled
    })
    .await;
    assert_eq!(h.queue.statistics().await.cancelled, 2);
    h.runner.await.unwrap();
}
