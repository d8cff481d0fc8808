//! # Task Offload Pool
//!
//! Moves CPU-bound audio transforms off the async event loop onto a fixed set
//! of OS worker threads, while the caller simply `await`s a result.
//!
//! ## Architecture:
//! ```text
//!  submit(payload) ──► pending[id] = oneshot ──► work queue ──► worker 0..N
//!        ▲                                                        │
//!        │                                                        ▼
//!   oneshot resolved ◄── resolver thread ◄──────────────── completion queue
//! ```
//!
//! - **Work queue** (`crossbeam-channel`, shared by all workers): single tasks,
//!   batches of tasks, or a shutdown sentinel.
//! - **Completion queue**: `(id, outcome)` pairs in whatever order workers
//!   finish.
//! - **Pending table**: task id → single-use result slot. Every id has at most
//!   one slot and is resolved exactly once (result, transform error or
//!   cancellation).
//!
//! ## Ordering:
//! Completion order is arbitrary, but `submit_batch` returns results in
//! submission order because it awaits its slots in that order.
//!
//! ## Cancellation:
//! Dropping a `submit` future removes its pending record. `close()` cancels
//! whatever is still outstanding.

pub mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{MixToMulaw, MulawToPcm, PcmToMulaw, Transform};
use crate::config::{AudioConfig, PoolConfig};
use crate::error::PoolError;
use worker::{run_resolver, run_worker, Completion, PendingTable, WorkItem};

/// Counters kept by each pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

/// Point-in-time copy of a pool's counters, for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub name: &'static str,
    pub workers: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pending: usize,
    pub closed: bool,
}

/// Fixed-size pool of worker threads running one `Transform`.
///
/// ## Rust Concepts:
/// - **Generic over the transform**: each pool is typed by its payloads, so a
///   mu-law pool cannot be handed a mixing request
/// - **oneshot channels**: single-resolution result slots bridging the worker
///   threads back into async code
pub struct OffloadPool<T: Transform> {
    work_tx: Sender<WorkItem<T::Input>>,
    done_tx: Sender<Completion<T::Output>>,
    pending: Arc<Mutex<PendingTable<T::Output>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    resolver: Mutex<Option<JoinHandle<()>>>,
    worker_count: usize,
    shutdown_timeout: Duration,
    stats: Arc<PoolStats>,
}

impl<T: Transform> OffloadPool<T> {
    /// Spawn `workers` worker threads (at least one) plus the resolver.
    pub fn new(transform: T, workers: usize, shutdown_timeout: Duration) -> std::io::Result<Self> {
        let worker_count = workers.max(1);
        let (work_tx, work_rx) = unbounded::<WorkItem<T::Input>>();
        let (done_tx, done_rx) = unbounded::<Completion<T::Output>>();
        let pending = Arc::new(Mutex::new(PendingTable::new()));
        let stats = Arc::new(PoolStats::default());

        let mut handles = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let transform = transform.clone();
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", T::NAME, idx))
                .spawn(move || run_worker(transform, work_rx, done_tx))?;
            handles.push(handle);
        }

        let resolver = {
            let pending = Arc::clone(&pending);
            let stats = Arc::clone(&stats);
            std::thread::Builder::new()
                .name(format!("{}-resolver", T::NAME))
                .spawn(move || run_resolver(T::NAME, done_rx, pending, stats))?
        };

        info!(pool = T::NAME, workers = worker_count, "offload pool started");

        Ok(Self {
            work_tx,
            done_tx,
            pending,
            workers: Mutex::new(handles),
            resolver: Mutex::new(Some(resolver)),
            worker_count,
            shutdown_timeout,
            stats,
        })
    }

    /// Run one task on a worker and wait for its result.
    ///
    /// ## Errors:
    /// - `PoolError::Closed` if the pool is already closed
    /// - `PoolError::Transform` if the transform rejected the payload
    /// - `PoolError::Cancelled` if the pool closed while the task was queued
    pub async fn submit(&self, payload: T::Input) -> Result<T::Output, PoolError> {
        let id = Uuid::new_v4();
        let mut receivers = self.register(&[id])?;
        let _guard = PendingGuard {
            ids: vec![id],
            pending: &self.pending,
        };

        if self.work_tx.send(WorkItem::Single(id, payload)).is_err() {
            return Err(PoolError::Closed);
        }

        match receivers.pop() {
            Some(rx) => rx.await.unwrap_or(Err(PoolError::Cancelled)),
            None => Err(PoolError::Cancelled),
        }
    }

    /// Run many tasks, grouped into queue items of at most `batch_size`
    /// tasks, and return every result in submission order.
    ///
    /// The outer `Result` only fails for problems with the call itself (zero
    /// batch size, closed pool). Each task's own outcome sits in its slot of
    /// the returned vector, so one failing task never affects its siblings.
    pub async fn submit_batch(
        &self,
        payloads: Vec<T::Input>,
        batch_size: usize,
    ) -> Result<Vec<Result<T::Output, PoolError>>, PoolError> {
        if batch_size == 0 {
            return Err(PoolError::InvalidBatchSize);
        }
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = payloads.iter().map(|_| Uuid::new_v4()).collect();
        let receivers = self.register(&ids)?;
        let _guard = PendingGuard {
            ids: ids.clone(),
            pending: &self.pending,
        };

        let mut tasks = ids.iter().copied().zip(payloads).peekable();
        while tasks.peek().is_some() {
            let group: Vec<(Uuid, T::Input)> = tasks.by_ref().take(batch_size).collect();
            if self.work_tx.send(WorkItem::Batch(group)).is_err() {
                return Err(PoolError::Closed);
            }
        }

        let results = join_all(receivers)
            .await
            .into_iter()
            .map(|received| received.unwrap_or(Err(PoolError::Cancelled)))
            .collect();
        Ok(results)
    }

    /// Register result slots for `ids`, refusing when the pool is closed.
    fn register(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<oneshot::Receiver<Result<T::Output, PoolError>>>, PoolError> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(PoolError::Closed);
        }

        let receivers = ids
            .iter()
            .map(|id| {
                let (tx, rx) = oneshot::channel();
                pending.slots.insert(*id, tx);
                rx
            })
            .collect();
        self.stats
            .submitted
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
        Ok(receivers)
    }

    /// Shut the pool down.
    ///
    /// ## Steps:
    /// 1. Refuse new submissions
    /// 2. Send one shutdown sentinel per worker and stop the resolver
    /// 3. Join threads, giving up after the shutdown timeout
    /// 4. Fail every still-pending task with `PoolError::Cancelled`
    ///
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return;
            }
            pending.closed = true;
        }

        for _ in 0..self.worker_count {
            let _ = self.work_tx.send(WorkItem::Shutdown);
        }
        let _ = self.done_tx.send(Completion::Stop);

        let mut handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        handles.extend(self.resolver.lock().take());

        let timeout = self.shutdown_timeout;
        match tokio::task::spawn_blocking(move || join_with_deadline(handles, timeout)).await {
            Ok(0) => debug!(pool = T::NAME, "all pool threads joined"),
            Ok(stragglers) => warn!(
                pool = T::NAME,
                stragglers, "pool threads still busy after shutdown timeout, detaching"
            ),
            Err(err) => warn!(pool = T::NAME, "join task failed: {}", err),
        }

        let orphans: Vec<_> = self.pending.lock().slots.drain().collect();
        let cancelled = orphans.len();
        for (_, slot) in orphans {
            let _ = slot.send(Err(PoolError::Cancelled));
        }
        self.stats
            .cancelled
            .fetch_add(cancelled as u64, Ordering::Relaxed);

        info!(pool = T::NAME, cancelled, "offload pool closed");
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().slots.len()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        let (pending, closed) = {
            let table = self.pending.lock();
            (table.slots.len(), table.closed)
        };
        PoolStatsSnapshot {
            name: T::NAME,
            workers: self.worker_count,
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            pending,
            closed,
        }
    }
}

impl<T: Transform> Drop for OffloadPool<T> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.closed {
            return;
        }
        pending.closed = true;
        drop(pending);

        // Threads finish on their own once they see the sentinels
        for _ in 0..self.worker_count {
            let _ = self.work_tx.send(WorkItem::Shutdown);
        }
        let _ = self.done_tx.send(Completion::Stop);
    }
}

/// Removes pending records when the awaiting future finishes or is dropped.
struct PendingGuard<'a, O> {
    ids: Vec<Uuid>,
    pending: &'a Mutex<PendingTable<O>>,
}

impl<O> Drop for PendingGuard<'_, O> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        for id in &self.ids {
            pending.slots.remove(id);
        }
    }
}

fn join_with_deadline(handles: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut running = handles;

    loop {
        let (finished, still_running): (Vec<_>, Vec<_>) =
            running.into_iter().partition(|handle| handle.is_finished());
        for handle in finished {
            if handle.join().is_err() {
                warn!("pool thread exited with a panic");
            }
        }
        running = still_running;

        if running.is_empty() || Instant::now() >= deadline {
            return running.len();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// The three transform pools the bridge uses, one per conversion.
pub struct TransformPools {
    pub mulaw_to_pcm: OffloadPool<MulawToPcm>,
    pub pcm_to_mulaw: OffloadPool<PcmToMulaw>,
    pub mixer: OffloadPool<MixToMulaw>,
}

impl TransformPools {
    pub fn new(audio: &AudioConfig, pool: &PoolConfig) -> std::io::Result<Self> {
        let timeout = Duration::from_millis(pool.shutdown_timeout_ms);
        Ok(Self {
            mulaw_to_pcm: OffloadPool::new(
                MulawToPcm {
                    leg_rate: audio.leg_sample_rate,
                    service_rate: audio.service_sample_rate,
                },
                pool.workers,
                timeout,
            )?,
            pcm_to_mulaw: OffloadPool::new(
                PcmToMulaw {
                    service_rate: audio.service_sample_rate,
                    leg_rate: audio.leg_sample_rate,
                },
                pool.workers,
                timeout,
            )?,
            mixer: OffloadPool::new(
                MixToMulaw {
                    service_rate: audio.service_sample_rate,
                    leg_rate: audio.leg_sample_rate,
                },
                pool.workers,
                timeout,
            )?,
        })
    }

    pub async fn close_all(&self) {
        self.mulaw_to_pcm.close().await;
        self.pcm_to_mulaw.close().await;
        self.mixer.close().await;
    }

    pub fn stats(&self) -> Vec<PoolStatsSnapshot> {
        vec![
            self.mulaw_to_pcm.stats(),
            self.pcm_to_mulaw.stats(),
            self.mixer.stats(),
        ]
    }

    /// Per-pool stats keyed by pool name.
    pub fn stats_by_name(&self) -> HashMap<&'static str, PoolStatsSnapshot> {
        self.stats().into_iter().map(|s| (s.name, s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;

    /// Doubles its input; can be told to fail, panic or stall on given values.
    #[derive(Clone)]
    struct Doubler {
        fail_on: Option<u32>,
        panic_on: Option<u32>,
        delay_ms: u64,
    }

    impl Doubler {
        fn quick() -> Self {
            Self { fail_on: None, panic_on: None, delay_ms: 0 }
        }
    }

    impl Transform for Doubler {
        type Input = u32;
        type Output = u32;

        const NAME: &'static str = "doubler";

        fn apply(&self, input: u32) -> Result<u32, TransformError> {
            // Vary the delay so completions arrive out of order
            std::thread::sleep(Duration::from_millis(self.delay_ms * (input % 4) as u64));
            if self.panic_on == Some(input) {
                panic!("boom on {input}");
            }
            if self.fail_on == Some(input) {
                return Err(TransformError::MalformedInput(format!("bad {input}")));
            }
            Ok(input * 2)
        }
    }

    fn pool(transform: Doubler, workers: usize, timeout_ms: u64) -> OffloadPool<Doubler> {
        OffloadPool::new(transform, workers, Duration::from_millis(timeout_ms)).unwrap()
    }

    #[tokio::test]
    async fn test_submit_returns_transform_result() {
        let pool = pool(Doubler::quick(), 2, 500);
        assert_eq!(pool.submit(21).await, Ok(42));
        assert_eq!(pool.pending_count(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_batch_preserves_submission_order() {
        let transform = Doubler { delay_ms: 2, ..Doubler::quick() };
        let pool = pool(transform, 4, 500);

        let results = pool.submit_batch((0..40).collect(), 3).await.unwrap();
        assert_eq!(results.len(), 40);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result, Ok(i as u32 * 2));
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn test_failure_is_local_to_its_slot() {
        let transform = Doubler { fail_on: Some(7), delay_ms: 1, ..Doubler::quick() };
        let pool = pool(transform, 3, 500);

        let results = pool.submit_batch((0..12).collect(), 4).await.unwrap();
        for (i, result) in results.iter().enumerate() {
            if i == 7 {
                assert!(matches!(result, Err(PoolError::Transform(_))));
            } else {
                assert_eq!(*result, Ok(i as u32 * 2));
            }
        }
        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 11);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_worker() {
        let transform = Doubler { panic_on: Some(3), ..Doubler::quick() };
        let pool = pool(transform, 1, 500);

        let err = pool.submit(3).await.unwrap_err();
        assert!(matches!(err, PoolError::Transform(TransformError::Panicked(_))));
        // Same single worker still serves the next task
        assert_eq!(pool.submit(5).await, Ok(10));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding_tasks() {
        let transform = Doubler { delay_ms: 100, ..Doubler::quick() };
        let pool = Arc::new(pool(transform, 1, 20));

        let mut handles = Vec::new();
        for value in [1u32, 2, 3, 1, 2] {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.submit(value).await }));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.pending_count(), 5);

        pool.close().await;

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Err(PoolError::Cancelled));
        }
        let stats = pool.stats();
        assert_eq!(stats.cancelled, 5);
        assert_eq!(stats.pending, 0);
        assert!(stats.closed);
    }

    #[tokio::test]
    async fn test_submit_after_close_fails_fast() {
        let pool = pool(Doubler::quick(), 1, 100);
        pool.close().await;
        pool.close().await;

        assert_eq!(pool.submit(1).await, Err(PoolError::Closed));
        assert_eq!(pool.submit_batch(vec![1, 2], 2).await, Err(PoolError::Closed));
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let pool = pool(Doubler::quick(), 1, 100);
        assert_eq!(pool.submit_batch(vec![1], 0).await, Err(PoolError::InvalidBatchSize));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_dropped_submit_removes_pending_record() {
        let transform = Doubler { delay_ms: 100, ..Doubler::quick() };
        let pool = pool(transform, 1, 20);

        let outcome = tokio::time::timeout(Duration::from_millis(10), pool.submit(3)).await;
        assert!(outcome.is_err());
        assert_eq!(pool.pending_count(), 0);
        pool.close().await;
    }
}
