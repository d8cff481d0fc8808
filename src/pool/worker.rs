//! # Worker and Resolver Loops
//!
//! The two kinds of background threads an `OffloadPool` runs.
//!
//! ## Worker threads:
//! Each worker owns one clone of the transform. It blocks on the shared work
//! queue, applies the transform to every task in the item it receives and
//! pushes one `Completion::Done` per task onto the shared completion queue.
//! A `Shutdown` sentinel (or a disconnected queue) ends the loop.
//!
//! ## Resolver thread:
//! Drains the completion queue and settles the matching pending slot. Ids
//! with no pending slot were already cancelled by shutdown or abandoned by
//! their caller and are dropped.
//!
//! Workers and the pool only talk through the two queues; the only state the
//! resolver shares with the pool is the pending table.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use super::PoolStats;
use crate::audio::Transform;
use crate::error::{PoolError, TransformError};

/// One entry on the shared work queue.
pub(crate) enum WorkItem<I> {
    Single(Uuid, I),
    Batch(Vec<(Uuid, I)>),
    Shutdown,
}

/// One entry on the shared completion queue.
pub(crate) enum Completion<O> {
    Done {
        id: Uuid,
        outcome: Result<O, TransformError>,
    },
    Stop,
}

pub(crate) type ResultSlot<O> = oneshot::Sender<Result<O, PoolError>>;

/// Outstanding tasks, keyed by task id. `closed` flips once at shutdown and
/// is checked under the same lock as registration, so no task can be
/// registered after the final cancellation sweep.
pub(crate) struct PendingTable<O> {
    pub closed: bool,
    pub slots: HashMap<Uuid, ResultSlot<O>>,
}

impl<O> PendingTable<O> {
    pub fn new() -> Self {
        Self {
            closed: false,
            slots: HashMap::new(),
        }
    }
}

pub(crate) fn run_worker<T: Transform>(
    transform: T,
    work_rx: Receiver<WorkItem<T::Input>>,
    done_tx: Sender<Completion<T::Output>>,
) {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or(T::NAME)
        .to_string();
    debug!(worker = %thread_name, "worker started");

    loop {
        let tasks = match work_rx.recv() {
            Ok(WorkItem::Single(id, input)) => vec![(id, input)],
            Ok(WorkItem::Batch(items)) => items,
            Ok(WorkItem::Shutdown) | Err(_) => break,
        };

        for (id, input) in tasks {
            let outcome = apply_guarded(&transform, input);
            if let Err(err) = &outcome {
                debug!(worker = %thread_name, task_id = %id, "transform failed: {}", err);
            }
            if done_tx.send(Completion::Done { id, outcome }).is_err() {
                debug!(worker = %thread_name, "completion queue closed, exiting");
                return;
            }
        }
    }

    debug!(worker = %thread_name, "worker stopped");
}

/// Run the transform, turning a panic into a per-task error so the worker
/// keeps serving the rest of the queue.
fn apply_guarded<T: Transform>(transform: &T, input: T::Input) -> Result<T::Output, TransformError> {
    match catch_unwind(AssertUnwindSafe(|| transform.apply(input))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(TransformError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn run_resolver<O: Send + 'static>(
    pool_name: &'static str,
    done_rx: Receiver<Completion<O>>,
    pending: Arc<Mutex<PendingTable<O>>>,
    stats: Arc<PoolStats>,
) {
    debug!(pool = pool_name, "resolver started");

    loop {
        // Drain whatever is ready, then park on the queue instead of spinning
        let completion = match done_rx.try_recv() {
            Ok(completion) => completion,
            Err(TryRecvError::Empty) => match done_rx.recv() {
                Ok(completion) => completion,
                Err(_) => break,
            },
            Err(TryRecvError::Disconnected) => break,
        };

        let (id, outcome) = match completion {
            Completion::Done { id, outcome } => (id, outcome),
            Completion::Stop => break,
        };

        let slot = pending.lock().slots.remove(&id);
        let Some(slot) = slot else {
            debug!(pool = pool_name, task_id = %id, "dropping result for unknown task");
            continue;
        };

        match &outcome {
            Ok(_) => stats.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => stats.failed.fetch_add(1, Ordering::Relaxed),
        };

        if slot.send(outcome.map_err(PoolError::from)).is_err() {
            warn!(pool = pool_name, task_id = %id, "result receiver already dropped");
        }
    }

    debug!(pool = pool_name, "resolver stopped");
}
