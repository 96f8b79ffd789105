//! Process-wide pool that resolves tracks in the background.
//!
//! `submit` never waits: it either lands the task on a bounded lane or
//! reports [`PoolError::QueueFull`] so the caller can decide how to back off.
//! A track id is "in flight" from the moment it is accepted until its worker
//! finishes, and duplicate submissions during that window are ignored.

use dashmap::DashSet;
use flume::{Receiver, Sender, TrySendError};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::{Resolve, Track};
use crate::error::PoolError;

/// Submission priority. High-priority tasks are always dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

struct Task {
    track: Arc<Track>,
    priority: Priority,
}

struct Lanes {
    high: Sender<Task>,
    normal: Sender<Task>,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Releases the in-flight marker however the task ends.
struct InFlightGuard {
    set: Arc<DashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

pub struct WorkerPool {
    lanes: RwLock<Option<Lanes>>,
    in_flight: Arc<DashSet<Uuid>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Starts `workers` long-lived workers, each lane bounded to `queue_size` tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(resolver: Arc<dyn Resolve>, workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let (high_tx, high_rx) = flume::bounded(queue_size.max(1));
        let (normal_tx, normal_rx) = flume::bounded(queue_size.max(1));
        let in_flight = Arc::new(DashSet::new());
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let handles = (0..workers)
            .map(|index| {
                let worker = Worker {
                    resolver: Arc::clone(&resolver),
                    high: high_rx.clone(),
                    normal: normal_rx.clone(),
                    in_flight: Arc::clone(&in_flight),
                    counters: Arc::clone(&counters),
                    cancel: cancel.clone(),
                };
                tokio::spawn(
                    worker
                        .run()
                        .instrument(tracing::info_span!("resolver", worker = index)),
                )
            })
            .collect();

        info!("🧵 Resolution pool started: {} workers, {} slots per lane", workers, queue_size);

        Self {
            lanes: RwLock::new(Some(Lanes {
                high: high_tx,
                normal: normal_tx,
            })),
            in_flight,
            counters,
            cancel,
            workers: Mutex::new(handles),
            worker_count: workers,
        }
    }

    /// Queues a track for resolution without waiting.
    ///
    /// Re-submitting a track that is already in flight, or already resolved,
    /// succeeds without doing anything.
    pub fn submit(&self, track: Arc<Track>, priority: Priority) -> Result<(), PoolError> {
        let lanes = self.lanes.read();
        let lanes = lanes.as_ref().ok_or(PoolError::Stopped)?;

        if track.status().is_terminal() {
            debug!("Track {} already resolved, skipping", track.id());
            return Ok(());
        }

        let id = track.id();
        if !self.in_flight.insert(id) {
            debug!("Track {} already in flight", id);
            return Ok(());
        }

        let lane = match priority {
            Priority::High => &lanes.high,
            Priority::Normal => &lanes.normal,
        };

        match lane.try_send(Task { track, priority }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.in_flight.remove(&id);
                warn!("📛 Resolution queue full, rejected track {}", id);
                Err(PoolError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.remove(&id);
                Err(PoolError::Stopped)
            }
        }
    }

    pub fn is_in_flight(&self, id: &Uuid) -> bool {
        self.in_flight.contains(id)
    }

    pub fn is_stopped(&self) -> bool {
        self.lanes.read().is_none()
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self
            .lanes
            .read()
            .as_ref()
            .map(|lanes| lanes.high.len() + lanes.normal.len())
            .unwrap_or(0);
        PoolStats {
            workers: self.worker_count,
            queued,
            in_flight: self.in_flight.len(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops intake, cancels idle workers and waits for running tasks.
    ///
    /// Tasks still queued are dropped; their tracks stay in their current
    /// status and may be submitted to another pool.
    pub async fn shutdown(&self) {
        let lanes = self.lanes.write().take();
        if lanes.is_none() {
            return;
        }
        drop(lanes);
        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Resolution worker ended abnormally: {}", e);
            }
        }
        info!("🛑 Resolution pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    resolver: Arc<dyn Resolve>,
    high: Receiver<Task>,
    normal: Receiver<Task>,
    in_flight: Arc<DashSet<Uuid>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let task = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Ok(task) = self.high.recv_async() => task,
                Ok(task) = self.normal.recv_async() => task,
                else => break,
            };
            self.process(task).await;
        }

        // whatever is still queued will never run here
        for task in self.high.drain().chain(self.normal.drain()) {
            self.in_flight.remove(&task.track.id());
        }
        debug!("Worker exiting");
    }

    async fn process(&self, task: Task) {
        let track = task.track;
        let _guard = InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id: track.id(),
        };

        if !track.mark_processing() {
            debug!("Track {} was not pending, skipping", track.id());
            return;
        }
        debug!(
            "⚙️ Resolving {} ({:?}, {}): {}",
            track.id(),
            task.priority,
            track.kind(),
            track.input()
        );

        let outcome = AssertUnwindSafe(self.resolver.resolve(&track))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(resolution)) => {
                info!("✅ Resolved: {}", resolution.metadata.title);
                track.mark_ready(resolution.metadata, resolution.stream_url);
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                warn!("❌ Resolution failed for '{}': {}", track.input(), e);
                track.mark_failed(e.to_string());
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                error!("💥 Resolver panicked on '{}'", track.input());
                track.mark_failed("resolver panicked");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
