//! Worker pool supervision.
//!
//! [`WorkerPool`] owns a fixed arena of worker slots. It is the only writer
//! of pool status and slot membership. Lifecycle operations (`start`,
//! `reload`) are single-flight and fail fast with [`PoolError::Busy`];
//! `stop` and crash remediation wait for the lifecycle lock instead.
//!
//! Crashed workers are found on the dispatch path and by a periodic
//! liveness check, and are replaced in their own slot without touching
//! siblings.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use worker_runtime_common::{
    PoolConfig, PoolError, PoolStatus, RuntimeError, WorkerError, WorkerStatus,
};

use crate::entry::{EntryPoint, Request, Response};
use crate::event::{PoolEvent, RestartReason};
use crate::handle::{StopOutcome, WorkerHandle};
use crate::worker::{Worker, WorkerSnapshot};

const EVENT_CAPACITY: usize = 256;
const RECYCLE_POLL: Duration = Duration::from_millis(5);

/// A teardown failure collected during [`WorkerPool::stop`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownError {
    /// Slot of the worker.
    pub slot: usize,
    /// Error message reported by the entry point.
    pub message: String,
}

/// Result of stopping the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Workers that reached `Stopped`.
    pub stopped: usize,
    /// Teardown failures, by slot.
    pub teardown_errors: Vec<TeardownError>,
    /// Slots abandoned after the grace period.
    pub aborted: Vec<usize>,
}

impl StopReport {
    /// Returns `true` if every worker stopped cleanly.
    pub fn is_clean(&self) -> bool {
        self.teardown_errors.is_empty() && self.aborted.is_empty()
    }
}

type Slot = Option<Arc<WorkerHandle>>;

struct PoolShared<E: EntryPoint> {
    entry: Arc<E>,
    app: Arc<E::App>,
    config: PoolConfig,
    worker_count: AtomicUsize,
    lifecycle: tokio::sync::Mutex<()>,
    phase: RwLock<PoolStatus>,
    slots: RwLock<Vec<Slot>>,
    next: AtomicUsize,
    generation: AtomicU64,
    events: broadcast::Sender<PoolEvent>,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

/// Fixed-size supervisor for a generation of workers.
///
/// Cloning is cheap; clones share the same pool.
pub struct WorkerPool<E: EntryPoint> {
    shared: Arc<PoolShared<E>>,
}

impl<E: EntryPoint> Clone for WorkerPool<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: EntryPoint> WorkerPool<E> {
    /// Create a stopped pool.
    ///
    /// `config.workers` is the initial worker count and
    /// `config.max_requests` the per-worker budget.
    pub fn new(entry: Arc<E>, app: Arc<E::App>, config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let worker_count = config.workers.max(1);

        Self {
            shared: Arc::new(PoolShared {
                entry,
                app,
                config,
                worker_count: AtomicUsize::new(worker_count),
                lifecycle: tokio::sync::Mutex::new(()),
                phase: RwLock::new(PoolStatus::Stopped),
                slots: RwLock::new(Vec::new()),
                next: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                events,
                liveness: Mutex::new(None),
            }),
        }
    }

    /// Set the number of workers spawned by the next [`start`](Self::start).
    ///
    /// A running pool is not resized.
    pub fn set_worker_count(&self, count: usize) -> Result<(), RuntimeError> {
        if count == 0 {
            return Err(RuntimeError::config("worker count must be at least 1"));
        }
        self.shared.worker_count.store(count, Ordering::Release);
        Ok(())
    }

    /// Number of workers spawned on start.
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count.load(Ordering::Acquire)
    }

    /// Request budget of every worker.
    pub fn max_requests(&self) -> u64 {
        self.shared.config.max_requests
    }

    /// Subscribe to worker and pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Pool status.
    ///
    /// A started pool reports `Running` only while every slot holds a
    /// `Running` worker, and `Degraded` otherwise.
    pub fn status(&self) -> PoolStatus {
        let phase = *self.shared.phase.read();
        if phase != PoolStatus::Running {
            return phase;
        }

        let slots = self.shared.slots.read();
        let all_running = !slots.is_empty()
            && slots.iter().all(|slot| {
                slot.as_ref().is_some_and(|handle| {
                    handle.is_alive() && handle.status() == WorkerStatus::Running
                })
            });

        if all_running {
            PoolStatus::Running
        } else {
            PoolStatus::Degraded
        }
    }

    /// Snapshots of every occupied slot, in slot order.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.shared
            .slots
            .read()
            .iter()
            .flatten()
            .map(|handle| handle.snapshot())
            .collect()
    }

    /// Snapshot of one slot, `None` if the slot is vacant or out of range.
    pub fn worker(&self, slot: usize) -> Option<WorkerSnapshot> {
        self.handle(slot).map(|handle| handle.snapshot())
    }

    /// Number of slots in the running pool.
    pub fn size(&self) -> usize {
        self.shared.slots.read().len()
    }

    /// Spawn and start every worker.
    ///
    /// If any worker fails to start, the workers already started are
    /// stopped and the original error is returned.
    #[instrument(skip(self), fields(workers = self.worker_count()))]
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let _guard = self
            .shared
            .lifecycle
            .try_lock()
            .map_err(|_| PoolError::Busy)?;

        if *self.shared.phase.read() != PoolStatus::Stopped {
            return Err(PoolError::AlreadyRunning.into());
        }
        self.set_phase(PoolStatus::Starting);

        let count = self.worker_count();
        let mut started: Vec<Arc<WorkerHandle>> = Vec::with_capacity(count);

        for slot in 0..count {
            match self.spawn_worker(slot).await {
                Ok(handle) => started.push(Arc::new(handle)),
                Err(err) => {
                    warn!(slot, error = %err, "Worker failed to start, rolling back pool start");
                    for handle in &started {
                        handle.stop(self.shared.config.stop_grace()).await;
                    }
                    self.set_phase(PoolStatus::Stopped);
                    return Err(err.into());
                }
            }
        }

        *self.shared.slots.write() = started.into_iter().map(Some).collect();
        self.set_phase(PoolStatus::Running);
        self.spawn_liveness();

        info!(
            workers = count,
            max_requests = self.shared.config.max_requests,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop every worker.
    ///
    /// Idempotent. Teardown failures and workers abandoned after the grace
    /// period are collected in the report; the pool always ends `Stopped`.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> StopReport {
        let _guard = self.shared.lifecycle.lock().await;

        if *self.shared.phase.read() == PoolStatus::Stopped {
            debug!("Worker pool already stopped");
            return StopReport::default();
        }
        self.set_phase(PoolStatus::Stopping);

        if let Some(task) = self.shared.liveness.lock().take() {
            task.abort();
        }

        let handles: Vec<Arc<WorkerHandle>> = std::mem::take(&mut *self.shared.slots.write())
            .into_iter()
            .flatten()
            .collect();

        let grace = self.shared.config.stop_grace();
        let mut tasks = JoinSet::new();
        for handle in handles {
            tasks.spawn(async move {
                let outcome = handle.stop(grace).await;
                (handle.slot(), handle.generation(), outcome)
            });
        }

        let mut report = StopReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, _, StopOutcome::Completed { teardown_error })) => {
                    report.stopped += 1;
                    if let Some(message) = teardown_error {
                        report.teardown_errors.push(TeardownError { slot, message });
                    }
                }
                Ok((slot, generation, StopOutcome::Abandoned)) => {
                    self.emit(PoolEvent::Abandoned { slot, generation });
                    report.aborted.push(slot);
                }
                Err(err) => warn!(error = %err, "Worker stop task failed"),
            }
        }
        report.teardown_errors.sort_by_key(|e| e.slot);
        report.aborted.sort_unstable();

        self.set_phase(PoolStatus::Stopped);
        info!(
            stopped = report.stopped,
            teardown_errors = report.teardown_errors.len(),
            aborted = report.aborted.len(),
            "Worker pool stopped"
        );
        report
    }

    /// Reload every worker, one at a time.
    ///
    /// At most one worker is outside `Running` at any moment. A worker
    /// that does not come back is replaced in its slot.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<(), RuntimeError> {
        let _guard = self
            .shared
            .lifecycle
            .try_lock()
            .map_err(|_| PoolError::Busy)?;

        if *self.shared.phase.read() != PoolStatus::Running {
            return Err(PoolError::NotRunning.into());
        }
        self.set_phase(PoolStatus::Reloading);

        let size = self.size();
        let mut replaced = 0usize;

        for slot in 0..size {
            self.settle_recycles(slot).await;

            let reason = match self.handle(slot) {
                None => Some(RestartReason::Vacant),
                Some(handle) if !handle.is_alive() => Some(RestartReason::ThreadExited),
                Some(handle) => match handle.reload().await {
                    Ok(()) => None,
                    Err(err) => {
                        warn!(slot, error = %err, "Worker did not come back from reload");
                        Some(reload_failure_reason(&err))
                    }
                },
            };

            if let Some(reason) = reason {
                if self.replace_slot(slot, reason).await {
                    replaced += 1;
                }
            }
        }

        self.set_phase(PoolStatus::Running);
        info!(workers = size, replaced, "Worker pool reloaded");
        Ok(())
    }

    /// Wait until no worker other than `slot` is recycling.
    async fn settle_recycles(&self, slot: usize) {
        loop {
            let recycling = self
                .shared
                .slots
                .read()
                .iter()
                .enumerate()
                .any(|(other, current)| {
                    other != slot
                        && current.as_ref().is_some_and(|handle| {
                            handle.is_alive() && handle.status() == WorkerStatus::Reloading
                        })
                });
            if !recycling {
                return;
            }
            tokio::time::sleep(RECYCLE_POLL).await;
        }
    }

    /// Dispatch a request to the next `Running` worker, round-robin.
    ///
    /// While the pool reloads, workers one request away from their budget
    /// are passed over; if every running worker is, the request fails with
    /// [`PoolError::NoAvailableWorker`].
    pub async fn dispatch(&self, request: Request) -> Result<Response, RuntimeError> {
        self.ensure_serving()?;

        let slots = self.shared.slots.read().clone();
        let size = slots.len();
        if size == 0 {
            return Err(PoolError::NoAvailableWorker.into());
        }

        // During a rolling reload a worker is only picked if this request
        // cannot make it recycle, so at most one worker is ever reloading.
        let reloading = *self.shared.phase.read() == PoolStatus::Reloading;
        let mut request = request;

        let start = self.shared.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..size {
            let slot = (start + offset) % size;
            let Some(handle) = &slots[slot] else {
                continue;
            };
            if !handle.is_alive() || handle.status() != WorkerStatus::Running {
                continue;
            }

            if !reloading {
                return self.dispatch_on(handle, request).await;
            }
            match handle.dispatch_within_budget(request).await {
                Ok(result) => return self.settle(handle, result).await,
                Err(returned) => request = returned,
            }
        }

        if reloading {
            debug!("Every running worker is at its budget during reload");
        } else {
            self.check_liveness().await;
        }
        Err(PoolError::NoAvailableWorker.into())
    }

    /// Dispatch a request to a specific slot.
    ///
    /// A crashed or stopped worker in that slot is replaced first. During a
    /// reload the same budget rule as [`dispatch`](Self::dispatch) applies.
    pub async fn dispatch_to(&self, slot: usize, request: Request) -> Result<Response, RuntimeError> {
        self.ensure_serving()?;

        let size = self.size();
        if slot >= size {
            return Err(PoolError::InvalidSlot { slot, size }.into());
        }

        let handle = match self.handle(slot) {
            Some(handle) if needs_repair(&handle).is_none() => handle,
            current => {
                self.remediate(slot, current.map(|handle| handle.generation()))
                    .await;
                self.handle(slot).ok_or(PoolError::NoAvailableWorker)?
            }
        };

        if *self.shared.phase.read() == PoolStatus::Reloading {
            return match handle.dispatch_within_budget(request).await {
                Ok(result) => self.settle(&handle, result).await,
                Err(_) => Err(PoolError::NoAvailableWorker.into()),
            };
        }
        self.dispatch_on(&handle, request).await
    }

    /// Replace every crashed, stopped, dead, or vacant slot.
    ///
    /// Skipped while another lifecycle operation holds the pool. Returns
    /// the number of workers replaced.
    pub async fn check_liveness(&self) -> usize {
        if *self.shared.phase.read() != PoolStatus::Running {
            return 0;
        }

        let repairs: Vec<(usize, Option<u64>)> = self
            .shared
            .slots
            .read()
            .iter()
            .enumerate()
            .filter_map(|(slot, current)| match current {
                Some(handle) => needs_repair(handle).map(|_| (slot, Some(handle.generation()))),
                None => Some((slot, None)),
            })
            .collect();

        if repairs.is_empty() {
            return 0;
        }

        let Ok(_guard) = self.shared.lifecycle.try_lock() else {
            return 0;
        };

        let mut replaced = 0;
        for (slot, generation) in repairs {
            if self.repair_locked(slot, generation).await {
                replaced += 1;
            }
        }
        replaced
    }

    async fn dispatch_on(
        &self,
        handle: &Arc<WorkerHandle>,
        request: Request,
    ) -> Result<Response, RuntimeError> {
        let result = handle.dispatch(request).await;
        self.settle(handle, result).await
    }

    /// Replace the worker if the dispatch left it unusable.
    async fn settle(
        &self,
        handle: &Arc<WorkerHandle>,
        result: Result<Response, WorkerError>,
    ) -> Result<Response, RuntimeError> {
        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                if err.is_recoverable() {
                    self.remediate(handle.slot(), Some(handle.generation()))
                        .await;
                }
                Err(err.into())
            }
        }
    }

    /// Replace the worker in `slot` if it is still the one that failed.
    async fn remediate(&self, slot: usize, generation: Option<u64>) {
        let _guard = self.shared.lifecycle.lock().await;
        self.repair_locked(slot, generation).await;
    }

    /// Caller holds the lifecycle lock.
    async fn repair_locked(&self, slot: usize, generation: Option<u64>) -> bool {
        if *self.shared.phase.read() != PoolStatus::Running {
            return false;
        }

        let reason = match (self.handle(slot), generation) {
            (Some(handle), Some(expected)) if handle.generation() == expected => {
                match needs_repair(&handle) {
                    Some(reason) => reason,
                    None => return false,
                }
            }
            (None, None) => RestartReason::Vacant,
            // Already replaced by someone else.
            _ => return false,
        };

        self.replace_slot(slot, reason).await
    }

    /// Stop whatever occupies `slot` and start a fresh worker there.
    ///
    /// Caller holds the lifecycle lock. On failure the slot stays vacant.
    async fn replace_slot(&self, slot: usize, reason: RestartReason) -> bool {
        let previous = self
            .shared
            .slots
            .write()
            .get_mut(slot)
            .and_then(Option::take);

        if let Some(previous) = previous {
            let outcome = previous.stop(self.shared.config.stop_grace()).await;
            if outcome == StopOutcome::Abandoned {
                self.emit(PoolEvent::Abandoned {
                    slot,
                    generation: previous.generation(),
                });
            }
        }

        match self.spawn_worker(slot).await {
            Ok(handle) => {
                let generation = handle.generation();
                if let Some(entry) = self.shared.slots.write().get_mut(slot) {
                    *entry = Some(Arc::new(handle));
                }
                info!(slot, generation, ?reason, "Worker restarted");
                self.emit(PoolEvent::Restarted {
                    slot,
                    generation,
                    reason,
                });
                true
            }
            Err(err) => {
                error!(slot, error = %err, "Worker restart failed, slot left vacant");
                self.emit(PoolEvent::RestartFailed {
                    slot,
                    reason: err.to_string(),
                });
                false
            }
        }
    }

    async fn spawn_worker(&self, slot: usize) -> Result<WorkerHandle, WorkerError> {
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::new(
            slot,
            self.shared.config.max_requests,
            Arc::clone(&self.shared.entry),
            Arc::clone(&self.shared.app),
        )
        .with_generation(generation)
        .with_events(self.shared.events.clone());

        WorkerHandle::spawn(worker, self.shared.config.command_queue).await
    }

    fn spawn_liveness(&self) {
        let Some(interval) = self.shared.config.liveness_interval() else {
            return;
        };

        let shared: Weak<PoolShared<E>> = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let replaced = WorkerPool { shared }.check_liveness().await;
                if replaced > 0 {
                    debug!(replaced, "Liveness check replaced workers");
                }
            }
        });

        if let Some(previous) = self.shared.liveness.lock().replace(task) {
            previous.abort();
        }
    }

    fn ensure_serving(&self) -> Result<(), PoolError> {
        match *self.shared.phase.read() {
            PoolStatus::Running | PoolStatus::Reloading | PoolStatus::Degraded => Ok(()),
            _ => Err(PoolError::NotRunning),
        }
    }

    fn handle(&self, slot: usize) -> Option<Arc<WorkerHandle>> {
        self.shared.slots.read().get(slot).cloned().flatten()
    }

    fn set_phase(&self, phase: PoolStatus) {
        *self.shared.phase.write() = phase;
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.shared.events.send(event);
    }
}

impl<E: EntryPoint> std::fmt::Debug for WorkerPool<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("status", &self.status())
            .field("worker_count", &self.worker_count())
            .field("workers", &self.workers())
            .finish_non_exhaustive()
    }
}

/// Why a worker must be replaced, or `None` if it is healthy.
fn needs_repair(handle: &WorkerHandle) -> Option<RestartReason> {
    if !handle.is_alive() {
        return Some(RestartReason::ThreadExited);
    }
    match handle.status() {
        WorkerStatus::Crashed => Some(RestartReason::Crashed),
        // A worker that failed to come back from a recycle.
        WorkerStatus::Stopped => Some(RestartReason::ReloadFailed),
        _ => None,
    }
}

fn reload_failure_reason(err: &WorkerError) -> RestartReason {
    match err {
        WorkerError::NotRunning {
            status: WorkerStatus::Crashed,
            ..
        } => RestartReason::Crashed,
        WorkerError::Unavailable { .. } => RestartReason::ThreadExited,
        _ => RestartReason::ReloadFailed,
    }
}
