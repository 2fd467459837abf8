//! Worker state machine.
//!
//! A [`Worker`] owns one slot's request counter and status. Only the worker
//! mutates them; everyone else reads the published [`WorkerSnapshot`].
//! Every state change goes through [`WorkerStatus::can_transition_to`], so an
//! illegal transition is a typed error instead of a silent state corruption.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use worker_runtime_common::{BoxError, WorkerError, WorkerStatus};

use crate::entry::{DispatchContext, EntryPoint, Request, Response};
use crate::event::PoolEvent;

/// Point-in-time view of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    /// Slot index in the pool.
    pub slot: usize,
    /// Pool-wide spawn counter value when this worker was created. Unique
    /// per worker and increasing, but not consecutive within a slot.
    pub generation: u64,
    /// Current state.
    pub status: WorkerStatus,
    /// Requests served since the last start or reload.
    pub requests: u64,
    /// Request budget before the worker recycles itself.
    pub max_requests: u64,
}

/// A single worker bound to a pool slot.
pub struct Worker<E: EntryPoint> {
    slot: usize,
    generation: u64,
    status: WorkerStatus,
    requests: u64,
    max_requests: u64,
    entry: Arc<E>,
    app: Arc<E::App>,
    snapshot: Arc<RwLock<WorkerSnapshot>>,
    events: Option<broadcast::Sender<PoolEvent>>,
    aborted: Arc<AtomicBool>,
}

impl<E: EntryPoint> Worker<E> {
    /// Create a stopped worker for `slot` with a budget of `max_requests`.
    pub fn new(slot: usize, max_requests: u64, entry: Arc<E>, app: Arc<E::App>) -> Self {
        let snapshot = WorkerSnapshot {
            slot,
            generation: 0,
            status: WorkerStatus::Stopped,
            requests: 0,
            max_requests,
        };

        Self {
            slot,
            generation: 0,
            status: WorkerStatus::Stopped,
            requests: 0,
            max_requests,
            entry,
            app,
            snapshot: Arc::new(RwLock::new(snapshot)),
            events: None,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish transitions and recycles on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<PoolEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self.publish();
        self
    }

    /// Slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Generation of this worker within its slot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current state.
    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    /// Requests served since the last start or reload.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Request budget.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> WorkerSnapshot {
        *self.snapshot.read()
    }

    pub(crate) fn snapshot_handle(&self) -> Arc<RwLock<WorkerSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    pub(crate) fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }

    /// Start the worker.
    ///
    /// Only legal from `Stopped`. Resets the request counter and calls the
    /// entry point's `initialize`. On failure the worker is back in
    /// `Stopped` and [`WorkerError::Start`] is returned.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        self.transition(WorkerStatus::Starting)?;
        self.requests = 0;
        self.aborted.store(false, Ordering::Release);

        let entry = Arc::clone(&self.entry);
        let app = Arc::clone(&self.app);
        let slot = self.slot;

        match guarded(|| entry.initialize(&app, slot)) {
            Ok(()) => {
                self.transition(WorkerStatus::Running)?;
                info!(slot, generation = self.generation, "Worker started");
                Ok(())
            }
            Err(reason) => {
                self.transition(WorkerStatus::Stopped)?;
                warn!(slot, generation = self.generation, error = %reason, "Worker failed to start");
                Err(WorkerError::Start { slot, reason })
            }
        }
    }

    /// Dispatch one request and recycle the worker if its budget is spent.
    ///
    /// The response is produced before the recycle runs; a failed recycle
    /// is logged and left for the pool to repair.
    pub fn dispatch(&mut self, request: Request) -> Result<Response, WorkerError> {
        let response = self.serve(request)?;

        if let Err(err) = self.recycle_if_exhausted() {
            warn!(slot = self.slot, error = %err, "Worker recycle failed");
        }

        Ok(response)
    }

    /// Dispatch one request without recycling.
    ///
    /// The counter is incremented before the entry point runs, so a crash
    /// still counts against the budget.
    pub(crate) fn serve(&mut self, request: Request) -> Result<Response, WorkerError> {
        match self.status {
            WorkerStatus::Running => {}
            WorkerStatus::Reloading => return Err(WorkerError::Busy { slot: self.slot }),
            status => {
                return Err(WorkerError::NotRunning {
                    slot: self.slot,
                    status,
                });
            }
        }

        self.requests += 1;
        self.publish();

        let ctx = DispatchContext::new(self.slot, self.requests, Arc::clone(&self.aborted));
        let entry = Arc::clone(&self.entry);
        let app = Arc::clone(&self.app);

        match guarded(|| entry.dispatch(&app, &ctx, request)) {
            Ok(response) => Ok(response),
            Err(reason) => {
                warn!(
                    slot = self.slot,
                    generation = self.generation,
                    requests = self.requests,
                    error = %reason,
                    "Worker crashed during dispatch"
                );
                self.transition(WorkerStatus::Crashed)?;
                Err(WorkerError::Crashed {
                    slot: self.slot,
                    reason,
                })
            }
        }
    }

    /// Returns `true` once the worker has served its whole budget.
    pub fn is_exhausted(&self) -> bool {
        self.requests >= self.max_requests
    }

    /// Reload the worker if its budget is spent. Returns `true` if it did.
    pub(crate) fn recycle_if_exhausted(&mut self) -> Result<bool, WorkerError> {
        if self.status != WorkerStatus::Running || !self.is_exhausted() {
            return Ok(false);
        }

        debug!(
            slot = self.slot,
            generation = self.generation,
            requests = self.requests,
            "Request budget exhausted, recycling worker"
        );
        self.emit(PoolEvent::Recycled {
            slot: self.slot,
            generation: self.generation,
            requests: self.requests,
        });

        self.reload().map(|()| true)
    }

    /// Tear down and re-initialize the worker.
    ///
    /// Only legal in `Running`. Goes `Running -> Reloading -> Running` and
    /// resets the counter. If re-initialization fails the worker ends in
    /// `Stopped` and [`WorkerError::Start`] is returned.
    pub fn reload(&mut self) -> Result<(), WorkerError> {
        if self.status != WorkerStatus::Running {
            return Err(WorkerError::NotRunning {
                slot: self.slot,
                status: self.status,
            });
        }

        self.transition(WorkerStatus::Reloading)?;

        let entry = Arc::clone(&self.entry);
        let app = Arc::clone(&self.app);
        let slot = self.slot;

        if let Err(reason) = guarded(|| entry.teardown(&app, slot)) {
            warn!(slot, error = %reason, "Teardown failed during reload");
        }

        match guarded(|| entry.initialize(&app, slot)) {
            Ok(()) => {
                self.requests = 0;
                self.transition(WorkerStatus::Running)?;
                info!(slot, generation = self.generation, "Worker reloaded");
                Ok(())
            }
            Err(reason) => {
                warn!(slot, error = %reason, "Worker failed to come back from reload");
                self.transition(WorkerStatus::Stopping)?;
                self.transition(WorkerStatus::Stopped)?;
                Err(WorkerError::Start { slot, reason })
            }
        }
    }

    /// Stop the worker.
    ///
    /// Legal from every state except `Stopped` and always ends in
    /// `Stopped`. A teardown failure does not block the stop; its message
    /// is returned instead.
    pub fn stop(&mut self) -> Result<Option<String>, WorkerError> {
        self.transition(WorkerStatus::Stopping)?;

        let entry = Arc::clone(&self.entry);
        let app = Arc::clone(&self.app);
        let slot = self.slot;

        let teardown_error = guarded(|| entry.teardown(&app, slot)).err();
        if let Some(reason) = &teardown_error {
            warn!(slot, error = %reason, "Teardown failed during stop");
        }

        self.transition(WorkerStatus::Stopped)?;
        debug!(slot, generation = self.generation, "Worker stopped");
        Ok(teardown_error)
    }

    fn transition(&mut self, to: WorkerStatus) -> Result<(), WorkerError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(WorkerError::IllegalTransition {
                slot: self.slot,
                from,
                to,
            });
        }

        self.status = to;
        self.publish();
        self.emit(PoolEvent::Transition {
            slot: self.slot,
            generation: self.generation,
            from,
            to,
        });
        Ok(())
    }

    fn publish(&self) {
        *self.snapshot.write() = WorkerSnapshot {
            slot: self.slot,
            generation: self.generation,
            status: self.status,
            requests: self.requests,
            max_requests: self.max_requests,
        };
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(events) = &self.events {
            // No subscribers is fine.
            let _ = events.send(event);
        }
    }
}

/// Run an entry point call, turning both errors and panics into a message.
fn guarded<T>(f: impl FnOnce() -> Result<T, BoxError>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        initialized: AtomicUsize,
        torn_down: AtomicUsize,
        fail_initialize_from: Option<usize>,
        fail_teardown: bool,
    }

    impl EntryPoint for Recorder {
        type App = String;

        fn initialize(&self, _app: &String, _slot: usize) -> Result<(), BoxError> {
            let calls = self.initialized.fetch_add(1, Ordering::SeqCst);
            match self.fail_initialize_from {
                Some(from) if calls >= from => Err("initialize refused".into()),
                _ => Ok(()),
            }
        }

        fn dispatch(
            &self,
            app: &String,
            ctx: &DispatchContext,
            request: Request,
        ) -> Result<Response, BoxError> {
            match request.path() {
                "/error" => Err("application error".into()),
                "/panic" => panic!("handler exploded"),
                _ => Ok(Response::text(200, &format!("{app}:{}", ctx.request_number()))),
            }
        }

        fn teardown(&self, _app: &String, _slot: usize) -> Result<(), BoxError> {
            self.torn_down.fetch_add(1, Ordering::SeqCst);
            if self.fail_teardown {
                Err("teardown refused".into())
            } else {
                Ok(())
            }
        }
    }

    fn worker(recorder: Recorder, max_requests: u64) -> (Worker<Recorder>, Arc<Recorder>) {
        let recorder = Arc::new(recorder);
        let worker = Worker::new(0, max_requests, Arc::clone(&recorder), Arc::new("app".into()));
        (worker, recorder)
    }

    #[test]
    fn test_start_from_stopped() {
        let (mut worker, recorder) = worker(Recorder::default(), 10);
        assert_eq!(worker.status(), WorkerStatus::Stopped);

        worker.start().unwrap();

        assert_eq!(worker.status(), WorkerStatus::Running);
        assert_eq!(worker.requests(), 0);
        assert_eq!(recorder.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(worker.snapshot().status, WorkerStatus::Running);
    }

    #[test]
    fn test_start_twice_is_illegal() {
        let (mut worker, _) = worker(Recorder::default(), 10);
        worker.start().unwrap();

        let err = worker.start().unwrap_err();
        assert!(matches!(
            err,
            WorkerError::IllegalTransition {
                from: WorkerStatus::Running,
                to: WorkerStatus::Starting,
                ..
            }
        ));
        assert_eq!(worker.status(), WorkerStatus::Running);
    }

    #[test]
    fn test_start_failure_leaves_stopped() {
        let recorder = Recorder {
            fail_initialize_from: Some(0),
            ..Recorder::default()
        };
        let (mut worker, _) = worker(recorder, 10);

        let err = worker.start().unwrap_err();

        assert!(matches!(err, WorkerError::Start { slot: 0, .. }));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[test]
    fn test_dispatch_requires_running() {
        let (mut worker, _) = worker(Recorder::default(), 10);

        let err = worker.dispatch(Request::new("GET", "/")).unwrap_err();
        assert!(matches!(
            err,
            WorkerError::NotRunning {
                status: WorkerStatus::Stopped,
                ..
            }
        ));
        assert_eq!(worker.requests(), 0);
    }

    #[test]
    fn test_dispatch_counts_requests() {
        let (mut worker, _) = worker(Recorder::default(), 10);
        worker.start().unwrap();

        let response = worker.dispatch(Request::new("GET", "/")).unwrap();
        assert_eq!(response.body, b"app:1");
        worker.dispatch(Request::new("GET", "/")).unwrap();

        assert_eq!(worker.requests(), 2);
        assert_eq!(worker.snapshot().requests, 2);
    }

    #[test]
    fn test_recycle_after_budget() {
        let (mut worker, recorder) = worker(Recorder::default(), 2);
        let (events, mut rx) = broadcast::channel(16);
        worker = worker.with_events(events);
        worker.start().unwrap();
        while rx.try_recv().is_ok() {}

        worker.dispatch(Request::new("GET", "/")).unwrap();
        assert_eq!(worker.requests(), 1);

        let response = worker.dispatch(Request::new("GET", "/")).unwrap();
        assert_eq!(response.body, b"app:2");
        assert_eq!(worker.status(), WorkerStatus::Running);
        assert_eq!(worker.requests(), 0);
        assert_eq!(recorder.torn_down.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.initialized.load(Ordering::SeqCst), 2);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                PoolEvent::Recycled {
                    slot: 0,
                    generation: 0,
                    requests: 2
                },
                PoolEvent::Transition {
                    slot: 0,
                    generation: 0,
                    from: WorkerStatus::Running,
                    to: WorkerStatus::Reloading
                },
                PoolEvent::Transition {
                    slot: 0,
                    generation: 0,
                    from: WorkerStatus::Reloading,
                    to: WorkerStatus::Running
                },
            ]
        );
    }

    #[test]
    fn test_dispatch_error_crashes_worker() {
        let (mut worker, _) = worker(Recorder::default(), 10);
        worker.start().unwrap();

        let err = worker.dispatch(Request::new("GET", "/error")).unwrap_err();

        assert!(matches!(err, WorkerError::Crashed { ref reason, .. } if reason == "application error"));
        assert_eq!(worker.status(), WorkerStatus::Crashed);
        // The crashed request still counts.
        assert_eq!(worker.requests(), 1);
    }

    #[test]
    fn test_dispatch_panic_crashes_worker() {
        let (mut worker, _) = worker(Recorder::default(), 10);
        worker.start().unwrap();

        let err = worker.dispatch(Request::new("GET", "/panic")).unwrap_err();

        assert!(
            matches!(err, WorkerError::Crashed { ref reason, .. } if reason.contains("handler exploded"))
        );
        assert_eq!(worker.status(), WorkerStatus::Crashed);
    }

    #[test]
    fn test_reload_requires_running() {
        let (mut worker, _) = worker(Recorder::default(), 10);

        let err = worker.reload().unwrap_err();
        assert!(matches!(err, WorkerError::NotRunning { .. }));
    }

    #[test]
    fn test_reload_failure_ends_stopped() {
        let recorder = Recorder {
            fail_initialize_from: Some(1),
            ..Recorder::default()
        };
        let (mut worker, _) = worker(recorder, 10);
        worker.start().unwrap();

        let err = worker.reload().unwrap_err();

        assert!(matches!(err, WorkerError::Start { .. }));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[test]
    fn test_stop_from_crashed() {
        let (mut worker, recorder) = worker(Recorder::default(), 10);
        worker.start().unwrap();
        let _ = worker.dispatch(Request::new("GET", "/error"));

        let teardown_error = worker.stop().unwrap();

        assert!(teardown_error.is_none());
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert_eq!(recorder.torn_down.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_is_fail_open() {
        let recorder = Recorder {
            fail_teardown: true,
            ..Recorder::default()
        };
        let (mut worker, _) = worker(recorder, 10);
        worker.start().unwrap();

        let teardown_error = worker.stop().unwrap();

        assert_eq!(teardown_error.as_deref(), Some("teardown refused"));
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[test]
    fn test_stop_when_stopped_is_illegal() {
        let (mut worker, _) = worker(Recorder::default(), 10);

        let err = worker.stop().unwrap_err();
        assert!(matches!(err, WorkerError::IllegalTransition { .. }));
    }

    #[test]
    fn test_restart_after_stop_resets_counter() {
        let (mut worker, _) = worker(Recorder::default(), 10);
        worker.start().unwrap();
        worker.dispatch(Request::new("GET", "/")).unwrap();
        worker.stop().unwrap();

        worker.start().unwrap();

        assert_eq!(worker.requests(), 0);
        assert_eq!(worker.status(), WorkerStatus::Running);
    }
}
