//! Thread-backed worker handles.
//!
//! Each worker runs on its own OS thread and consumes a bounded command
//! queue. The async side talks to it through a [`WorkerHandle`]; every
//! command carries a oneshot reply channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use worker_runtime_common::{WorkerError, WorkerStatus};

use crate::entry::{EntryPoint, Request, Response};
use crate::worker::{Worker, WorkerSnapshot};

type Reply<T> = oneshot::Sender<Result<T, WorkerError>>;

enum Command {
    Dispatch { request: Request, reply: Reply<Response> },
    Reload { reply: Reply<()> },
    Stop { reply: Reply<Option<String>> },
}

/// How a worker stop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker reached `Stopped` within the grace period.
    Completed {
        /// Message of a failed teardown, if any.
        teardown_error: Option<String>,
    },
    /// The grace period elapsed; in-flight dispatches were aborted.
    Abandoned,
}

/// Async handle to a worker running on its own thread.
pub struct WorkerHandle {
    slot: usize,
    generation: u64,
    commands: mpsc::Sender<Command>,
    snapshot: Arc<RwLock<WorkerSnapshot>>,
    inflight: AtomicU64,
    aborted: Arc<AtomicBool>,
    abort: watch::Sender<bool>,
    thread: JoinHandle<()>,
}

/// Counts a dispatch as in flight until dropped.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    /// Returns the guard and the number of dispatches in flight, this one
    /// included.
    fn enter(counter: &'a AtomicU64) -> (Self, u64) {
        let pending = counter.fetch_add(1, Ordering::AcqRel) + 1;
        (Self(counter), pending)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerHandle {
    /// Spawn a thread for `worker` and start it there.
    ///
    /// Resolves once the worker is `Running`, or with the start error.
    pub(crate) async fn spawn<E: EntryPoint>(
        mut worker: Worker<E>,
        queue: usize,
    ) -> Result<Self, WorkerError> {
        let slot = worker.slot();
        let generation = worker.generation();
        let snapshot = worker.snapshot_handle();
        let aborted = worker.abort_flag();

        let (commands, receiver) = mpsc::channel(queue.max(1));
        let (started_tx, started_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name(format!("worker-{slot}"))
            .spawn(move || {
                let started = worker.start();
                let running = started.is_ok();
                let _ = started_tx.send(started);
                if running {
                    run(worker, receiver);
                }
            })
            .map_err(|e| WorkerError::Start {
                slot,
                reason: format!("failed to spawn worker thread: {e}"),
            })?;

        match started_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(WorkerError::Start {
                    slot,
                    reason: "worker thread exited during start".to_string(),
                });
            }
        }

        let (abort, _) = watch::channel(false);

        Ok(Self {
            slot,
            generation,
            commands,
            snapshot,
            inflight: AtomicU64::new(0),
            aborted,
            abort,
            thread,
        })
    }

    /// Slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Generation of the worker behind this handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> WorkerSnapshot {
        *self.snapshot.read()
    }

    /// Latest published status.
    pub fn status(&self) -> WorkerStatus {
        self.snapshot.read().status
    }

    /// Returns `true` while the worker thread is running.
    pub fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Dispatch one request on the worker thread.
    ///
    /// Fails fast with [`WorkerError::Busy`] while the worker reloads and
    /// with [`WorkerError::Aborted`] if the worker is abandoned during
    /// shutdown before it replies.
    pub async fn dispatch(&self, request: Request) -> Result<Response, WorkerError> {
        let (_inflight, _) = InFlight::enter(&self.inflight);
        self.send(request).await
    }

    /// Dispatch only if the request cannot use up the worker's budget.
    ///
    /// Dispatches already in flight count against the budget. When this
    /// request could be the one that triggers a recycle, nothing is sent
    /// and the request is handed back.
    pub async fn dispatch_within_budget(
        &self,
        request: Request,
    ) -> Result<Result<Response, WorkerError>, Request> {
        let (_inflight, pending) = InFlight::enter(&self.inflight);
        let snapshot = self.snapshot();
        if snapshot.requests.saturating_add(pending) >= snapshot.max_requests {
            return Err(request);
        }
        Ok(self.send(request).await)
    }

    async fn send(&self, request: Request) -> Result<Response, WorkerError> {
        match self.status() {
            WorkerStatus::Running => {}
            WorkerStatus::Reloading => return Err(WorkerError::Busy { slot: self.slot }),
            status => {
                return Err(WorkerError::NotRunning {
                    slot: self.slot,
                    status,
                });
            }
        }

        let mut abort = self.abort.subscribe();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dispatch { request, reply })
            .await
            .map_err(|_| WorkerError::Unavailable { slot: self.slot })?;

        tokio::select! {
            result = rx => result.unwrap_or_else(|_| Err(WorkerError::Unavailable { slot: self.slot })),
            () = aborted(&mut abort) => Err(WorkerError::Aborted { slot: self.slot }),
        }
    }

    /// Reload the worker and wait for it to come back.
    pub async fn reload(&self) -> Result<(), WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Reload { reply })
            .await
            .map_err(|_| WorkerError::Unavailable { slot: self.slot })?;

        rx.await
            .unwrap_or_else(|_| Err(WorkerError::Unavailable { slot: self.slot }))
    }

    /// Stop the worker, waiting at most `grace` for queued and in-flight
    /// dispatches.
    ///
    /// Past the grace period the worker is flagged aborted, waiting callers
    /// receive [`WorkerError::Aborted`], and the thread is left to finish
    /// on its own.
    pub async fn stop(&self, grace: Duration) -> StopOutcome {
        let (reply, rx) = oneshot::channel();
        let stop = async {
            self.commands
                .send(Command::Stop { reply })
                .await
                .map_err(|_| ())?;
            rx.await.map_err(|_| ())
        };

        match tokio::time::timeout(grace, stop).await {
            Ok(Ok(Ok(teardown_error))) => StopOutcome::Completed { teardown_error },
            Ok(Ok(Err(err))) => StopOutcome::Completed {
                teardown_error: Some(err.to_string()),
            },
            // The thread is already gone.
            Ok(Err(())) => StopOutcome::Completed {
                teardown_error: None,
            },
            Err(_) => {
                warn!(
                    slot = self.slot,
                    generation = self.generation,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "Worker did not stop within the grace period, aborting"
                );
                self.aborted.store(true, Ordering::Release);
                self.abort.send_replace(true);
                StopOutcome::Abandoned
            }
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// Resolves once the abort flag is raised. Never resolves if the handle
/// is gone.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Worker thread main loop.
fn run<E: EntryPoint>(mut worker: Worker<E>, mut commands: mpsc::Receiver<Command>) {
    let slot = worker.slot();
    let aborted = worker.abort_flag();

    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Dispatch { request, reply } => {
                if aborted.load(Ordering::Acquire) {
                    let _ = reply.send(Err(WorkerError::Aborted { slot }));
                    continue;
                }

                // Reply before recycling so the response is never held up.
                let _ = reply.send(worker.serve(request));

                if let Err(err) = worker.recycle_if_exhausted() {
                    warn!(slot, error = %err, "Worker recycle failed");
                }
            }
            Command::Reload { reply } => {
                let _ = reply.send(worker.reload());
            }
            Command::Stop { reply } => {
                let result = if worker.status() == WorkerStatus::Stopped {
                    Ok(None)
                } else {
                    worker.stop()
                };

                commands.close();
                while let Ok(pending) = commands.try_recv() {
                    reject(pending, slot);
                }

                let _ = reply.send(result);
                debug!(slot, "Worker thread exiting");
                return;
            }
        }
    }

    // Every handle is gone.
    if worker.status() != WorkerStatus::Stopped {
        let _ = worker.stop();
    }
}

fn reject(command: Command, slot: usize) {
    let stopped = || WorkerError::NotRunning {
        slot,
        status: WorkerStatus::Stopped,
    };

    match command {
        Command::Dispatch { reply, .. } => {
            let _ = reply.send(Err(stopped()));
        }
        Command::Reload { reply } => {
            let _ = reply.send(Err(stopped()));
        }
        Command::Stop { reply } => {
            let _ = reply.send(Ok(None));
        }
    }
}
