//! Lifecycle events published by workers and the pool.

use serde::Serialize;

use worker_runtime_common::WorkerStatus;

/// Why a slot received a fresh worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// The previous worker crashed during a dispatch.
    Crashed,
    /// The previous worker did not come back from a reload.
    ReloadFailed,
    /// The previous worker's thread exited unexpectedly.
    ThreadExited,
    /// The slot had no worker.
    Vacant,
}

/// Something that happened to a worker slot.
///
/// Events are broadcast in the order they are emitted; subscribers that
/// fall behind lose the oldest events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// A worker moved between states.
    Transition {
        slot: usize,
        generation: u64,
        from: WorkerStatus,
        to: WorkerStatus,
    },
    /// A worker exhausted its request budget and is recycling itself.
    Recycled {
        slot: usize,
        generation: u64,
        requests: u64,
    },
    /// A slot received a fresh worker.
    Restarted {
        slot: usize,
        generation: u64,
        reason: RestartReason,
    },
    /// Replacing a worker failed; the slot is vacant.
    RestartFailed { slot: usize, reason: String },
    /// A worker did not stop within the grace period and was abandoned.
    Abandoned { slot: usize, generation: u64 },
}

impl PoolEvent {
    /// Slot the event refers to.
    pub fn slot(&self) -> usize {
        match self {
            Self::Transition { slot, .. }
            | Self::Recycled { slot, .. }
            | Self::Restarted { slot, .. }
            | Self::RestartFailed { slot, .. }
            | Self::Abandoned { slot, .. } => *slot,
        }
    }
}
