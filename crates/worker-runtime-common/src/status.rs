//! Worker and pool status types.
//!
//! [`WorkerStatus`] carries the worker lifecycle state machine. Every legal
//! move is listed in [`WorkerStatus::can_transition_to`]; anything else is
//! rejected by the worker before it mutates its state.
//!
//! ```text
//! Stopped   ─▶ Starting
//! Starting  ─▶ Running | Stopped | Stopping
//! Running   ─▶ Reloading | Stopping | Crashed
//! Reloading ─▶ Running | Stopping
//! Crashed   ─▶ Stopping
//! Stopping  ─▶ Stopped
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Not running; the initial and final state.
    Stopped,
    /// Running the entry point's initialization.
    Starting,
    /// Accepting dispatches.
    Running,
    /// Tearing down and re-initializing; dispatches are refused.
    Reloading,
    /// Tearing down before reaching `Stopped`.
    Stopping,
    /// A dispatch failed outside the worker's control.
    ///
    /// Terminal for this instance: the pool replaces it.
    Crashed,
}

impl WorkerStatus {
    /// Returns `true` if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::{Crashed, Reloading, Running, Starting, Stopped, Stopping};

        match (self, next) {
            (Stopped, Starting)
            | (Starting, Running | Stopped | Stopping)
            | (Running, Reloading | Stopping | Crashed)
            | (Reloading, Running | Stopping)
            | (Crashed, Stopping)
            | (Stopping, Stopped) => true,
            (Stopped | Running | Reloading | Crashed | Stopping, _)
            | (Starting, Starting | Reloading | Crashed) => false,
        }
    }

    /// Returns `true` if the worker accepts dispatches in this state.
    pub fn is_serving(self) -> bool {
        self == WorkerStatus::Running
    }

    /// Returns the lowercase name used in logs and API responses.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Reloading => "reloading",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Crashed => "crashed",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool-wide status.
///
/// While the pool is in its running phase the status is derived from the
/// workers: `Running` iff every slot holds a `Running` worker, `Degraded`
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// No workers exist.
    Stopped,
    /// Workers are being spawned.
    Starting,
    /// Every worker is `Running`.
    Running,
    /// The pool is running but at least one slot is not serving.
    Degraded,
    /// A rolling reload is in progress.
    Reloading,
    /// Workers are being stopped.
    Stopping,
}

impl PoolStatus {
    /// Returns the lowercase name used in logs and API responses.
    pub fn as_str(self) -> &'static str {
        match self {
            PoolStatus::Stopped => "stopped",
            PoolStatus::Starting => "starting",
            PoolStatus::Running => "running",
            PoolStatus::Degraded => "degraded",
            PoolStatus::Reloading => "reloading",
            PoolStatus::Stopping => "stopping",
        }
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [WorkerStatus; 6] = [
        WorkerStatus::Stopped,
        WorkerStatus::Starting,
        WorkerStatus::Running,
        WorkerStatus::Reloading,
        WorkerStatus::Stopping,
        WorkerStatus::Crashed,
    ];

    #[test]
    fn test_happy_path_transitions() {
        assert!(WorkerStatus::Stopped.can_transition_to(WorkerStatus::Starting));
        assert!(WorkerStatus::Starting.can_transition_to(WorkerStatus::Running));
        assert!(WorkerStatus::Running.can_transition_to(WorkerStatus::Reloading));
        assert!(WorkerStatus::Reloading.can_transition_to(WorkerStatus::Running));
        assert!(WorkerStatus::Running.can_transition_to(WorkerStatus::Stopping));
        assert!(WorkerStatus::Stopping.can_transition_to(WorkerStatus::Stopped));
    }

    #[test]
    fn test_crashed_only_from_running() {
        for from in ALL {
            let allowed = from.can_transition_to(WorkerStatus::Crashed);
            assert_eq!(allowed, from == WorkerStatus::Running, "from {from}");
        }
    }

    #[test]
    fn test_crashed_can_only_be_stopped() {
        for to in ALL {
            let allowed = WorkerStatus::Crashed.can_transition_to(to);
            assert_eq!(allowed, to == WorkerStatus::Stopping, "to {to}");
        }
    }

    #[test]
    fn test_no_self_transitions() {
        for status in ALL {
            assert!(!status.can_transition_to(status), "{status}");
        }
    }

    #[test]
    fn test_stopped_only_starts() {
        for to in ALL {
            let allowed = WorkerStatus::Stopped.can_transition_to(to);
            assert_eq!(allowed, to == WorkerStatus::Starting, "to {to}");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(WorkerStatus::Reloading.to_string(), "reloading");
        assert_eq!(PoolStatus::Degraded.to_string(), "degraded");
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&WorkerStatus::Crashed).unwrap();
        assert_eq!(json, "\"crashed\"");
        let status: PoolStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(status, PoolStatus::Running);
    }
}
