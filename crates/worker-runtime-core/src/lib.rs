//! Worker pool runtime for worker-runtime.
//!
//! This crate provides the long-lived, multi-worker process model:
//! - [`EntryPoint`]: The only surface a worker uses to run application code
//! - [`Worker`]: Per-slot state machine with a self-recycling request budget
//! - [`WorkerPool`]: Fixed-size supervisor with crash restart and rolling reload
//! - [`BootstrapCache`]: Persistent memo of the assembled application
//! - [`PreloadManifest`]: Ahead-of-time compilation list for the host runtime
//! - [`Runtime`]: Facade composing all of the above
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Runtime                          │
//! │  - BootstrapCache (assembled application, on disk)      │
//! │  - PreloadManifest (file list, on disk)                 │
//! └─────────────────────────────────────────────────────────┘
//!                            │ start(workers, max_requests)
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      WorkerPool                         │
//! │  (Single writer of pool status and slot membership)     │
//! │  - Round-robin dispatch                                 │
//! │  - Crash restart, rolling reload, graceful stop         │
//! └─────────────────────────────────────────────────────────┘
//!                            │ one command queue per slot
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              Worker thread (worker-<slot>)              │
//! │  (Owns its status and request counter)                  │
//! │  - EntryPoint::initialize / dispatch / teardown         │
//! │  - Recycles itself after max_requests                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod bootstrap;
pub mod entry;
pub mod event;
mod fs;
pub mod handle;
pub mod pool;
pub mod preload;
pub mod runtime;
pub mod worker;

pub use bootstrap::{BootstrapCache, Fingerprint};
pub use entry::{Application, DispatchContext, EntryPoint, Request, Response};
pub use event::{PoolEvent, RestartReason};
pub use handle::{StopOutcome, WorkerHandle};
pub use pool::{StopReport, TeardownError, WorkerPool};
pub use preload::{ManifestGroup, ManifestSummary, PreloadManifest, read_manifest};
pub use runtime::{Assemble, Runtime};
pub use worker::{Worker, WorkerSnapshot};
