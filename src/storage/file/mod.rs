//! # Append-Challenged File I/O
//!
//! Admission-controlled asynchronous I/O for a single file on a filesystem
//! that serializes size-changing operations internally.
//!
//! ## Modules
//!
//! - **`append_challenged`**: The `AppendChallengedFile` entry point.
//! - **`scheduler`**: Task owning the queue, counters, sizes and lifecycle.
//! - **`admission`**: Classification of operations and the dispatch rule.
//! - **`size_state`**: Logical / committed / allocated size bookkeeping.
//! - **`lifecycle`**: Open, draining, closing and closed states.
//! - **`queue`**: Pending operations in submission order.
//! - **`executor`**: Runs admitted tasks against a backend.
//! - **`backend`**: Syscall seam and its POSIX implementation.
//! - **`memory_backend`**: In-memory backend with call probes, for tests and benchmarks.
//! - **`metrics`**: Counters and admission peaks.
//! - **`operations`**: Requests, tasks, outputs and completion handles.

mod append_challenged;
mod scheduler;

pub mod admission;
pub mod backend;
pub mod executor;
pub mod lifecycle;
pub mod memory_backend;
pub mod metrics;
pub mod operations;
pub mod queue;
pub mod size_state;

pub use append_challenged::*;
pub use scheduler::SchedulerSnapshot;
