//! # Scheduler Metrics
//!
//! `SchedulerMetrics` counts what the admission scheduler of one file has
//! done: operations submitted, completed, failed and rejected, truncates that
//! were elided in sloppy mode, speculative extensions, and the highest
//! in-flight counts ever observed for each admission class.
//!
//! All counters are atomics, updated by the scheduler task and readable from
//! any thread without suspending. The peaks are what tests use to confirm the
//! admission limits held under load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::storage::file::admission::InFlight;

#[derive(Debug)]
pub struct SchedulerMetrics {
    // Operation counters
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,

    // Size management
    elided_truncates: AtomicU64,
    speculative_extensions: AtomicU64,

    // Bytes moved
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,

    // Highest in-flight counts seen at dispatch
    peak_size_changing: AtomicU64,
    peak_non_size_changing: AtomicU64,
    peak_in_flight: AtomicU64,

    // Queueing delay, submission to dispatch
    total_wait_micros: AtomicU64,
    max_wait_micros: AtomicU64,
    dispatched: AtomicU64,

    start_time: Instant,
}

/// Plain copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub elided_truncates: u64,
    pub speculative_extensions: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub peak_size_changing: u64,
    pub peak_non_size_changing: u64,
    pub peak_in_flight: u64,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn raise(counter: &AtomicU64, value: u64) {
    counter.fetch_max(value, Ordering::Relaxed);
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            elided_truncates: AtomicU64::new(0),
            speculative_extensions: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            peak_size_changing: AtomicU64::new(0),
            peak_non_size_changing: AtomicU64::new(0),
            peak_in_flight: AtomicU64::new(0),
            total_wait_micros: AtomicU64::new(0),
            max_wait_micros: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records an operation accepted into the pending queue
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an operation refused because the file was not open
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dispatch, with the in-flight counters after admission and
    /// the time the operation spent queued.
    pub fn record_dispatch(&self, in_flight: &InFlight, waited: Duration) {
        raise(&self.peak_size_changing, u64::from(in_flight.size_changing));
        raise(&self.peak_non_size_changing, u64::from(in_flight.non_size_changing));
        raise(&self.peak_in_flight, u64::from(in_flight.total()));

        let micros = waited.as_micros() as u64;
        self.total_wait_micros.fetch_add(micros, Ordering::Relaxed);
        raise(&self.max_wait_micros, micros);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_elided_truncate(&self) {
        self.elided_truncates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_speculative_extension(&self) {
        self.speculative_extensions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn peak_size_changing(&self) -> u64 {
        self.peak_size_changing.load(Ordering::Relaxed)
    }

    /// Gets the average time an operation waited for admission
    pub fn average_wait(&self) -> Duration {
        let dispatched = self.dispatched.load(Ordering::Relaxed);
        if dispatched == 0 {
            return Duration::from_micros(0);
        }
        Duration::from_micros(self.total_wait_micros.load(Ordering::Relaxed) / dispatched)
    }

    /// Gets the longest time an operation waited for admission
    pub fn max_wait(&self) -> Duration {
        Duration::from_micros(self.max_wait_micros.load(Ordering::Relaxed))
    }

    /// Gets the completed operations per second since creation
    pub fn operations_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.completed.load(Ordering::Relaxed) as f64 / elapsed
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            elided_truncates: self.elided_truncates.load(Ordering::Relaxed),
            speculative_extensions: self.speculative_extensions.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            peak_size_changing: self.peak_size_changing.load(Ordering::Relaxed),
            peak_non_size_changing: self.peak_non_size_changing.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}
