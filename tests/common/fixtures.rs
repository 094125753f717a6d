use std::sync::Arc;
use std::time::Duration;

use appendsafe::storage::file::memory_backend::{BackendCall, MemoryBackend, ProbeEvent};
use appendsafe::{AppendChallengedFile, FileSchedulerConfig, OpenFlags};

use super::logger::init_test_logger;

pub struct MemoryFile {
    pub backend: Arc<MemoryBackend>,
    pub file: AppendChallengedFile,
}

impl MemoryFile {
    pub async fn new(contents: Vec<u8>, config: FileSchedulerConfig) -> Self {
        init_test_logger();
        let backend = Arc::new(MemoryBackend::with_contents(contents));
        let file = AppendChallengedFile::with_backend(backend.clone(), OpenFlags::read_write(), config)
            .await
            .expect("memory backend always opens");
        Self { backend, file }
    }
}

/// Waits (bounded) until `condition` holds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn is_size_changing(call: &appendsafe::storage::file::memory_backend::ActiveCall) -> bool {
    call.extends || call.call == BackendCall::Truncate
}

/// No call ever overlapped a call of one of the `exclusive` kinds.
pub fn assert_exclusive_calls_ran_alone(events: &[ProbeEvent], exclusive: &[BackendCall]) {
    for event in events {
        if exclusive.contains(&event.started.call) {
            assert!(
                event.concurrent.is_empty(),
                "{:?} started while {:?} were running",
                event.started,
                event.concurrent
            );
        }
        for other in &event.concurrent {
            assert!(
                !exclusive.contains(&other.call),
                "{:?} started while exclusive {:?} was running",
                event.started,
                other
            );
        }
    }
}

/// Size-changing calls in flight at any start never exceeded `max`.
pub fn assert_size_changing_limit(events: &[ProbeEvent], max: usize) {
    for event in events {
        let running = event.concurrent.iter().filter(|c| is_size_changing(c)).count();
        let total = running + usize::from(is_size_changing(&event.started));
        assert!(
            total <= max,
            "{} size-changing calls in flight at {:?} (limit {})",
            total,
            event.started,
            max
        );
    }
}

pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}
