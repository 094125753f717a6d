use std::sync::Arc;

use appendsafe::FileSchedulerConfig;
use appendsafe::storage::file::lifecycle::LifecycleState;
use appendsafe::storage::file::memory_backend::BackendCall;

use crate::common::fixtures::{
    MemoryFile, assert_exclusive_calls_ran_alone, assert_size_changing_limit, eventually, pattern,
};
use crate::{assert_ok, assert_os_error};

#[tokio::test]
async fn read_runs_beside_append_and_flush_waits_for_both() {
    let MemoryFile { backend, file } = MemoryFile::new(vec![0u8; 8192], FileSchedulerConfig::default()).await;
    backend.hold(BackendCall::Write);

    let w1 = file.write(8192, vec![1u8; 4096]);
    let r1 = file.read(0, vec![0u8; 4096]);
    let f1 = file.flush();

    backend.wait_for_started(BackendCall::Write, 1).await;
    // The read finishes while the append is still held in the kernel.
    let (n, _) = assert_ok!(r1.await);
    assert_eq!(n, 4096);

    let snapshot = assert_ok!(file.snapshot().await);
    assert_eq!(snapshot.in_flight.size_changing, 1);
    assert_eq!(snapshot.queued, 1);
    assert_eq!(backend.started(BackendCall::Sync), 0);

    backend.open(BackendCall::Write);
    assert_eq!(assert_ok!(w1.await), 4096);
    assert_ok!(f1.await);

    let events = backend.events();
    let sync = events
        .iter()
        .find(|e| e.started.call == BackendCall::Sync)
        .expect("flush reached the backend");
    assert!(sync.concurrent.is_empty());
    assert_eq!(file.size(), 12288);
}

#[tokio::test]
async fn independent_reads_all_run_at_once() {
    const READS: usize = 8;
    let MemoryFile { backend, file } = MemoryFile::new(pattern(0, 65536), FileSchedulerConfig::default()).await;
    backend.hold(BackendCall::Read);

    let handles: Vec<_> = (0..READS)
        .map(|i| file.read((i * 4096) as u64, vec![0u8; 4096]))
        .collect();
    backend.wait_for_started(BackendCall::Read, READS).await;

    let snapshot = assert_ok!(file.snapshot().await);
    assert_eq!(snapshot.in_flight.non_size_changing as usize, READS);
    assert_eq!(snapshot.queued, 0);

    backend.open(BackendCall::Read);
    let expected = pattern(0, 65536);
    for (i, handle) in handles.into_iter().enumerate() {
        let (n, buf) = assert_ok!(handle.await);
        assert_eq!(n, 4096);
        assert_eq!(&buf[..], &expected[i * 4096..(i + 1) * 4096]);
    }
    assert_eq!(file.metrics().peak_non_size_changing as usize, READS);
}

#[tokio::test]
async fn sloppy_truncates_report_exact_sizes() {
    let config = FileSchedulerConfig::default().with_sloppy_size(4096);
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), config).await;

    assert_ok!(file.truncate(100).await);
    assert_eq!(file.size(), 100);
    assert_ok!(file.truncate(50).await);
    assert_eq!(file.size(), 50);

    // The second truncate never reached the kernel.
    assert_eq!(backend.started(BackendCall::Truncate), 1);
    assert_eq!(backend.len(), 4096);
    assert_eq!(file.metrics().elided_truncates, 1);

    assert_ok!(file.close().await);
    assert_eq!(backend.len(), 50);
}

#[tokio::test]
async fn back_to_back_sloppy_truncates_reach_the_kernel_once() {
    let config = FileSchedulerConfig::default().with_sloppy_size(4096);
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), config).await;

    let grow = file.truncate(100);
    let shrink = file.truncate(50);
    assert_ok!(grow.await);
    assert_ok!(shrink.await);

    assert_eq!(file.size(), 50);
    assert_eq!(backend.started(BackendCall::Truncate), 1);
    assert_eq!(backend.len(), 4096);
    assert_eq!(file.metrics().elided_truncates, 1);
}

#[tokio::test]
async fn write_queued_behind_truncate_keeps_its_size() {
    let MemoryFile { backend, file } = MemoryFile::new(vec![1u8; 4096], FileSchedulerConfig::default()).await;
    backend.hold(BackendCall::Read);
    backend.hold(BackendCall::Write);

    let read = file.read(0, vec![0u8; 10]);
    backend.wait_for_started(BackendCall::Read, 1).await;
    let shrink = file.truncate(0);
    let append = file.write(0, pattern(3, 100));
    assert_eq!(assert_ok!(file.snapshot().await).queued, 2);

    backend.open(BackendCall::Read);
    assert_ok!(read.await);
    assert_ok!(shrink.await);
    // Truncated, but the queued write is still counted.
    assert_eq!(file.size(), 100);
    assert_eq!(file.committed_size(), 0);

    backend.wait_for_started(BackendCall::Write, 1).await;
    assert_eq!(file.size(), 100);
    backend.open(BackendCall::Write);
    assert_eq!(assert_ok!(append.await), 100);
    assert_eq!(file.committed_size(), 100);
    assert_eq!(backend.contents(), pattern(3, 100));
}

#[tokio::test]
async fn write_past_largest_offset_leaves_the_file_usable() {
    let config = FileSchedulerConfig::default().with_sloppy_size(4096);
    let MemoryFile { backend: _backend, file } = MemoryFile::new(Vec::new(), config).await;

    assert_os_error!(file.write(u64::MAX - 5, vec![0u8; 10]).await, libc::EINVAL);
    assert_os_error!(file.truncate(u64::MAX).await, libc::EINVAL);
    assert_eq!(file.size(), 0);

    assert_eq!(assert_ok!(file.write(0, vec![5u8; 10]).await), 10);
    assert_ok!(file.close().await);
}

#[tokio::test]
async fn size_counts_a_write_once_the_scheduler_has_seen_it() {
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), FileSchedulerConfig::default()).await;
    backend.hold(BackendCall::Write);

    let append = file.write(0, vec![2u8; 100]);
    // An awaited snapshot orders this read after the submission.
    assert_ok!(file.snapshot().await);
    assert_eq!(file.size(), 100);
    assert_eq!(file.committed_size(), 0);

    backend.open(BackendCall::Write);
    assert_ok!(append.await);
    assert_eq!(file.committed_size(), 100);
}

#[tokio::test]
async fn truncate_below_written_data_discards_it() {
    let config = FileSchedulerConfig::default().with_sloppy_size(4096);
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), config).await;

    assert_ok!(file.write(0, vec![9u8; 3000]).await);
    assert_ok!(file.truncate(1000).await);
    assert_ok!(file.truncate(2000).await);
    assert_eq!(file.size(), 2000);

    let (n, buf) = assert_ok!(file.read(0, vec![0u8; 2000]).await);
    assert_eq!(n, 2000);
    assert!(buf[..1000].iter().all(|&b| b == 9));
    assert!(buf[1000..].iter().all(|&b| b == 0));
    assert_eq!(backend.contents()[1000..2000], vec![0u8; 1000][..]);
}

#[tokio::test]
async fn close_drains_in_flight_reads() {
    let MemoryFile { backend, file } = MemoryFile::new(vec![0u8; 4096], FileSchedulerConfig::default()).await;
    backend.hold(BackendCall::Read);
    backend.hold(BackendCall::Close);

    let reads: Vec<_> = (0..3).map(|i| file.read(i * 100, vec![0u8; 100])).collect();
    backend.wait_for_started(BackendCall::Read, 3).await;

    let close = file.close();
    assert_ok!(file.wait_for_state(LifecycleState::Draining).await);
    assert_eq!(file.state(), LifecycleState::Draining);
    let snapshot = assert_ok!(file.snapshot().await);
    assert_eq!(snapshot.in_flight.non_size_changing, 3);

    backend.open(BackendCall::Read);
    for read in reads {
        assert_ok!(read.await);
    }
    backend.wait_for_started(BackendCall::Close, 1).await;
    assert_eq!(file.state(), LifecycleState::Closing);

    backend.open(BackendCall::Close);
    assert_ok!(close.await);
    assert_eq!(file.state(), LifecycleState::Closed);
    let snapshot = assert_ok!(file.snapshot().await);
    assert!(snapshot.in_flight.is_idle());
    assert_eq!(snapshot.queued, 0);
    assert!(backend.is_closed());
}

#[tokio::test]
async fn concurrent_appends_respect_size_changing_limit() {
    const WRITERS: usize = 16;
    let config = FileSchedulerConfig::default()
        .with_max_size_changing_ops(2)
        .with_flush_exclusive(false);
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), config).await;
    let file = Arc::new(file);

    let mut tasks = Vec::new();
    for i in 0..WRITERS {
        let file = Arc::clone(&file);
        tasks.push(tokio::spawn(async move {
            file.write((i * 4096) as u64, pattern(i as u8, 4096)).await
        }));
    }
    for task in tasks {
        assert_eq!(assert_ok!(task.await.unwrap()), 4096);
    }

    assert_eq!(file.size(), (WRITERS * 4096) as u64);
    assert_eq!(file.committed_size(), (WRITERS * 4096) as u64);
    assert!(file.metrics().peak_size_changing <= 2);
    assert_size_changing_limit(&backend.events(), 2);

    let contents = backend.contents();
    for i in 0..WRITERS {
        assert_eq!(&contents[i * 4096..(i + 1) * 4096], &pattern(i as u8, 4096)[..]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_operations_run_alone_under_mixed_load() {
    let config = FileSchedulerConfig::default();
    let MemoryFile { backend, file } = MemoryFile::new(vec![0u8; 16384], config).await;
    let file = Arc::new(file);

    let mut tasks = Vec::new();
    for i in 0..24u64 {
        let file = Arc::clone(&file);
        tasks.push(tokio::spawn(async move {
            match i % 4 {
                0 => file.write(16384 + i * 512, vec![i as u8; 512]).await.map(|_| ()),
                1 => file.read(i * 100, vec![0u8; 100]).await.map(|_| ()),
                2 => file.flush().await,
                _ => file.stat().await.map(|_| ()),
            }
        }));
    }
    for task in tasks {
        assert_ok!(task.await.unwrap());
    }
    assert_ok!(file.truncate(20000).await);

    let events = backend.events();
    assert_exclusive_calls_ran_alone(&events, &[BackendCall::Sync, BackendCall::Truncate]);
    assert_size_changing_limit(&events, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn logical_size_never_trails_committed_size() {
    let MemoryFile { backend: _backend, file } = MemoryFile::new(Vec::new(), FileSchedulerConfig::default()).await;
    let file = Arc::new(file);

    let writer = {
        let file = Arc::clone(&file);
        tokio::spawn(async move {
            // Completions may land in any order; committed must still only grow.
            let handles: Vec<_> = (0..64u64).rev().map(|i| file.write(i * 1000, vec![1u8; 1000])).collect();
            for handle in handles {
                handle.await.unwrap();
            }
        })
    };

    let mut last_committed = 0;
    while !writer.is_finished() {
        let snapshot = assert_ok!(file.snapshot().await);
        assert!(snapshot.sizes.logical >= snapshot.sizes.committed);
        assert!(snapshot.sizes.committed >= last_committed);
        last_committed = snapshot.sizes.committed;
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
    assert_eq!(file.committed_size(), 64_000);
    assert_eq!(file.size(), 64_000);
}

#[tokio::test]
async fn failing_write_does_not_affect_siblings() {
    let config = FileSchedulerConfig::default().with_flush_exclusive(false);
    let MemoryFile { backend, file } = MemoryFile::new(vec![0u8; 8192], config).await;
    backend.fail_next(BackendCall::Write, libc::EIO);

    let first = file.write(0, vec![1u8; 4096]);
    let second = file.write(4096, vec![2u8; 4096]);
    let results = [first.await, second.await];

    let failed = results.iter().filter(|r| r.is_err()).count();
    assert_eq!(failed, 1);
    for result in results {
        if result.is_err() {
            assert_os_error!(result, libc::EIO);
        }
    }

    assert_ok!(file.read(0, vec![0u8; 16]).await);
    assert_ok!(file.flush().await);
    let metrics = file.metrics();
    assert_eq!(metrics.failed, 1);
    assert_ok!(file.close().await);
}

#[tokio::test]
async fn submissions_after_close_are_rejected() {
    let MemoryFile { backend: _backend, file } = MemoryFile::new(Vec::new(), FileSchedulerConfig::default()).await;
    assert_ok!(file.close().await);

    assert!(file.write(0, vec![1]).await.unwrap_err().is_closed());
    assert!(file.read(0, vec![0; 1]).await.unwrap_err().is_closed());
    assert!(file.flush().await.unwrap_err().is_closed());
    assert_eq!(file.metrics().rejected, 3);
}

#[tokio::test]
async fn close_is_idempotent() {
    let MemoryFile { backend, file } = MemoryFile::new(vec![0u8; 100], FileSchedulerConfig::default()).await;
    backend.hold(BackendCall::Close);

    let first = file.close();
    let second = file.close();
    backend.wait_for_started(BackendCall::Close, 1).await;
    backend.open(BackendCall::Close);

    assert_ok!(first.await);
    assert_ok!(second.await);
    assert_ok!(file.close().await);
    assert_eq!(backend.started(BackendCall::Close), 1);
}

#[tokio::test]
async fn dropping_the_file_closes_it_after_outstanding_work() {
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), FileSchedulerConfig::default()).await;
    backend.hold(BackendCall::Write);

    let write = file.write(0, vec![5u8; 10]);
    backend.wait_for_started(BackendCall::Write, 1).await;
    drop(file);

    backend.open(BackendCall::Write);
    assert_eq!(assert_ok!(write.await), 10);
    eventually(|| backend.is_closed()).await;
    assert_eq!(backend.contents(), vec![5u8; 10]);
}

#[tokio::test]
async fn sloppy_append_extends_then_flush_restores_logical_size() {
    let config = FileSchedulerConfig::default().with_sloppy_size(1 << 20);
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), config).await;

    assert_ok!(file.write(0, vec![7u8; 4096]).await);
    assert_eq!(file.size(), 4096);
    assert_eq!(backend.len(), 1 << 20);
    assert_eq!(file.metrics().speculative_extensions, 1);

    assert_ok!(file.flush().await);
    assert_eq!(backend.len(), 4096);
    let stat = assert_ok!(file.stat().await);
    assert_eq!(stat.size, 4096);
    assert_eq!(stat.physical_size, 4096);
}

#[tokio::test]
async fn reads_are_clamped_at_logical_size() {
    let MemoryFile { backend, file } = MemoryFile::new(pattern(3, 5000), FileSchedulerConfig::default()).await;

    let (n, buf) = assert_ok!(file.read(5000, vec![0xEE; 64]).await);
    assert_eq!(n, 0);
    assert_eq!(buf, vec![0xEE; 64]);
    assert_eq!(backend.started(BackendCall::Read), 0);

    let (n, _) = assert_ok!(file.read(4950, vec![0u8; 4096]).await);
    assert_eq!(n, 50);

    let bulk = assert_ok!(file.read_bulk(4000, 4096).await);
    assert_eq!(bulk, pattern(3, 5000)[4000..].to_vec());

    let (n, bufs) = assert_ok!(file.read_vectored(4990, vec![vec![0u8; 6], vec![0u8; 6]]).await);
    assert_eq!(n, 10);
    assert_eq!(bufs[0], pattern(3, 5000)[4990..4996].to_vec());
}

#[tokio::test]
async fn vectored_write_lands_back_to_back() {
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), FileSchedulerConfig::default()).await;
    let written = assert_ok!(file.write_vectored(10, vec![vec![1u8; 3], vec![2u8; 2]]).await);
    assert_eq!(written, 5);
    assert_eq!(file.size(), 15);
    assert_eq!(backend.contents()[10..], [1, 1, 1, 2, 2]);
}
