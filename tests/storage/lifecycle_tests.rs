use std::sync::Arc;

use appendsafe::storage::file::backend::FileBackend;
use appendsafe::storage::file::lifecycle::LifecycleState;
use appendsafe::storage::file::memory_backend::{BackendCall, MemoryBackend};
use appendsafe::{AppendChallengedFile, FileSchedulerConfig, OpenFlags};

use crate::assert_ok;
use crate::common::fixtures::MemoryFile;
use crate::common::logger::init_test_logger;

#[tokio::test]
async fn close_proceeds_after_failed_operations() {
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), FileSchedulerConfig::default()).await;
    backend.fail_next(BackendCall::Write, libc::ENOSPC);

    assert!(file.write(0, vec![1u8; 10]).await.is_err());
    backend.fail_next(BackendCall::Sync, libc::EIO);
    assert!(file.flush().await.is_err());

    assert_ok!(file.close().await);
    assert_eq!(file.state(), LifecycleState::Closed);
    assert_eq!(file.metrics().failed, 2);
}

#[tokio::test]
async fn close_reports_release_failure_to_every_waiter() {
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), FileSchedulerConfig::default()).await;
    backend.hold(BackendCall::Close);
    backend.fail_next(BackendCall::Close, libc::EIO);

    let first = file.close();
    let second = file.close();
    backend.wait_for_started(BackendCall::Close, 1).await;
    backend.open(BackendCall::Close);

    for waiter in [first, second] {
        let err = waiter.await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }
    assert_eq!(file.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn close_trims_speculative_extension() {
    let config = FileSchedulerConfig::default().with_sloppy_size(1 << 16);
    let MemoryFile { backend, file } = MemoryFile::new(Vec::new(), config).await;

    assert_ok!(file.write(0, vec![1u8; 1000]).await);
    assert_eq!(backend.len(), 1 << 16);

    assert_ok!(file.close().await);
    assert_eq!(backend.len(), 1000);
    assert!(backend.is_closed());
}

#[tokio::test]
async fn wait_for_state_accepts_later_states() {
    let MemoryFile { backend: _backend, file } = MemoryFile::new(Vec::new(), FileSchedulerConfig::default()).await;
    assert_eq!(file.state(), LifecycleState::Open);
    assert_ok!(file.close().await);
    assert_ok!(file.wait_for_state(LifecycleState::Draining).await);
    assert_ok!(file.wait_for_state(LifecycleState::Closed).await);
}

#[tokio::test]
async fn initial_size_comes_from_the_backend() {
    init_test_logger();
    let backend = Arc::new(MemoryBackend::with_contents(vec![0u8; 12345]));
    let device = assert_ok!(backend.stat().await).device_id;

    let file = assert_ok!(
        AppendChallengedFile::with_backend(backend.clone(), OpenFlags::read_only(), FileSchedulerConfig::default()).await
    );
    assert_eq!(file.size(), 12345);
    assert_eq!(file.committed_size(), 12345);
    assert_eq!(file.device_id(), device);
    assert_eq!(file.flags(), OpenFlags::read_only());
}
