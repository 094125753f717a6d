use std::sync::Arc;

use tempfile::TempDir;

use appendsafe::{AppendChallengedFile, FileSchedulerConfig, OpenFlags};

use crate::assert_ok;
use crate::common::fixtures::pattern;
use crate::common::logger::init_test_logger;

async fn open(dir: &TempDir, config: FileSchedulerConfig) -> AppendChallengedFile {
    init_test_logger();
    assert_ok!(AppendChallengedFile::open(dir.path().join("commitlog.bin"), OpenFlags::create_read_write(), config).await)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_to_a_real_file() {
    let dir = TempDir::new().unwrap();
    let file = Arc::new(open(&dir, FileSchedulerConfig::default()).await);

    let mut tasks = Vec::new();
    for i in 0..32u64 {
        let file = Arc::clone(&file);
        tasks.push(tokio::spawn(async move { file.write(i * 4096, pattern(i as u8, 4096)).await }));
    }
    for task in tasks {
        assert_eq!(assert_ok!(task.await.unwrap()), 4096);
    }
    assert_ok!(file.flush().await);

    let bulk = assert_ok!(file.read_bulk(4096 * 5 + 10, 100).await);
    assert_eq!(bulk, pattern(5, 4096)[10..110].to_vec());

    assert_ok!(file.close().await);
    let on_disk = std::fs::read(dir.path().join("commitlog.bin")).unwrap();
    assert_eq!(on_disk.len(), 32 * 4096);
    for i in 0..32usize {
        assert_eq!(&on_disk[i * 4096..(i + 1) * 4096], &pattern(i as u8, 4096)[..]);
    }
}

#[tokio::test]
async fn sloppy_file_ends_at_logical_size_on_disk() {
    let dir = TempDir::new().unwrap();
    let file = open(&dir, FileSchedulerConfig::default().with_sloppy_size(1 << 20)).await;

    assert_ok!(file.write(0, vec![4u8; 5000]).await);
    assert_ok!(file.truncate(3000).await);
    assert_ok!(file.write(3000, vec![6u8; 10]).await);
    assert_eq!(file.size(), 3010);

    let stat = assert_ok!(file.stat().await);
    assert_eq!(stat.size, 3010);
    assert!(stat.physical_size >= 3010);

    assert_ok!(file.close().await);
    let on_disk = std::fs::read(dir.path().join("commitlog.bin")).unwrap();
    assert_eq!(on_disk.len(), 3010);
    assert!(on_disk[..3000].iter().all(|&b| b == 4));
    assert!(on_disk[3000..].iter().all(|&b| b == 6));
}

#[tokio::test]
async fn reopened_file_starts_at_its_length() {
    let dir = TempDir::new().unwrap();
    {
        let file = open(&dir, FileSchedulerConfig::default()).await;
        assert_ok!(file.write(0, vec![1u8; 777]).await);
        assert_ok!(file.close().await);
    }
    let file = open(&dir, FileSchedulerConfig::default()).await;
    assert_eq!(file.size(), 777);
    let (n, _) = assert_ok!(file.read(700, vec![0u8; 4096]).await);
    assert_eq!(n, 77);
    assert_ok!(file.close().await);
}
