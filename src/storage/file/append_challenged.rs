//! # Append-Challenged File
//!
//! `AppendChallengedFile` is the public face of the admission scheduler. It
//! wraps one descriptor on a filesystem where concurrent size-changing I/O
//! serializes inside the kernel (XFS being the usual suspect), and keeps the
//! kernel from ever having to do that serialization itself.
//!
//! ## Architecture
//!
//! ```text
//!   Caller tasks
//!   ═══════════════════════════════════════════════════════════════════════════
//!          │
//!          │ read(), write(), read_bulk(), flush(), truncate(), stat(), close()
//!          ▼
//!   ┌─────────────────────────────────────────────────────────────────────────┐
//!   │                      AppendChallengedFile                               │
//!   │                                                                         │
//!   │   builds FileOperation + oneshot ──► Command::Submit ──► mpsc           │
//!   │   returns OpHandle<T> immediately                                       │
//!   │                                                                         │
//!   │   size(), committed_size(), metrics()  ◄── published by the scheduler   │
//!   │   state(), wait_for_state()            ◄── watch channel                │
//!   └─────────────────────────────────────────────────────────────────────────┘
//!          │
//!          ▼
//!   ┌─────────────────────────────────────────────────────────────────────────┐
//!   │  FileScheduler task  ──►  TaskExecutor  ──►  FileBackend (Posix/Memory) │
//!   └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Public API
//!
//! | Method             | Result                   | Notes                                |
//! |--------------------|--------------------------|--------------------------------------|
//! | `read()`           | `(usize, Vec<u8>)`       | clamped at the logical size          |
//! | `read_vectored()`  | `(usize, Vec<Vec<u8>>)`  | scatter read                         |
//! | `read_bulk()`      | `Vec<u8>`                | block-aligned, trimmed at EOF        |
//! | `write()`          | `usize`                  | may extend the file                  |
//! | `write_vectored()` | `usize`                  | gather write                         |
//! | `flush()`          | `()`                     | exclusive when fsync locks the file  |
//! | `truncate()`       | `()`                     | always runs alone                    |
//! | `stat()`           | `FileStat`               | `size` is the logical size           |
//! | `close()`          | `()`                     | drains, then releases the descriptor |
//! | `size()`           | `u64`                    | synchronous                          |
//!
//! Every operation returns an [`OpHandle`] without suspending. Errors are
//! local to the operation that produced them.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot, watch};

use crate::common::config::{DeviceId, FileSchedulerConfig, OpenFlags};
use crate::common::exception::{FileError, FileResult};
use crate::storage::file::backend::{FileBackend, PosixBackend};
use crate::storage::file::executor::TaskExecutor;
use crate::storage::file::lifecycle::LifecycleState;
use crate::storage::file::metrics::MetricsSnapshot;
use crate::storage::file::operations::{FileOperation, FileRequest, FileStat, OpHandle};
use crate::storage::file::scheduler::{Command, FileScheduler, SchedulerSnapshot, SharedState};

/// A file whose I/O is admitted according to filesystem locking rules.
///
/// Methods take `&self`; share the file between tasks with an `Arc`.
/// Dropping the last reference without calling [`close`](Self::close) closes
/// the file in the background once outstanding work has finished.
#[derive(Debug)]
pub struct AppendChallengedFile {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<SharedState>,
    state: watch::Receiver<LifecycleState>,
    flags: OpenFlags,
    device_id: DeviceId,
    config: FileSchedulerConfig,
}

impl AppendChallengedFile {
    /// Opens `path` and starts its scheduler on the current runtime.
    ///
    /// # Arguments
    /// * `path` - File to open
    /// * `flags` - Open mode
    /// * `config` - Admission policy for the filesystem holding the file
    pub async fn open<P: AsRef<Path>>(
        path: P,
        flags: OpenFlags,
        config: FileSchedulerConfig,
    ) -> FileResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let backend = tokio::task::spawn_blocking(move || PosixBackend::open(&path, flags))
            .await
            .map_err(|e| FileError::Internal(format!("open task failed: {}", e)))??;
        Self::with_backend(Arc::new(backend), flags, config).await
    }

    /// Wraps an already open backend.
    ///
    /// The backend is stat'ed once to learn the initial size and device.
    pub async fn with_backend(
        backend: Arc<dyn FileBackend>,
        flags: OpenFlags,
        config: FileSchedulerConfig,
    ) -> FileResult<Self> {
        config.validate()?;
        let stat = backend.stat().await?;

        let executor = TaskExecutor::new(backend, u64::from(config.block_size));
        let shared = Arc::new(SharedState::new(stat.size));
        let (scheduler, state) = FileScheduler::new(executor, &config, stat.size, Arc::clone(&shared));
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(scheduler.run(receiver));

        info!(
            "append-challenged file ready: size {}, device {:#x}, max size-changing ops {}, \
             flush exclusive {}, sloppy size {}",
            stat.size,
            stat.device_id,
            config.max_size_changing_ops,
            config.flush_is_exclusive,
            config.sloppy_size
        );

        Ok(Self {
            commands,
            shared,
            state,
            flags,
            device_id: stat.device_id,
            config,
        })
    }

    fn submit<T>(&self, offset: u64, len: u64, request: FileRequest) -> OpHandle<T> {
        let (sender, receiver) = oneshot::channel();
        let operation = FileOperation::new(offset, len, request, sender);
        match self.commands.send(Command::Submit(operation)) {
            Ok(()) => OpHandle::pending(receiver),
            Err(_) => OpHandle::failed(FileError::SchedulerStopped),
        }
    }

    /// Reads into `buf` at `offset`. Returns the byte count and the buffer.
    ///
    /// A read at or past the logical size completes with zero bytes without
    /// touching the kernel. Otherwise the length is clamped to the logical
    /// size rounded up to the block size.
    pub fn read(&self, offset: u64, buf: Vec<u8>) -> OpHandle<(usize, Vec<u8>)> {
        let len = buf.len();
        self.submit(offset, len as u64, FileRequest::Read { buf, limit: len })
    }

    /// Scatter read into `bufs`, filled in order.
    pub fn read_vectored(&self, offset: u64, bufs: Vec<Vec<u8>>) -> OpHandle<(usize, Vec<Vec<u8>>)> {
        let len: usize = bufs.iter().map(Vec::len).sum();
        self.submit(offset, len as u64, FileRequest::ReadVectored { bufs, limit: len })
    }

    /// Reads `range` bytes at `offset` into a new buffer, shorter at end-of-file.
    pub fn read_bulk(&self, offset: u64, range: usize) -> OpHandle<Vec<u8>> {
        self.submit(offset, range as u64, FileRequest::ReadBulk { range })
    }

    pub fn write(&self, offset: u64, data: Vec<u8>) -> OpHandle<usize> {
        let len = data.len() as u64;
        self.submit(offset, len, FileRequest::Write { data })
    }

    /// Gather write of `bufs`, laid out back to back from `offset`.
    pub fn write_vectored(&self, offset: u64, bufs: Vec<Vec<u8>>) -> OpHandle<usize> {
        let len: usize = bufs.iter().map(Vec::len).sum();
        self.submit(offset, len as u64, FileRequest::WriteVectored { bufs })
    }

    /// Flushes data and metadata to stable storage.
    pub fn flush(&self) -> OpHandle<()> {
        self.submit(0, 0, FileRequest::Flush)
    }

    /// Sets the file length. `size()` reports `len` once this completes,
    /// or the end of any write submitted after it, whichever is larger.
    ///
    /// Lengths past `i64::MAX` fail with `EINVAL`.
    pub fn truncate(&self, len: u64) -> OpHandle<()> {
        self.submit(len, 0, FileRequest::Truncate { len })
    }

    pub fn stat(&self) -> OpHandle<FileStat> {
        self.submit(0, 0, FileRequest::Stat)
    }

    /// Stops accepting work, drains what is queued and in flight, then
    /// releases the descriptor. Calling it again waits for the same close.
    pub fn close(&self) -> OpHandle<()> {
        let (sender, receiver) = oneshot::channel();
        match self.commands.send(Command::Close(sender)) {
            Ok(()) => {
                debug!("close requested");
                OpHandle::pending(receiver)
            }
            Err(_) => OpHandle::failed(FileError::SchedulerStopped),
        }
    }

    /// Current logical size. Never suspends.
    ///
    /// The value is published by the scheduler task, so it reflects only the
    /// commands that task has already processed. A `write()` issued just
    /// before, with no `.await` in between, may not be counted yet; await the
    /// handle or [`snapshot`](Self::snapshot) for an ordered view.
    pub fn size(&self) -> u64 {
        self.shared.sizes.read().logical
    }

    /// Size confirmed by completed writes and truncates.
    pub fn committed_size(&self) -> u64 {
        self.shared.sizes.read().committed
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Waits until the file has reached `target` or a later state.
    pub async fn wait_for_state(&self, target: LifecycleState) -> FileResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current >= target)
            .await
            .map(|_| ())
            .map_err(|_| FileError::SchedulerStopped)
    }

    /// Scheduler state as of the moment this request is processed. Ordered
    /// after every operation this handle submitted before it.
    pub async fn snapshot(&self) -> FileResult<SchedulerSnapshot> {
        let (sender, receiver) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(sender))
            .map_err(|_| FileError::SchedulerStopped)?;
        receiver.await.map_err(|_| FileError::SchedulerStopped)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn config(&self) -> &FileSchedulerConfig {
        &self.config
    }
}
