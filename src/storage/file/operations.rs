//! # File Operation Definitions
//!
//! This module defines the data structures that represent requests against an
//! append-challenged file. It separates the *intent* of an operation (what the
//! caller asked for, held in the pending queue) from the *task* that is handed
//! to the backend once the scheduler admits it.
//!
//! ## Architecture
//!
//! ```text
//!   Caller (AppendChallengedFile::read / write / truncate / flush / stat)
//!   ═══════════════════════════════════════════════════════════════════════════
//!          │
//!          │ FileRequest + offset/len, completion sender
//!          ▼
//!   ┌─────────────────────────────────────────────────────────────────────────┐
//!   │                        FileOperation                                    │
//!   │                                                                         │
//!   │   id: OperationId          ← assigned by PendingQueue                   │
//!   │   offset, len              ← used by the admission classifier           │
//!   │   request: FileRequest     ← Read / ReadVectored / ReadBulk /           │
//!   │                              Write / WriteVectored / Truncate /         │
//!   │                              Flush / Stat                               │
//!   │   completion: oneshot::Sender<FileResult<TaskOutput>>                   │
//!   └─────────────────────────────────────────────────────────────────────────┘
//!          │
//!          │ admitted by the scheduler, request → FileTask
//!          ▼
//!   ┌─────────────────────────────────────────────────────────────────────────┐
//!   │  FileTask (concrete backend calls, sizes decided at dispatch time)      │
//!   └─────────────────────────────────────────────────────────────────────────┘
//!          │
//!          │ TaskOutput travels back through the scheduler
//!          ▼
//!   ┌─────────────────────────────────────────────────────────────────────────┐
//!   │  OpHandle<T>: Future resolving to FileResult<T>                         │
//!   └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All payloads are owned (no references), so an operation can sit in the
//! queue by value and move into a spawned task without boxing.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime};

use tokio::sync::oneshot;

use crate::common::config::DeviceId;
use crate::common::exception::{FileError, FileResult};

/// Unique operation identifier within one file.
pub type OperationId = u64;

/// Operation kinds as seen by the admission classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    Truncate,
    Flush,
    Stat,
    /// Speculative extension issued by the scheduler itself.
    Extend,
}

/// What the caller asked for. Stored in the pending queue.
pub enum FileRequest {
    /// Read up to `limit` bytes into the front of `buf`.
    Read { buf: Vec<u8>, limit: usize },

    /// Scatter read of at most `limit` bytes across `bufs`.
    ReadVectored { bufs: Vec<Vec<u8>>, limit: usize },

    /// Read `range` bytes into a freshly allocated buffer.
    ReadBulk { range: usize },

    Write { data: Vec<u8> },

    WriteVectored { bufs: Vec<Vec<u8>> },

    Truncate { len: u64 },

    Flush,

    Stat,
}

impl FileRequest {
    pub fn kind(&self) -> OpKind {
        match self {
            FileRequest::Read { .. }
            | FileRequest::ReadVectored { .. }
            | FileRequest::ReadBulk { .. } => OpKind::Read,
            FileRequest::Write { .. } | FileRequest::WriteVectored { .. } => OpKind::Write,
            FileRequest::Truncate { .. } => OpKind::Truncate,
            FileRequest::Flush => OpKind::Flush,
            FileRequest::Stat => OpKind::Stat,
        }
    }
}

impl fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileRequest::Read { buf, limit } => {
                write!(f, "Read {{ buf_len: {}, limit: {} }}", buf.len(), limit)
            }
            FileRequest::ReadVectored { bufs, limit } => {
                write!(f, "ReadVectored {{ iovecs: {}, limit: {} }}", bufs.len(), limit)
            }
            FileRequest::ReadBulk { range } => write!(f, "ReadBulk {{ range: {} }}", range),
            FileRequest::Write { data } => write!(f, "Write {{ len: {} }}", data.len()),
            FileRequest::WriteVectored { bufs } => {
                write!(f, "WriteVectored {{ iovecs: {} }}", bufs.len())
            }
            FileRequest::Truncate { len } => write!(f, "Truncate {{ len: {} }}", len),
            FileRequest::Flush => write!(f, "Flush"),
            FileRequest::Stat => write!(f, "Stat"),
        }
    }
}

/// Concrete backend work, built by the scheduler at dispatch time.
pub enum FileTask {
    Read { offset: u64, buf: Vec<u8>, limit: usize },
    ReadVectored { offset: u64, bufs: Vec<Vec<u8>>, limit: usize },
    ReadBulk { offset: u64, range: usize },
    Write { offset: u64, data: Vec<u8> },
    WriteVectored { offset: u64, bufs: Vec<Vec<u8>> },
    /// Set the physical file length.
    Truncate { len: u64 },
    /// Optionally set the physical length to the logical size, then fsync.
    Sync { materialize: Option<u64> },
    Stat,
    /// Final release of the descriptor, after an optional materializing truncate.
    Release { materialize: Option<u64> },
}

impl fmt::Debug for FileTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileTask::Read { offset, limit, .. } => {
                write!(f, "Read {{ offset: {}, limit: {} }}", offset, limit)
            }
            FileTask::ReadVectored { offset, limit, .. } => {
                write!(f, "ReadVectored {{ offset: {}, limit: {} }}", offset, limit)
            }
            FileTask::ReadBulk { offset, range } => {
                write!(f, "ReadBulk {{ offset: {}, range: {} }}", offset, range)
            }
            FileTask::Write { offset, data } => {
                write!(f, "Write {{ offset: {}, len: {} }}", offset, data.len())
            }
            FileTask::WriteVectored { offset, bufs } => {
                write!(f, "WriteVectored {{ offset: {}, iovecs: {} }}", offset, bufs.len())
            }
            FileTask::Truncate { len } => write!(f, "Truncate {{ len: {} }}", len),
            FileTask::Sync { materialize } => write!(f, "Sync {{ materialize: {:?} }}", materialize),
            FileTask::Stat => write!(f, "Stat"),
            FileTask::Release { materialize } => {
                write!(f, "Release {{ materialize: {:?} }}", materialize)
            }
        }
    }
}

/// Metadata snapshot returned by `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// File size as reported to callers (the logical size).
    pub size: u64,
    /// Length of the file as the kernel sees it.
    pub physical_size: u64,
    pub device_id: DeviceId,
    pub inode: u64,
    pub mode: u32,
    pub block_size: u64,
    pub blocks: u64,
    pub modified: Option<SystemTime>,
}

/// Result payload of a completed task.
#[derive(Debug)]
pub enum TaskOutput {
    Read { bytes: usize, buf: Vec<u8> },
    ReadVectored { bytes: usize, bufs: Vec<Vec<u8>> },
    Bulk(Vec<u8>),
    Written(usize),
    Stat(FileStat),
    Done,
}

impl TaskOutput {
    fn variant_name(&self) -> &'static str {
        match self {
            TaskOutput::Read { .. } => "Read",
            TaskOutput::ReadVectored { .. } => "ReadVectored",
            TaskOutput::Bulk(_) => "Bulk",
            TaskOutput::Written(_) => "Written",
            TaskOutput::Stat(_) => "Stat",
            TaskOutput::Done => "Done",
        }
    }
}

pub type CompletionSender = oneshot::Sender<FileResult<TaskOutput>>;

/// A queued operation: classification inputs, payload and completion handle.
#[derive(Debug)]
pub struct FileOperation {
    pub id: OperationId,
    pub offset: u64,
    pub len: u64,
    pub request: FileRequest,
    pub completion: CompletionSender,
    pub submitted_at: Instant,
}

impl FileOperation {
    /// Creates an operation. The id is assigned when it enters the queue.
    pub fn new(offset: u64, len: u64, request: FileRequest, completion: CompletionSender) -> Self {
        Self {
            id: 0,
            offset,
            len,
            request,
            completion,
            submitted_at: Instant::now(),
        }
    }

    pub fn kind(&self) -> OpKind {
        self.request.kind()
    }

    /// Fulfils the completion handle. A dropped handle is not an error.
    pub fn complete(self, result: FileResult<TaskOutput>) {
        let _ = self.completion.send(result);
    }
}

/// Conversion from the untyped task output to what a caller awaits.
pub trait FromTaskOutput: Sized {
    fn from_output(output: TaskOutput) -> FileResult<Self>;
}

fn unexpected<T>(expected: &str, output: &TaskOutput) -> FileResult<T> {
    Err(FileError::Internal(format!(
        "expected {} output, got {}",
        expected,
        output.variant_name()
    )))
}

impl FromTaskOutput for (usize, Vec<u8>) {
    fn from_output(output: TaskOutput) -> FileResult<Self> {
        match output {
            TaskOutput::Read { bytes, buf } => Ok((bytes, buf)),
            other => unexpected("Read", &other),
        }
    }
}

impl FromTaskOutput for (usize, Vec<Vec<u8>>) {
    fn from_output(output: TaskOutput) -> FileResult<Self> {
        match output {
            TaskOutput::ReadVectored { bytes, bufs } => Ok((bytes, bufs)),
            other => unexpected("ReadVectored", &other),
        }
    }
}

impl FromTaskOutput for Vec<u8> {
    fn from_output(output: TaskOutput) -> FileResult<Self> {
        match output {
            TaskOutput::Bulk(buf) => Ok(buf),
            other => unexpected("Bulk", &other),
        }
    }
}

impl FromTaskOutput for usize {
    fn from_output(output: TaskOutput) -> FileResult<Self> {
        match output {
            TaskOutput::Written(bytes) => Ok(bytes),
            other => unexpected("Written", &other),
        }
    }
}

impl FromTaskOutput for FileStat {
    fn from_output(output: TaskOutput) -> FileResult<Self> {
        match output {
            TaskOutput::Stat(stat) => Ok(stat),
            other => unexpected("Stat", &other),
        }
    }
}

impl FromTaskOutput for () {
    fn from_output(output: TaskOutput) -> FileResult<Self> {
        match output {
            TaskOutput::Done => Ok(()),
            other => unexpected("Done", &other),
        }
    }
}

enum HandleState {
    Pending(oneshot::Receiver<FileResult<TaskOutput>>),
    Ready(Option<FileResult<TaskOutput>>),
}

/// Completion handle returned immediately by every file operation.
///
/// Resolves once the operation has run (or failed to be admitted). Dropping
/// the handle does not cancel the operation.
#[must_use = "dropping an OpHandle discards the operation's result"]
pub struct OpHandle<T> {
    state: HandleState,
    _output: std::marker::PhantomData<fn() -> T>,
}

impl<T> OpHandle<T> {
    pub(crate) fn pending(receiver: oneshot::Receiver<FileResult<TaskOutput>>) -> Self {
        Self {
            state: HandleState::Pending(receiver),
            _output: std::marker::PhantomData,
        }
    }

    pub(crate) fn ready(output: TaskOutput) -> Self {
        Self {
            state: HandleState::Ready(Some(Ok(output))),
            _output: std::marker::PhantomData,
        }
    }

    pub(crate) fn failed(error: FileError) -> Self {
        Self {
            state: HandleState::Ready(Some(Err(error))),
            _output: std::marker::PhantomData,
        }
    }
}

impl<T> fmt::Debug for OpHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            HandleState::Pending(_) => "pending",
            HandleState::Ready(Some(_)) => "ready",
            HandleState::Ready(None) => "consumed",
        };
        f.debug_struct("OpHandle").field("state", &state).finish()
    }
}

impl<T: FromTaskOutput> Future for OpHandle<T> {
    type Output = FileResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.state {
            HandleState::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(result)) => result,
                // The scheduler went away without answering.
                Poll::Ready(Err(_)) => Err(FileError::SchedulerStopped),
            },
            HandleState::Ready(result) => result.take().unwrap_or_else(|| {
                Err(FileError::Internal("OpHandle polled after completion".to_string()))
            }),
        };
        this.state = HandleState::Ready(None);
        Poll::Ready(result.and_then(T::from_output))
    }
}
