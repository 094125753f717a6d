//! Task Executor Module
//!
//! This module turns an admitted `FileTask` into calls on the backend. Size
//! decisions (read clamps, materializing lengths) were already taken by the
//! scheduler when the task was built; the executor only carries them out.

use std::io::ErrorKind;
use std::sync::Arc;

use log::{trace, warn};

use crate::common::exception::FileResult;
use crate::common::util::helpers::{align_down, align_up};
use crate::storage::file::backend::FileBackend;
use crate::storage::file::operations::{FileTask, TaskOutput};

/// Executes tasks against a shared backend
///
/// Cheap to clone; every dispatched task gets its own copy.
#[derive(Clone)]
pub struct TaskExecutor {
    backend: Arc<dyn FileBackend>,
    block_size: u64,
}

impl TaskExecutor {
    /// Creates a new executor
    ///
    /// # Arguments
    /// * `backend` - Syscall layer for the file
    /// * `block_size` - Alignment used by bulk reads
    pub fn new(backend: Arc<dyn FileBackend>, block_size: u64) -> Self {
        Self {
            backend,
            block_size,
        }
    }

    pub fn backend(&self) -> &Arc<dyn FileBackend> {
        &self.backend
    }

    /// Executes a single task
    ///
    /// # Arguments
    /// * `task` - The task built by the scheduler at dispatch time
    ///
    /// # Returns
    /// The task output, or the OS error of the first failing call
    pub async fn execute(&self, task: FileTask) -> FileResult<TaskOutput> {
        trace!("executing {:?}", task);
        match task {
            FileTask::Read { offset, buf, limit } => self.execute_read(offset, buf, limit).await,
            FileTask::ReadVectored {
                offset,
                bufs,
                limit,
            } => self.execute_read_vectored(offset, bufs, limit).await,
            FileTask::ReadBulk { offset, range } => {
                Ok(TaskOutput::Bulk(self.execute_read_bulk(offset, range).await?))
            }
            FileTask::Write { offset, data } => {
                if data.is_empty() {
                    return Ok(TaskOutput::Written(0));
                }
                Ok(TaskOutput::Written(self.backend.write_at(offset, data).await?))
            }
            FileTask::WriteVectored { offset, bufs } => {
                if bufs.iter().all(Vec::is_empty) {
                    return Ok(TaskOutput::Written(0));
                }
                Ok(TaskOutput::Written(
                    self.backend.write_vectored_at(offset, bufs).await?,
                ))
            }
            FileTask::Truncate { len } => {
                self.backend.truncate(len).await?;
                Ok(TaskOutput::Done)
            }
            FileTask::Sync { materialize } => {
                if let Some(len) = materialize {
                    self.backend.truncate(len).await?;
                }
                self.backend.sync().await?;
                Ok(TaskOutput::Done)
            }
            FileTask::Stat => Ok(TaskOutput::Stat(self.backend.stat().await?)),
            FileTask::Release { materialize } => {
                if let Some(len) = materialize {
                    // The descriptor is released regardless.
                    if let Err(e) = self.backend.truncate(len).await {
                        warn!("failed to truncate to logical size {} on close: {}", len, e);
                    }
                }
                self.backend.close().await?;
                Ok(TaskOutput::Done)
            }
        }
    }

    /// Reads into the first `limit` bytes of `buf`; the rest is left untouched.
    async fn execute_read(&self, offset: u64, mut buf: Vec<u8>, limit: usize) -> FileResult<TaskOutput> {
        if limit == 0 {
            return Ok(TaskOutput::Read { bytes: 0, buf });
        }
        let tail = if limit < buf.len() {
            Some(buf.split_off(limit))
        } else {
            None
        };
        let (bytes, mut buf) = self.backend.read_at(offset, buf).await?;
        if let Some(tail) = tail {
            buf.extend_from_slice(&tail);
        }
        Ok(TaskOutput::Read { bytes, buf })
    }

    /// Scatter read limited to `limit` bytes across all buffers.
    async fn execute_read_vectored(
        &self,
        offset: u64,
        mut bufs: Vec<Vec<u8>>,
        limit: usize,
    ) -> FileResult<TaskOutput> {
        if limit == 0 {
            return Ok(TaskOutput::ReadVectored { bytes: 0, bufs });
        }

        // Split off whatever lies past `limit` and reattach it afterwards.
        let mut tails: Vec<Vec<u8>> = Vec::with_capacity(bufs.len());
        let mut remaining = limit;
        for buf in bufs.iter_mut() {
            if remaining >= buf.len() {
                remaining -= buf.len();
                tails.push(Vec::new());
            } else {
                tails.push(buf.split_off(remaining));
                remaining = 0;
            }
        }

        let (bytes, mut bufs) = self.backend.read_vectored_at(offset, bufs).await?;
        for (buf, tail) in bufs.iter_mut().zip(tails) {
            buf.extend_from_slice(&tail);
        }
        Ok(TaskOutput::ReadVectored { bytes, bufs })
    }

    /// Reads `range` bytes at `offset` through block-aligned I/O.
    ///
    /// The aligned read may come back short near end-of-file. Short reads are
    /// retried for the remainder until the kernel reports end-of-file (zero
    /// bytes) or rejects the unaligned tail with `EINVAL`. The result is the
    /// requested window trimmed to what was actually read.
    async fn execute_read_bulk(&self, offset: u64, range: usize) -> FileResult<Vec<u8>> {
        if range == 0 {
            return Ok(Vec::new());
        }
        let aligned_offset = align_down(offset, self.block_size);
        let front = (offset - aligned_offset) as usize;
        let aligned_len = align_up((front + range) as u64, self.block_size) as usize;

        let mut data = vec![0u8; aligned_len];
        let mut done = 0usize;
        while done < aligned_len {
            let chunk = vec![0u8; aligned_len - done];
            match self.backend.read_at(aligned_offset + done as u64, chunk).await {
                Ok((0, _)) => break,
                Ok((n, chunk)) => {
                    data[done..done + n].copy_from_slice(&chunk[..n]);
                    done += n;
                }
                Err(e) if done > 0 && e.raw_os_error() == Some(libc::EINVAL) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if done <= front {
            return Ok(Vec::new());
        }
        let end = done.min(front + range);
        data.truncate(end);
        data.drain(..front);
        Ok(data)
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("block_size", &self.block_size)
            .finish()
    }
}
