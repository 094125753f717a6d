//! Syscall layer seam.
//!
//! The scheduler never touches a descriptor itself. Every admitted task is
//! handed to a [`FileBackend`], which performs the call asynchronously and
//! reports a byte count or an OS error. [`PosixBackend`] does this for a real
//! file by running positional syscalls on tokio's blocking pool.

use std::fs::File;
use std::io::{Error, ErrorKind, Result as IoResult};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::config::{DeviceId, OpenFlags};
use crate::storage::file::operations::FileStat;

/// Asynchronous file primitives against a single descriptor.
///
/// Buffers are passed by value and handed back, so a call can move to another
/// thread while the caller's future is parked.
#[async_trait]
pub trait FileBackend: Send + Sync + 'static {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the count and the buffer.
    async fn read_at(&self, offset: u64, buf: Vec<u8>) -> IoResult<(usize, Vec<u8>)>;

    /// Scatter read starting at `offset`.
    async fn read_vectored_at(
        &self,
        offset: u64,
        bufs: Vec<Vec<u8>>,
    ) -> IoResult<(usize, Vec<Vec<u8>>)>;

    async fn write_at(&self, offset: u64, data: Vec<u8>) -> IoResult<usize>;

    /// Gather write starting at `offset`.
    async fn write_vectored_at(&self, offset: u64, bufs: Vec<Vec<u8>>) -> IoResult<usize>;

    /// Sets the physical length of the file.
    async fn truncate(&self, len: u64) -> IoResult<()>;

    /// Flushes data and metadata to stable storage.
    async fn sync(&self) -> IoResult<()>;

    async fn stat(&self) -> IoResult<FileStat>;

    /// Releases the descriptor. Later calls fail with `EBADF`.
    async fn close(&self) -> IoResult<()>;
}

fn bad_descriptor() -> Error {
    Error::from_raw_os_error(libc::EBADF)
}

/// Positional I/O on a `std::fs::File`, executed on the blocking pool.
#[derive(Debug)]
pub struct PosixBackend {
    file: Mutex<Option<Arc<File>>>,
}

impl PosixBackend {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(Some(Arc::new(file))),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> IoResult<Self> {
        debug!("Opening append-challenged file: {}", path.as_ref().display());
        let file = flags.to_open_options().open(path.as_ref())?;
        Ok(Self::new(file))
    }

    fn file(&self) -> IoResult<Arc<File>> {
        self.file.lock().clone().ok_or_else(bad_descriptor)
    }

    async fn run_blocking<T, F>(&self, call: F) -> IoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> IoResult<T> + Send + 'static,
    {
        let file = self.file()?;
        tokio::task::spawn_blocking(move || call(&file))
            .await
            .map_err(|join_err| Error::other(format!("blocking I/O task failed: {}", join_err)))?
    }
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> IoResult<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if done > 0 => {
                warn!("read at {} failed after {} bytes: {}", offset, done, e);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

#[async_trait]
impl FileBackend for PosixBackend {
    async fn read_at(&self, offset: u64, mut buf: Vec<u8>) -> IoResult<(usize, Vec<u8>)> {
        self.run_blocking(move |file| {
            let n = read_full_at(file, &mut buf, offset)?;
            Ok((n, buf))
        })
        .await
    }

    async fn read_vectored_at(
        &self,
        offset: u64,
        mut bufs: Vec<Vec<u8>>,
    ) -> IoResult<(usize, Vec<Vec<u8>>)> {
        self.run_blocking(move |file| {
            let mut total = 0usize;
            for buf in bufs.iter_mut() {
                let n = read_full_at(file, buf, offset + total as u64)?;
                total += n;
                if n < buf.len() {
                    break;
                }
            }
            Ok((total, bufs))
        })
        .await
    }

    async fn write_at(&self, offset: u64, data: Vec<u8>) -> IoResult<usize> {
        self.run_blocking(move |file| {
            file.write_all_at(&data, offset)?;
            Ok(data.len())
        })
        .await
    }

    async fn write_vectored_at(&self, offset: u64, bufs: Vec<Vec<u8>>) -> IoResult<usize> {
        self.run_blocking(move |file| {
            let mut total = 0usize;
            for buf in &bufs {
                file.write_all_at(buf, offset + total as u64)?;
                total += buf.len();
            }
            Ok(total)
        })
        .await
    }

    async fn truncate(&self, len: u64) -> IoResult<()> {
        self.run_blocking(move |file| file.set_len(len)).await
    }

    async fn sync(&self) -> IoResult<()> {
        self.run_blocking(|file| file.sync_all()).await
    }

    async fn stat(&self) -> IoResult<FileStat> {
        self.run_blocking(|file| {
            let metadata = file.metadata()?;
            Ok(FileStat {
                size: metadata.len(),
                physical_size: metadata.len(),
                device_id: metadata.dev() as DeviceId,
                inode: metadata.ino(),
                mode: metadata.mode(),
                block_size: metadata.blksize(),
                blocks: metadata.blocks(),
                modified: metadata.modified().ok(),
            })
        })
        .await
    }

    async fn close(&self) -> IoResult<()> {
        let file = self.file.lock().take().ok_or_else(bad_descriptor)?;
        match Arc::try_unwrap(file) {
            Ok(file) => {
                tokio::task::spawn_blocking(move || {
                    let fd = file.into_raw_fd();
                    // SAFETY: `fd` was just released by `into_raw_fd` and is closed exactly once.
                    let rc = unsafe { libc::close(fd) };
                    if rc == -1 {
                        Err(Error::last_os_error())
                    } else {
                        Ok(())
                    }
                })
                .await
                .map_err(|join_err| Error::other(format!("close task failed: {}", join_err)))?
            }
            Err(shared) => {
                // An in-flight call still holds the file; it closes when that call ends.
                warn!("descriptor still referenced at close, deferring release");
                drop(shared);
                Ok(())
            }
        }
    }
}
