use std::collections::HashMap;
use std::io::{Error, Result as IoResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use log::trace;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::common::config::DeviceId;
use crate::storage::file::backend::FileBackend;
use crate::storage::file::operations::FileStat;

/// Backend calls as observed by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCall {
    Read,
    Write,
    Truncate,
    Sync,
    Stat,
    Close,
}

/// A call that was executing when another call started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveCall {
    pub call: BackendCall,
    pub offset: u64,
    pub len: u64,
    /// A write reaching past the file length at the time it started.
    pub extends: bool,
}

/// One recorded call start, with everything that overlapped it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEvent {
    pub seq: u64,
    pub started: ActiveCall,
    pub concurrent: Vec<ActiveCall>,
}

#[derive(Debug, Default)]
struct ProbeState {
    next_seq: u64,
    active: HashMap<u64, ActiveCall>,
    events: Vec<ProbeEvent>,
    started: HashMap<BackendCall, usize>,
    finished: HashMap<BackendCall, usize>,
    peak_active: usize,
}

/// MemoryBackend keeps the file contents in memory.
///
/// It is used by tests and benchmarks of the scheduler. Besides the data it
/// records every call with the calls that overlapped it, can hold calls of a
/// given kind at a gate until released, and can inject an OS error into the
/// next call of a kind.
pub struct MemoryBackend {
    data: Mutex<Vec<u8>>,
    closed: AtomicBool,
    device_id: DeviceId,
    probe: Mutex<ProbeState>,
    started_notify: Notify,
    gates: Mutex<HashMap<BackendCall, Arc<Semaphore>>>,
    failures: Mutex<HashMap<BackendCall, i32>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_contents(Vec::new())
    }

    pub fn with_contents(contents: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(contents),
            closed: AtomicBool::new(false),
            device_id: 0xfd00,
            probe: Mutex::new(ProbeState::default()),
            started_notify: Notify::new(),
            gates: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Physical length of the in-memory file.
    pub fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Holds every subsequent call of `call` at a gate until released.
    pub fn hold(&self, call: BackendCall) {
        self.gates
            .lock()
            .entry(call)
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    /// Lets `count` held calls of `call` through.
    pub fn release(&self, call: BackendCall, count: usize) {
        if let Some(gate) = self.gates.lock().get(&call) {
            gate.add_permits(count);
        }
    }

    /// Removes the gate for `call`, letting everything through.
    pub fn open(&self, call: BackendCall) {
        if let Some(gate) = self.gates.lock().remove(&call) {
            gate.close();
        }
    }

    /// Fails the next call of `call` with the given errno.
    pub fn fail_next(&self, call: BackendCall, errno: i32) {
        self.failures.lock().insert(call, errno);
    }

    pub fn started(&self, call: BackendCall) -> usize {
        self.probe.lock().started.get(&call).copied().unwrap_or(0)
    }

    pub fn finished(&self, call: BackendCall) -> usize {
        self.probe.lock().finished.get(&call).copied().unwrap_or(0)
    }

    /// Number of calls currently executing (including held ones).
    pub fn active(&self) -> usize {
        self.probe.lock().active.len()
    }

    pub fn peak_active(&self) -> usize {
        self.probe.lock().peak_active
    }

    pub fn events(&self) -> Vec<ProbeEvent> {
        self.probe.lock().events.clone()
    }

    /// Waits until at least `count` calls of `call` have started.
    pub async fn wait_for_started(&self, call: BackendCall, count: usize) {
        loop {
            let notified = self.started_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.started(call) >= count {
                return;
            }
            notified.await;
        }
    }

    async fn enter(&self, call: BackendCall, offset: u64, len: u64) -> IoResult<u64> {
        let seq = {
            let extends = call == BackendCall::Write && offset.saturating_add(len) > self.len();
            let mut probe = self.probe.lock();
            let seq = probe.next_seq;
            probe.next_seq += 1;
            let started = ActiveCall {
                call,
                offset,
                len,
                extends,
            };
            let concurrent = probe.active.values().copied().collect();
            probe.events.push(ProbeEvent {
                seq,
                started,
                concurrent,
            });
            probe.active.insert(seq, started);
            *probe.started.entry(call).or_insert(0) += 1;
            probe.peak_active = probe.peak_active.max(probe.active.len());
            seq
        };
        trace!("memory backend: {:?} #{} started at {} len {}", call, seq, offset, len);
        self.started_notify.notify_waiters();

        let gate = self.gates.lock().get(&call).cloned();
        if let Some(gate) = gate {
            // A closed gate means it was opened for good.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if self.is_closed() {
            self.leave(seq);
            return Err(Error::from_raw_os_error(libc::EBADF));
        }
        if let Some(errno) = self.failures.lock().remove(&call) {
            self.leave(seq);
            return Err(Error::from_raw_os_error(errno));
        }
        Ok(seq)
    }

    fn leave(&self, seq: u64) {
        let mut probe = self.probe.lock();
        if let Some(active) = probe.active.remove(&seq) {
            *probe.finished.entry(active.call).or_insert(0) += 1;
        }
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        let start = offset as usize;
        if start >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_from(&self, offset: u64, src: &[u8]) {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .field("active", &self.active())
            .finish()
    }
}

#[async_trait]
impl FileBackend for MemoryBackend {
    async fn read_at(&self, offset: u64, mut buf: Vec<u8>) -> IoResult<(usize, Vec<u8>)> {
        let seq = self.enter(BackendCall::Read, offset, buf.len() as u64).await?;
        let n = self.read_into(offset, &mut buf);
        self.leave(seq);
        Ok((n, buf))
    }

    async fn read_vectored_at(
        &self,
        offset: u64,
        mut bufs: Vec<Vec<u8>>,
    ) -> IoResult<(usize, Vec<Vec<u8>>)> {
        let total: usize = bufs.iter().map(Vec::len).sum();
        let seq = self.enter(BackendCall::Read, offset, total as u64).await?;
        let mut done = 0usize;
        for buf in bufs.iter_mut() {
            let n = self.read_into(offset + done as u64, buf);
            done += n;
            if n < buf.len() {
                break;
            }
        }
        self.leave(seq);
        Ok((done, bufs))
    }

    async fn write_at(&self, offset: u64, data: Vec<u8>) -> IoResult<usize> {
        let seq = self.enter(BackendCall::Write, offset, data.len() as u64).await?;
        self.write_from(offset, &data);
        self.leave(seq);
        Ok(data.len())
    }

    async fn write_vectored_at(&self, offset: u64, bufs: Vec<Vec<u8>>) -> IoResult<usize> {
        let total: usize = bufs.iter().map(Vec::len).sum();
        let seq = self.enter(BackendCall::Write, offset, total as u64).await?;
        let mut done = 0usize;
        for buf in &bufs {
            self.write_from(offset + done as u64, buf);
            done += buf.len();
        }
        self.leave(seq);
        Ok(done)
    }

    async fn truncate(&self, len: u64) -> IoResult<()> {
        let seq = self.enter(BackendCall::Truncate, len, 0).await?;
        self.data.lock().resize(len as usize, 0);
        self.leave(seq);
        Ok(())
    }

    async fn sync(&self) -> IoResult<()> {
        let seq = self.enter(BackendCall::Sync, 0, 0).await?;
        self.leave(seq);
        Ok(())
    }

    async fn stat(&self) -> IoResult<FileStat> {
        let seq = self.enter(BackendCall::Stat, 0, 0).await?;
        let len = self.len();
        self.leave(seq);
        Ok(FileStat {
            size: len,
            physical_size: len,
            device_id: self.device_id,
            inode: 1,
            mode: 0o100644,
            block_size: 4096,
            blocks: len.div_ceil(512),
            modified: Some(SystemTime::now()),
        })
    }

    async fn close(&self) -> IoResult<()> {
        let seq = self.enter(BackendCall::Close, 0, 0).await?;
        self.closed.store(true, Ordering::Release);
        self.leave(seq);
        Ok(())
    }
}
