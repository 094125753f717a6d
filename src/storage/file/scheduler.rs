//! # Admission Scheduler
//!
//! One scheduler task owns everything that makes an append-challenged file
//! safe to use concurrently: the pending queue, the in-flight counters, the
//! size tracker and the lifecycle. Nothing else mutates them, so none of them
//! is locked.
//!
//! ## Architecture
//!
//! ```text
//!   AppendChallengedFile (any task / thread)
//!   ═══════════════════════════════════════════════════════════════════════════
//!          │ Command::Submit / Close / Snapshot         ▲ sizes, metrics
//!          │ (unbounded mpsc, submission order)         │ (published, lock-free reads)
//!          ▼                                            │
//!   ┌─────────────────────────────────────────────────────────────────────────┐
//!   │                       FileScheduler::run                                │
//!   │                                                                         │
//!   │   submit ──► PendingQueue ──► process_queue() ──► dispatch()            │
//!   │                                   ▲   │             │                   │
//!   │                                   │   │ optimize    │ JoinSet::spawn    │
//!   │                                   │   ▼ (extend)    ▼                   │
//!   │                        on_task_joined() ◄──── TaskExecutor::execute     │
//!   │                        (counters, sizes, completion handle)             │
//!   └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `process_queue()` runs after every submission and every completion. It
//! scans the queue front to back. A candidate that may be dispatched is
//! removed and spawned; a blocked must-run-alone candidate ends the scan; any
//! other blocked candidate is skipped so later, unrelated work can overtake it.
//!
//! Before the scan, when nothing is in flight, the queue is inspected for a
//! burst of appending writes. If there are more of them than may run at once
//! (or any at all in sloppy mode), the file is extended ahead of time so the
//! writes stop being size-changing and can run together.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{self, JoinError, JoinSet};

use crate::common::config::FileSchedulerConfig;
use crate::common::exception::{FileError, FileResult};
use crate::common::util::helpers::align_up;
use crate::storage::file::admission::{Admission, AdmissionPolicy, InFlight, OpClass};
use crate::storage::file::executor::TaskExecutor;
use crate::storage::file::lifecycle::{CloseRequest, Lifecycle, LifecycleState};
use crate::storage::file::metrics::SchedulerMetrics;
use crate::storage::file::operations::{
    CompletionSender, FileOperation, FileRequest, FileTask, OpKind, TaskOutput,
};
use crate::storage::file::queue::PendingQueue;
use crate::storage::file::size_state::{SizeSnapshot, SizeState, SloppySize, TruncatePlan};

/// Largest offset the kernel accepts for a positional call (`loff_t`).
const MAX_FILE_OFFSET: u64 = i64::MAX as u64;

/// Messages from file handles to the scheduler task.
#[derive(Debug)]
pub(crate) enum Command {
    Submit(FileOperation),
    Close(CompletionSender),
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
}

/// State published by the scheduler for synchronous readers.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) sizes: RwLock<SizeSnapshot>,
    pub(crate) metrics: SchedulerMetrics,
}

impl SharedState {
    pub(crate) fn new(initial_size: u64) -> Self {
        Self {
            sizes: RwLock::new(SizeSnapshot {
                committed: initial_size,
                logical: initial_size,
                allocated: initial_size,
            }),
            metrics: SchedulerMetrics::new(),
        }
    }
}

/// Consistent view of the scheduler at one point between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub state: LifecycleState,
    pub queued: usize,
    pub in_flight: InFlight,
    pub sizes: SizeSnapshot,
}

/// How a completed operation feeds the size tracker.
#[derive(Debug, Clone, Copy)]
enum SizeEffect {
    Read,
    Write { offset: u64 },
    Truncate { len: u64, plan: TruncatePlan },
    Materialize(Option<u64>),
    Stat,
}

enum Work {
    /// A caller's operation.
    Op {
        kind: OpKind,
        effect: SizeEffect,
        completion: CompletionSender,
    },
    /// Speculative extension issued by the optimizer.
    Extend { len: u64 },
    /// Final descriptor release.
    Release,
}

struct Dispatched {
    /// Counter occupied while running; `None` for the release, which runs
    /// after the counters are confirmed empty.
    class: Option<OpClass>,
    work: Work,
}

pub(crate) struct FileScheduler {
    policy: AdmissionPolicy,
    block_size: u64,
    queue: PendingQueue,
    in_flight: InFlight,
    sizes: SizeState,
    lifecycle: Lifecycle,
    executor: TaskExecutor,
    tasks: JoinSet<FileResult<TaskOutput>>,
    dispatched: HashMap<task::Id, Dispatched>,
    shared: Arc<SharedState>,
    /// Set after a failed extension so the next idle pass does not retry at once.
    skip_optimize: bool,
}

impl FileScheduler {
    /// Creates a scheduler for a file whose current length is `initial_size`.
    ///
    /// # Arguments
    /// * `executor` - Runs admitted tasks against the backend
    /// * `config` - Admission policy and size management settings
    /// * `initial_size` - Length of the file when it was opened
    /// * `shared` - Published sizes and metrics, read by the file handle
    pub(crate) fn new(
        executor: TaskExecutor,
        config: &FileSchedulerConfig,
        initial_size: u64,
        shared: Arc<SharedState>,
    ) -> (Self, watch::Receiver<LifecycleState>) {
        let block_size = u64::from(config.block_size.max(1));
        let sloppy = config.sloppy_size.then_some(SloppySize {
            hint: config.sloppy_size_hint,
        });
        let (lifecycle, observer) = Lifecycle::new();
        let scheduler = Self {
            policy: AdmissionPolicy::from_config(config),
            block_size,
            queue: PendingQueue::new(),
            in_flight: InFlight::default(),
            sizes: SizeState::new(initial_size, block_size, sloppy),
            lifecycle,
            executor,
            tasks: JoinSet::new(),
            dispatched: HashMap::new(),
            shared,
            skip_optimize: false,
        };
        (scheduler, observer)
    }

    /// Runs until every handle is gone and the file is closed.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut handles_alive = true;
        loop {
            if !handles_alive
                && self.tasks.is_empty()
                && self.lifecycle.state() == LifecycleState::Closed
            {
                break;
            }
            tokio::select! {
                command = commands.recv(), if handles_alive => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        handles_alive = false;
                        self.on_handles_dropped();
                    }
                },
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_task_joined(joined);
                }
                else => {
                    error!("scheduler stalled in {:?} with {} queued", self.lifecycle.state(), self.queue.len());
                    break;
                }
            }
        }
        debug!("file scheduler stopped");
    }

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(operation) => self.submit(operation),
            Command::Close(waiter) => self.close(Some(waiter)),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
        self.publish();
    }

    pub(crate) fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            state: self.lifecycle.state(),
            queued: self.queue.len(),
            in_flight: self.in_flight,
            sizes: self.sizes.snapshot(),
        }
    }

    fn publish(&self) {
        *self.shared.sizes.write() = self.sizes.snapshot();
    }

    fn submit(&mut self, mut operation: FileOperation) {
        if !self.lifecycle.state().accepts_submissions() {
            self.shared.metrics.record_rejected();
            operation.complete(Err(FileError::Closed));
            return;
        }

        match operation.kind() {
            OpKind::Read => {
                let logical = self.sizes.logical();
                if operation.offset >= logical {
                    // Nothing to read; answered without entering the queue.
                    trace!("read at {} past logical size {}", operation.offset, logical);
                    self.shared.metrics.record_completed();
                    let FileOperation {
                        request,
                        completion,
                        ..
                    } = operation;
                    let _ = completion.send(Ok(empty_read(request)));
                    return;
                }
                let readable = align_up(logical, self.block_size) - operation.offset;
                let exact = logical - operation.offset;
                match &mut operation.request {
                    FileRequest::Read { limit, .. } | FileRequest::ReadVectored { limit, .. } => {
                        *limit = (*limit).min(usize::try_from(readable).unwrap_or(usize::MAX));
                    }
                    FileRequest::ReadBulk { range } => {
                        *range = (*range).min(usize::try_from(exact).unwrap_or(usize::MAX));
                    }
                    _ => {}
                }
            }
            OpKind::Write | OpKind::Truncate if !within_file_limits(operation.offset, operation.len) => {
                debug!(
                    "{:?} at {} + {} exceeds the largest file offset",
                    operation.kind(),
                    operation.offset,
                    operation.len
                );
                self.shared.metrics.record_failed();
                operation.complete(Err(io::Error::from_raw_os_error(libc::EINVAL).into()));
                return;
            }
            OpKind::Write => self.sizes.reserve_write(operation.offset, operation.len),
            _ => {}
        }

        self.shared.metrics.record_submitted();
        let id = self.queue.push(operation);
        trace!("queued operation {} ({} pending)", id, self.queue.len());
        self.process_queue();
    }

    fn close(&mut self, waiter: Option<CompletionSender>) {
        match self.lifecycle.request_close(waiter) {
            (CloseRequest::Started, _) => {
                debug!(
                    "closing file: {} queued, {} in flight",
                    self.queue.len(),
                    self.in_flight.total()
                );
                self.process_queue();
            }
            (CloseRequest::InProgress, _) => {}
            (CloseRequest::AlreadyClosed, waiter) => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(TaskOutput::Done));
                }
            }
        }
    }

    fn on_handles_dropped(&mut self) {
        if self.lifecycle.state() == LifecycleState::Open {
            warn!("append-challenged file dropped without close(), closing implicitly");
            self.close(None);
        }
    }

    /// Scans the queue and dispatches everything currently admissible.
    pub(crate) fn process_queue(&mut self) {
        self.optimize_queue();

        let mut index = 0;
        while let Some(candidate) = self.queue.get(index) {
            if self.in_flight.exclusive {
                break;
            }
            let admission = self.policy.classify(
                candidate.kind(),
                candidate.offset,
                candidate.len,
                self.sizes.allocated(),
            );
            if self.policy.may_dispatch(admission, &self.in_flight) {
                if let Some(operation) = self.queue.remove(index) {
                    self.dispatch(operation, admission);
                }
            } else if admission.must_run_alone {
                break;
            } else {
                index += 1;
            }
        }

        self.maybe_begin_closing();
    }

    /// Extends the file ahead of a burst of appending writes.
    fn optimize_queue(&mut self) {
        if !self.in_flight.is_idle() || std::mem::take(&mut self.skip_optimize) {
            return;
        }

        let allocated = self.sizes.allocated();
        let mut appending = 0u32;
        let mut max_end = allocated;
        for operation in self.queue.iter() {
            let admission =
                self.policy
                    .classify(operation.kind(), operation.offset, operation.len, allocated);
            if admission.must_run_alone {
                break;
            }
            if operation.kind() == OpKind::Write && admission.size_changing {
                appending += 1;
                max_end = max_end.max(operation.offset.saturating_add(operation.len));
            }
        }

        let worthwhile = appending > self.policy.max_size_changing_ops
            || (appending > 0 && self.sizes.is_sloppy());
        if !worthwhile {
            return;
        }
        if let Some(len) = self.sizes.extension_target(max_end) {
            debug!(
                "extending file from {} to {} ahead of {} appending writes",
                allocated, len, appending
            );
            self.in_flight.begin(OpClass::Exclusive);
            self.spawn(
                FileTask::Truncate { len },
                Dispatched {
                    class: Some(OpClass::Exclusive),
                    work: Work::Extend { len },
                },
            );
        }
    }

    fn dispatch(&mut self, operation: FileOperation, admission: Admission) {
        let class = admission.class();
        let FileOperation {
            id,
            offset,
            request,
            completion,
            submitted_at,
            ..
        } = operation;
        let kind = request.kind();

        let (task, effect) = match request {
            FileRequest::Read { buf, limit } => (FileTask::Read { offset, buf, limit }, SizeEffect::Read),
            FileRequest::ReadVectored { bufs, limit } => (
                FileTask::ReadVectored {
                    offset,
                    bufs,
                    limit,
                },
                SizeEffect::Read,
            ),
            FileRequest::ReadBulk { range } => (FileTask::ReadBulk { offset, range }, SizeEffect::Read),
            FileRequest::Write { data } => (FileTask::Write { offset, data }, SizeEffect::Write { offset }),
            FileRequest::WriteVectored { bufs } => (
                FileTask::WriteVectored { offset, bufs },
                SizeEffect::Write { offset },
            ),
            FileRequest::Truncate { len } => match self.sizes.plan_truncate(len) {
                TruncatePlan::Elide => {
                    debug!("truncate {} to {} elided", id, len);
                    let reserved = self.queued_write_end();
                    self.sizes.apply_truncate(len, TruncatePlan::Elide, reserved);
                    self.shared.metrics.record_elided_truncate();
                    self.shared.metrics.record_completed();
                    self.publish();
                    let _ = completion.send(Ok(TaskOutput::Done));
                    return;
                }
                plan @ TruncatePlan::Resize(physical) => (
                    FileTask::Truncate { len: physical },
                    SizeEffect::Truncate { len, plan },
                ),
            },
            FileRequest::Flush => {
                let materialize = if class == OpClass::Exclusive {
                    self.sizes.materialize_target()
                } else {
                    None
                };
                (FileTask::Sync { materialize }, SizeEffect::Materialize(materialize))
            }
            FileRequest::Stat => (FileTask::Stat, SizeEffect::Stat),
        };

        self.in_flight.begin(class);
        self.shared
            .metrics
            .record_dispatch(&self.in_flight, submitted_at.elapsed());
        trace!("dispatching operation {} as {:?}: {:?}", id, class, task);
        self.spawn(
            task,
            Dispatched {
                class: Some(class),
                work: Work::Op {
                    kind,
                    effect,
                    completion,
                },
            },
        );
    }

    /// Furthest end of the writes still waiting in the queue. A truncate runs
    /// alone, so when it finishes these are the only writes not yet applied.
    fn queued_write_end(&self) -> u64 {
        self.queue
            .iter()
            .filter(|operation| operation.kind() == OpKind::Write && operation.len > 0)
            .map(|operation| operation.offset.saturating_add(operation.len))
            .max()
            .unwrap_or(0)
    }

    fn spawn(&mut self, task: FileTask, dispatched: Dispatched) {
        let executor = self.executor.clone();
        let handle = self.tasks.spawn(async move { executor.execute(task).await });
        self.dispatched.insert(handle.id(), dispatched);
    }

    fn maybe_begin_closing(&mut self) {
        if !self
            .lifecycle
            .may_begin_closing(self.queue.is_empty(), &self.in_flight)
        {
            return;
        }
        self.lifecycle.begin_closing();
        let materialize = self.sizes.materialize_target();
        self.spawn(
            FileTask::Release { materialize },
            Dispatched {
                class: None,
                work: Work::Release,
            },
        );
    }

    /// Handles one finished task: counters, sizes, completion handle, then
    /// another pass over the queue.
    pub(crate) fn on_task_joined(
        &mut self,
        joined: Result<(task::Id, FileResult<TaskOutput>), JoinError>,
    ) {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(join_error) => {
                let id = join_error.id();
                (
                    id,
                    Err(FileError::Internal(format!("I/O task failed: {}", join_error))),
                )
            }
        };
        let Some(dispatched) = self.dispatched.remove(&id) else {
            error!("completion for unknown task {}", id);
            return;
        };
        if let Some(class) = dispatched.class {
            self.in_flight.finish(class);
        }

        let mut replies: Vec<(CompletionSender, FileResult<TaskOutput>)> = Vec::new();
        match dispatched.work {
            Work::Op {
                kind,
                effect,
                completion,
            } => {
                let result = self.settle(effect, result);
                match &result {
                    Ok(_) => self.shared.metrics.record_completed(),
                    Err(e) => {
                        debug!("{:?} failed: {}", kind, e);
                        self.shared.metrics.record_failed();
                    }
                }
                replies.push((completion, result));
            }
            Work::Extend { len } => match result {
                Ok(_) => {
                    self.sizes.apply_extension(len);
                    self.shared.metrics.record_speculative_extension();
                }
                Err(e) => {
                    warn!("speculative extension to {} failed: {}", len, e);
                    self.skip_optimize = true;
                }
            },
            Work::Release => {
                if let Err(e) = &result {
                    warn!("releasing descriptor failed: {}", e);
                }
                for waiter in self.lifecycle.finish_closing() {
                    let reply = match &result {
                        Ok(_) => Ok(TaskOutput::Done),
                        Err(e) => Err(e.duplicate()),
                    };
                    replies.push((waiter, reply));
                }
            }
        }

        // Sizes are published before anyone is woken up.
        self.publish();
        for (sender, reply) in replies {
            let _ = sender.send(reply);
        }
        self.process_queue();
        self.publish();
    }

    /// Applies a completion to the size tracker and adjusts the output.
    fn settle(
        &mut self,
        effect: SizeEffect,
        result: FileResult<TaskOutput>,
    ) -> FileResult<TaskOutput> {
        let output = result?;
        match (effect, output) {
            (SizeEffect::Write { offset }, TaskOutput::Written(bytes)) => {
                self.sizes.commit_write(offset, bytes);
                self.shared.metrics.record_bytes_written(bytes as u64);
                Ok(TaskOutput::Written(bytes))
            }
            (SizeEffect::Truncate { len, plan }, output) => {
                let reserved = self.queued_write_end();
                self.sizes.apply_truncate(len, plan, reserved);
                Ok(output)
            }
            (SizeEffect::Materialize(Some(len)), output) => {
                self.sizes.apply_materialize(len);
                Ok(output)
            }
            (SizeEffect::Stat, TaskOutput::Stat(mut stat)) => {
                stat.size = self.sizes.logical();
                Ok(TaskOutput::Stat(stat))
            }
            (SizeEffect::Read, output) => {
                let bytes = match &output {
                    TaskOutput::Read { bytes, .. } | TaskOutput::ReadVectored { bytes, .. } => *bytes,
                    TaskOutput::Bulk(data) => data.len(),
                    _ => 0,
                };
                self.shared.metrics.record_bytes_read(bytes as u64);
                Ok(output)
            }
            (SizeEffect::Materialize(None), output) => Ok(output),
            (effect, output) => Err(FileError::Internal(format!(
                "{:?} cannot settle {:?}",
                effect, output
            ))),
        }
    }
}

fn within_file_limits(offset: u64, len: u64) -> bool {
    offset
        .checked_add(len)
        .is_some_and(|end| end <= MAX_FILE_OFFSET)
}

/// Result of a read that starts at or past the logical size.
fn empty_read(request: FileRequest) -> TaskOutput {
    match request {
        FileRequest::Read { buf, .. } => TaskOutput::Read { bytes: 0, buf },
        FileRequest::ReadVectored { bufs, .. } => TaskOutput::ReadVectored { bytes: 0, bufs },
        _ => TaskOutput::Bulk(Vec::new()),
    }
}
