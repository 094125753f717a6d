//! File-size bookkeeping.
//!
//! Four sizes are tracked for an append-challenged file:
//!
//! | Size             | Meaning                                                   |
//! |------------------|-----------------------------------------------------------|
//! | `logical`        | size reported to callers; raised when a write is queued   |
//! | `committed`      | size confirmed by completed writes and truncates          |
//! | `allocated`      | physical length the kernel sees (speculative extension)   |
//! | `written_extent` | end of the furthest byte written with data                |
//!
//! Invariants: `logical >= committed`, `allocated >= committed`. Completions
//! only move `committed` forward through a maximum, so out-of-order write
//! completions cannot regress it. A completed truncate runs alone and rebases
//! both sizes to the requested length, except that `logical` keeps covering
//! writes queued behind the truncate, whose reservations are still owed.
//!
//! Bytes in `[written_extent, allocated)` are known to be zero, which is what
//! lets a sloppy truncate be elided without exposing stale data.

use crate::common::util::helpers::align_up;

/// How an admitted truncate is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncatePlan {
    /// Set the physical length to the given value.
    Resize(u64),
    /// The physical file already satisfies the request; no kernel call.
    Elide,
}

/// Sloppy-size policy: physical sizes are kept on `hint` boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SloppySize {
    pub hint: u64,
}

/// Point-in-time copy of the sizes, safe to publish to other threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeSnapshot {
    pub committed: u64,
    pub logical: u64,
    pub allocated: u64,
}

#[derive(Debug, Clone)]
pub struct SizeState {
    committed: u64,
    logical: u64,
    allocated: u64,
    written_extent: u64,
    block_size: u64,
    sloppy: Option<SloppySize>,
}

impl SizeState {
    /// Starts tracking a file whose current length is `initial_size`.
    pub fn new(initial_size: u64, block_size: u64, sloppy: Option<SloppySize>) -> Self {
        let sloppy = sloppy.map(|s| SloppySize {
            hint: align_up(s.hint.max(1), block_size),
        });
        Self {
            committed: initial_size,
            logical: initial_size,
            allocated: initial_size,
            written_extent: initial_size,
            block_size,
            sloppy,
        }
    }

    pub fn logical(&self) -> u64 {
        self.logical
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn written_extent(&self) -> u64 {
        self.written_extent
    }

    pub fn is_sloppy(&self) -> bool {
        self.sloppy.is_some()
    }

    pub fn snapshot(&self) -> SizeSnapshot {
        SizeSnapshot {
            committed: self.committed,
            logical: self.logical,
            allocated: self.allocated,
        }
    }

    /// Called when a write enters the queue, ahead of its dispatch.
    pub fn reserve_write(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.logical = self.logical.max(offset.saturating_add(len));
    }

    /// Monotonic commit: never moves a size backwards.
    pub fn commit_size(&mut self, size: u64) {
        self.committed = self.committed.max(size);
        self.logical = self.logical.max(size);
        self.allocated = self.allocated.max(size);
    }

    /// Records a completed write of `written` bytes at `offset`.
    pub fn commit_write(&mut self, offset: u64, written: usize) {
        if written == 0 {
            return;
        }
        let end = offset.saturating_add(written as u64);
        self.written_extent = self.written_extent.max(end);
        self.commit_size(end);
    }

    /// Target length for a speculative extension covering writes up to
    /// `max_end`, or `None` when no extension is warranted.
    pub fn extension_target(&self, max_end: u64) -> Option<u64> {
        let mut target = max_end;
        if let Some(sloppy) = self.sloppy {
            if self.committed == 0 {
                target = target.max(sloppy.hint);
            } else if target < self.committed.saturating_mul(2) {
                target = self.committed.saturating_mul(2);
            }
        }
        let target = align_up(target, self.block_size);
        (target > self.allocated).then_some(target)
    }

    /// Records a completed speculative extension.
    pub fn apply_extension(&mut self, len: u64) {
        self.allocated = self.allocated.max(len);
    }

    /// Decides how a truncate to `len` is issued. Only called for an admitted
    /// truncate, which runs alone.
    pub fn plan_truncate(&self, len: u64) -> TruncatePlan {
        let Some(sloppy) = self.sloppy else {
            return TruncatePlan::Resize(len);
        };
        let rounded = align_up(len, sloppy.hint);
        if len >= self.written_extent && len <= self.allocated && self.allocated <= rounded {
            return TruncatePlan::Elide;
        }
        if len < self.written_extent {
            // Data past `len` must be discarded by the kernel.
            TruncatePlan::Resize(len)
        } else {
            TruncatePlan::Resize(rounded)
        }
    }

    /// Records a completed truncate. `committed` takes the requested length;
    /// `logical` takes it too, but never drops below `reserved_end`, the
    /// furthest end of the writes still waiting in the queue.
    pub fn apply_truncate(&mut self, len: u64, plan: TruncatePlan, reserved_end: u64) {
        self.committed = len;
        self.logical = len.max(reserved_end);
        self.written_extent = self.written_extent.min(len);
        if let TruncatePlan::Resize(physical) = plan {
            self.allocated = physical;
        }
        debug_assert!(self.allocated >= self.committed);
    }

    /// Physical length to restore before a flush or close, if it drifted
    /// from the logical size.
    pub fn materialize_target(&self) -> Option<u64> {
        (self.allocated != self.logical).then_some(self.logical)
    }

    /// Records that the physical length was set to `len`.
    pub fn apply_materialize(&mut self, len: u64) {
        self.allocated = len;
        self.written_extent = self.written_extent.min(len);
        self.committed = self.committed.max(len);
    }
}
