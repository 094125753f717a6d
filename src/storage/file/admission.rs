//! Admission classifier and in-flight counters.
//!
//! The rules mirror the filesystem's own locking. Any operation that moves
//! end-of-file contends with other size changes, which gives one axis of
//! exclusivity (size-changing vs. size-changing, bounded by
//! `max_size_changing_ops`). Truncates, and flushes on filesystems where
//! `fsync` locks the whole file, contend with everything, which gives the
//! second axis (exclusive vs. everything).
//!
//! ```text
//!   candidate class      dispatchable when
//!   ─────────────────    ───────────────────────────────────────────────
//!   Exclusive            nothing in flight at all
//!   SizeChanging         size_changing < max  and no exclusive running
//!   Ordinary             no exclusive running
//! ```

use crate::common::config::FileSchedulerConfig;
use crate::storage::file::operations::OpKind;

/// Static admission policy of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub max_size_changing_ops: u32,
    pub flush_is_exclusive: bool,
    pub sloppy_size: bool,
}

impl AdmissionPolicy {
    pub fn from_config(config: &FileSchedulerConfig) -> Self {
        Self {
            max_size_changing_ops: config.max_size_changing_ops.max(1),
            flush_is_exclusive: config.flush_is_exclusive,
            sloppy_size: config.sloppy_size,
        }
    }

    /// Classifies an operation against the current physical end-of-file.
    pub fn classify(&self, kind: OpKind, offset: u64, len: u64, eof: u64) -> Admission {
        let must_run_alone = match kind {
            OpKind::Truncate | OpKind::Extend => true,
            // A sloppy flush may truncate the file back to its logical size.
            OpKind::Flush => self.flush_is_exclusive || self.sloppy_size,
            OpKind::Read | OpKind::Write | OpKind::Stat => false,
        };
        let size_changing = match kind {
            OpKind::Write => len > 0 && offset.saturating_add(len) > eof,
            OpKind::Truncate | OpKind::Extend => true,
            OpKind::Read | OpKind::Flush | OpKind::Stat => false,
        };
        Admission {
            size_changing,
            must_run_alone,
        }
    }

    pub fn may_dispatch(&self, admission: Admission, in_flight: &InFlight) -> bool {
        if in_flight.exclusive {
            return false;
        }
        if admission.must_run_alone {
            in_flight.size_changing == 0 && in_flight.non_size_changing == 0
        } else if admission.size_changing {
            in_flight.size_changing < self.max_size_changing_ops
        } else {
            true
        }
    }
}

/// Classification of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub size_changing: bool,
    pub must_run_alone: bool,
}

impl Admission {
    pub fn class(&self) -> OpClass {
        if self.must_run_alone {
            OpClass::Exclusive
        } else if self.size_changing {
            OpClass::SizeChanging
        } else {
            OpClass::Ordinary
        }
    }
}

/// Which in-flight counter an admitted operation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Ordinary,
    SizeChanging,
    Exclusive,
}

/// Counters of currently executing operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InFlight {
    pub non_size_changing: u32,
    pub size_changing: u32,
    pub exclusive: bool,
}

impl InFlight {
    pub fn begin(&mut self, class: OpClass) {
        match class {
            OpClass::Ordinary => self.non_size_changing += 1,
            OpClass::SizeChanging => self.size_changing += 1,
            OpClass::Exclusive => {
                debug_assert!(self.is_idle(), "exclusive admitted while busy: {:?}", self);
                self.exclusive = true;
            }
        }
    }

    pub fn finish(&mut self, class: OpClass) {
        match class {
            OpClass::Ordinary => {
                debug_assert!(self.non_size_changing > 0, "non-size-changing counter underflow");
                self.non_size_changing = self.non_size_changing.saturating_sub(1);
            }
            OpClass::SizeChanging => {
                debug_assert!(self.size_changing > 0, "size-changing counter underflow");
                self.size_changing = self.size_changing.saturating_sub(1);
            }
            OpClass::Exclusive => {
                debug_assert!(self.exclusive, "exclusive flag cleared twice");
                self.exclusive = false;
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.non_size_changing == 0 && self.size_changing == 0 && !self.exclusive
    }

    pub fn total(&self) -> u32 {
        self.non_size_changing + self.size_changing + u32::from(self.exclusive)
    }
}
