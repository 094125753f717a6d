//! Configuration for append-challenged files.
//!
//! The scheduler policy mirrors the locking rules of the underlying
//! filesystem. On XFS a write that moves end-of-file is blocked by every other
//! outstanding AIO on the same file, and `ftruncate()` blocks and is blocked
//! by AIO as well, so the defaults allow a single size-changing operation and
//! treat `fsync` as exclusive.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::exception::{FileError, FileResult};

pub const DEFAULT_BLOCK_SIZE: u32 = 4096; // logical block size in bytes
pub const DEFAULT_MAX_SIZE_CHANGING_OPS: u32 = 1;
pub const DEFAULT_SLOPPY_SIZE_HINT: u64 = 1 << 20; // 1 MiB

/// Device identifier of the filesystem holding the file (`st_dev`).
pub type DeviceId = u64;

/// Scheduler policy for one append-challenged file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSchedulerConfig {
    /// Maximum number of size-changing operations in flight at once.
    pub max_size_changing_ops: u32,

    /// Whether `fsync` locks the whole file on this filesystem.
    pub flush_is_exclusive: bool,

    /// Trade allocated space for fewer serializing truncate calls.
    pub sloppy_size: bool,

    /// Physical size granularity used in sloppy mode.
    pub sloppy_size_hint: u64,

    /// Logical block size; reads are clamped to it at end-of-file.
    pub block_size: u32,
}

impl Default for FileSchedulerConfig {
    fn default() -> Self {
        Self {
            max_size_changing_ops: DEFAULT_MAX_SIZE_CHANGING_OPS,
            flush_is_exclusive: true,
            sloppy_size: false,
            sloppy_size_hint: DEFAULT_SLOPPY_SIZE_HINT,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl FileSchedulerConfig {
    /// Loads a configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> FileResult<Self> {
        let contents = fs::read_to_string(path)?;
        let config: FileSchedulerConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FileResult<()> {
        if self.max_size_changing_ops == 0 {
            return Err(FileError::InvalidConfig(
                "max_size_changing_ops must be at least 1".to_string(),
            ));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(FileError::InvalidConfig(format!(
                "block_size must be a power of two, got {}",
                self.block_size
            )));
        }
        if self.sloppy_size && self.sloppy_size_hint == 0 {
            return Err(FileError::InvalidConfig(
                "sloppy_size_hint must be non-zero when sloppy_size is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_size_changing_ops(mut self, max: u32) -> Self {
        self.max_size_changing_ops = max;
        self
    }

    pub fn with_flush_exclusive(mut self, exclusive: bool) -> Self {
        self.flush_is_exclusive = exclusive;
        self
    }

    pub fn with_sloppy_size(mut self, hint: u64) -> Self {
        self.sloppy_size = true;
        self.sloppy_size_hint = hint;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }
}

/// Flags the descriptor was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    pub fn create_read_write() -> Self {
        Self {
            create: true,
            ..Self::read_write()
        }
    }

    pub fn to_open_options(self) -> fs::OpenOptions {
        let mut options = fs::OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .truncate(self.truncate);
        if self.exclusive {
            options.create_new(true);
        } else {
            options.create(self.create);
        }
        options
    }
}
