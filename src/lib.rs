pub mod common;
pub mod storage;

pub use common::config::{FileSchedulerConfig, OpenFlags};
pub use common::exception::{FileError, FileResult};
pub use storage::file::AppendChallengedFile;
