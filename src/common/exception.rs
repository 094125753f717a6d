use thiserror::Error;

/// Errors surfaced through the completion handle of a file operation.
///
/// Failures are local to the operation that produced them: an error on one
/// handle never fails, blocks or cancels its siblings.
#[derive(Error, Debug)]
pub enum FileError {
    /// Error reported by the operating system, propagated verbatim.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file object is draining or closed and no longer accepts work.
    #[error("file is closed or closing")]
    Closed,

    /// The submission never reached the scheduler, so it was never queued.
    #[error("scheduler is no longer running")]
    SchedulerStopped,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A broken internal invariant. Never expected at runtime.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type FileResult<T> = Result<T, FileError>;

impl FileError {
    /// Raw OS error code, when the failure came from the kernel.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            FileError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, FileError::Closed | FileError::SchedulerStopped)
    }

    /// Copy of the error for a second receiver. OS errors keep their code.
    pub fn duplicate(&self) -> FileError {
        match self {
            FileError::Io(err) => FileError::Io(match err.raw_os_error() {
                Some(code) => std::io::Error::from_raw_os_error(code),
                None => std::io::Error::new(err.kind(), err.to_string()),
            }),
            FileError::Closed => FileError::Closed,
            FileError::SchedulerStopped => FileError::SchedulerStopped,
            FileError::InvalidConfig(msg) => FileError::InvalidConfig(msg.clone()),
            FileError::ConfigParse(err) => FileError::InvalidConfig(err.to_string()),
            FileError::Internal(msg) => FileError::Internal(msg.clone()),
        }
    }
}
