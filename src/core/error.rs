use std::io::{self, ErrorKind};
use std::path::PathBuf;

use thiserror::Error;

/// Fatal job errors. Anything that reaches the controller as a `JobError`
/// ends the run in the `Failed` state.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("lost access to source {path}: {source}")]
    SourceLost {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no destinations left")]
    NoDestinations,

    #[error("no destination accepted the report")]
    ReportUnwritable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn source_lost(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::SourceLost {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("worker task failed: {}", e))
    }
}

/// Errors raised by a single sink. These never abort the job on their own;
/// the sink is dropped from the live set instead.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The destination disappeared (unmounted, device removed).
    #[error("destination gone: {0}")]
    Gone(#[source] io::Error),

    #[error("i/o error: {0}")]
    Io(#[source] io::Error),

    #[error("container error: {0}")]
    Container(String),
}

impl SinkError {
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        if is_device_removed_error(&e) {
            Self::Gone(e)
        } else {
            Self::Io(e)
        }
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        Self::Container(format!("index: {}", e))
    }
}

/// Whether `error` means the destination itself went away (unplugged,
/// unmounted, medium pulled) rather than a single operation failing.
pub fn is_device_removed_error(error: &io::Error) -> bool {
    const GONE_ERRNOS: [i32; 5] = [
        libc::EIO,
        libc::ENODEV,
        libc::ENXIO,
        libc::ENOMEDIUM,
        libc::EMEDIUMTYPE,
    ];

    matches!(
        error.kind(),
        ErrorKind::NotFound
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    ) || error
        .raw_os_error()
        .is_some_and(|errno| GONE_ERRNOS.contains(&errno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_device_removed_error_eio() {
        let error = io::Error::from_raw_os_error(libc::EIO);
        assert!(is_device_removed_error(&error));
    }

    #[test]
    fn test_is_device_removed_error_enodev() {
        let error = io::Error::from_raw_os_error(libc::ENODEV);
        assert!(is_device_removed_error(&error));
    }

    #[test]
    fn test_is_device_removed_error_permission_denied() {
        let error = io::Error::new(ErrorKind::PermissionDenied, "permission denied");
        assert!(!is_device_removed_error(&error));
    }

    #[test]
    fn test_sink_error_classification() {
        let gone: SinkError = io::Error::from_raw_os_error(libc::ENXIO).into();
        assert!(gone.is_gone());

        let full: SinkError = io::Error::from_raw_os_error(libc::ENOSPC).into();
        assert!(!full.is_gone());
    }
}
