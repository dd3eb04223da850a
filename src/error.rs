//! Error types for rangefile
//!
//! Two layers: [`TransportError`] is what a backend reports for a single
//! request, and [`Error`] is what the streaming engine surfaces to callers
//! once retries and out-of-range recovery have had their say.

use std::fmt;
use std::io;

use thiserror::Error;

/// Failure of a single request against a remote store.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The object (or upload) does not exist
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// The requested range starts at or beyond the end of the object
    #[error("requested range not satisfiable (actual size: {actual_size:?})")]
    OutOfRange { actual_size: Option<u64> },

    /// Timeouts, resets and other failures worth another attempt
    #[error("transient transport failure: {message}")]
    Transient { message: String },

    /// Anything the store rejected for good
    #[error("transport failure: {message}")]
    Fatal { message: String },
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        TransportError::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        TransportError::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }

    /// Classify an I/O error raised while talking to a store or reading a body.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TransportError::NotFound {
                key: err.to_string(),
            },
            io::ErrorKind::PermissionDenied
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::Unsupported => TransportError::fatal(err.to_string()),
            _ => TransportError::transient(err.to_string()),
        }
    }
}

/// State of a write session, reported in [`Error::UploadState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Open,
    Closed,
    Aborted,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteState::Open => "open",
            WriteState::Closed => "closed",
            WriteState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Primary error type for all rangefile operations
#[derive(Debug, Error)]
pub enum Error {
    /// Object not found in storage
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// A retryable operation kept failing until the attempt ceiling
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// A non-retryable transport failure
    #[error("{operation} failed: {source}")]
    Transport {
        operation: String,
        #[source]
        source: TransportError,
    },

    /// Invalid writer state transition
    #[error("cannot {operation}: upload is {state}{}", detail_suffix(.detail))]
    UploadState {
        operation: &'static str,
        state: WriteState,
        detail: Option<String>,
    },

    /// Invalid buffer, part or retry configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(io::Error),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(" ({detail})"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn upload_state(operation: &'static str, state: WriteState) -> Self {
        Error::UploadState {
            operation,
            state,
            detail: None,
        }
    }
}

// Errors that crossed a `std::io` boundary come back as themselves.
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(inner)) => Error::Io(io::Error::new(kind, inner)),
            None => Error::Io(kind.into()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::NotFound { .. } => io::Error::new(io::ErrorKind::NotFound, err),
            Error::Configuration(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::UploadState { .. } => io::Error::other(err),
            Error::RetriesExhausted { .. } | Error::Transport { .. } => io::Error::other(err),
        }
    }
}

/// Result type alias for rangefile operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(TransportError::transient("reset").is_retryable());
        assert!(!TransportError::fatal("forbidden").is_retryable());
        assert!(!TransportError::OutOfRange { actual_size: None }.is_retryable());
        assert!(!TransportError::NotFound { key: "k".into() }.is_retryable());
    }

    #[test]
    fn test_io_classification() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(TransportError::from_io(reset).is_retryable());

        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            TransportError::from_io(missing),
            TransportError::NotFound { .. }
        ));
    }

    #[test]
    fn test_not_found_maps_to_io_kind() {
        let err: io::Error = Error::NotFound { key: "a/b".into() }.into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_round_trip_through_io_keeps_variant() {
        let err: io::Error = Error::Configuration("bad".into()).into();
        assert!(matches!(Error::from(err), Error::Configuration(_)));

        let plain = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(Error::from(plain), Error::Io(_)));
    }

    #[test]
    fn test_upload_state_message() {
        let err = Error::UploadState {
            operation: "write",
            state: WriteState::Open,
            detail: Some("part #3 failed".into()),
        };
        assert_eq!(
            err.to_string(),
            "cannot write: upload is open (part #3 failed)"
        );
    }
}
