use thiserror::Error;

/// Outcome of every storage operation.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Discrete code carried by injected faults from the memory backend.
pub const SIMULATED_CODE: &str = "SIMULATED";
pub const NOT_FOUND_CODE: &str = "NOT_FOUND";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("invalid object name: {0}")]
    InvalidName(String),

    #[error("invalid byte range {start}..={end} for object of {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Simulated {operation} error")]
    Simulated { operation: &'static str },

    #[error("transient error ({code}): {message}")]
    Transient { code: String, message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("upload of {0} was acknowledged but the object is not visible")]
    UploadNotVisible(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Discrete code consulted by the retry classifier.
    pub fn code(&self) -> Option<&str> {
        match self {
            StorageError::Simulated { .. } => Some(SIMULATED_CODE),
            StorageError::NotFound(_) => Some(NOT_FOUND_CODE),
            StorageError::Transient { code, .. } => Some(code),
            StorageError::Io(err) => Some(io_kind_code(err.kind())),
            _ => None,
        }
    }

    /// HTTP-style status, when the failure came from a remote endpoint.
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::Http { status, .. } => Some(*status),
            StorageError::NotFound(_) => Some(404),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub(crate) fn io_kind_code(kind: std::io::ErrorKind) -> &'static str {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::NotFound => "NotFound",
        ErrorKind::PermissionDenied => "PermissionDenied",
        ErrorKind::ConnectionRefused => "ConnectionRefused",
        ErrorKind::ConnectionReset => "ConnectionReset",
        ErrorKind::ConnectionAborted => "ConnectionAborted",
        ErrorKind::NotConnected => "NotConnected",
        ErrorKind::BrokenPipe => "BrokenPipe",
        ErrorKind::AlreadyExists => "AlreadyExists",
        ErrorKind::WouldBlock => "WouldBlock",
        ErrorKind::InvalidInput => "InvalidInput",
        ErrorKind::InvalidData => "InvalidData",
        ErrorKind::TimedOut => "TimedOut",
        ErrorKind::WriteZero => "WriteZero",
        ErrorKind::Interrupted => "Interrupted",
        ErrorKind::UnexpectedEof => "UnexpectedEof",
        ErrorKind::OutOfMemory => "OutOfMemory",
        _ => "Other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_object() {
        let err = StorageError::NotFound("doc-1".into());
        assert_eq!(err.to_string(), "Object not found: doc-1");
        assert!(err.is_not_found());
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn simulated_errors_are_distinguishable() {
        let err = StorageError::Simulated {
            operation: "upload",
        };
        assert_eq!(err.to_string(), "Simulated upload error");
        assert_eq!(err.code(), Some(SIMULATED_CODE));
    }

    #[test]
    fn io_errors_expose_their_kind_as_code() {
        let err = StorageError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(err.code(), Some("ConnectionReset"));
    }
}
