//! Error types shared by the Pie framing, session and discovery layers.

use thiserror::Error;

/// Result alias for Pie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pie protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Deadline elapsed while waiting for I/O
    #[error("operation timed out")]
    TimedOut,

    /// Peer ended the stream or session
    #[error("connection closed: {0}")]
    Closed(String),

    /// Caller-initiated cancellation
    #[error("operation canceled")]
    Canceled,

    /// Frame length exceeds the limit
    #[error("message too long: {len} bytes (max {max})")]
    MessageTooLong {
        /// Offending length
        len: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Malformed length prefix or payload decode failure
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Identity handshake verification failure
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    /// Empty candidate address list
    #[error("no available address")]
    NoAddress,

    /// Configuration rejected before any I/O
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Uncategorized transport failure
    #[error("{0}")]
    Unknown(String),
}

/// Stable numeric error codes handed to embedding layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error
    None = 0,
    /// Uncategorized failure
    Unknown = 1,
    /// Deadline elapsed
    TimedOut = 2,
    /// Stream or session closed
    Closed = 3,
    /// Frame too long
    MessageTooLong = 4,
    /// Cancelled by caller
    Canceled = 5,
}

impl Error {
    /// Numeric code for this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TimedOut => ErrorCode::TimedOut,
            Self::Closed(_) => ErrorCode::Closed,
            Self::Canceled => ErrorCode::Canceled,
            Self::MessageTooLong { .. } => ErrorCode::MessageTooLong,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => ErrorCode::TimedOut,
                std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => ErrorCode::Closed,
                _ => ErrorCode::Unknown,
            },
            _ => ErrorCode::Unknown,
        }
    }

    /// Returns true for outcomes that occur during routine polling
    ///
    /// Timeouts, cancellation and closure are part of normal operation and
    /// are not logged by accept/receive loops.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::TimedOut | ErrorCode::Canceled | ErrorCode::Closed
        )
    }

    /// Convert an I/O error, folding end-of-stream kinds into [`Error::Closed`]
    #[must_use]
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => Self::Closed(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::TimedOut,
            _ => Self::Io(err),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::TimedOut.code(), ErrorCode::TimedOut);
        assert_eq!(Error::Closed("eof".into()).code(), ErrorCode::Closed);
        assert_eq!(Error::Canceled.code(), ErrorCode::Canceled);
        assert_eq!(
            Error::MessageTooLong { len: 10, max: 5 }.code(),
            ErrorCode::MessageTooLong
        );
        assert_eq!(Error::NoAddress.code(), ErrorCode::Unknown);
        assert_eq!(ErrorCode::Canceled as i32, 5);
    }

    #[test]
    fn test_expected_errors() {
        assert!(Error::TimedOut.is_expected());
        assert!(Error::Canceled.is_expected());
        assert!(Error::Closed("reset".into()).is_expected());
        assert!(!Error::InvalidMessage("bad varint".into()).is_expected());
        assert!(!Error::SignatureInvalid("mismatch".into()).is_expected());
    }

    #[test]
    fn test_from_io_folds_eof() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from_io(eof), Error::Closed(_)));

        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(Error::from_io(other), Error::Io(_)));
    }

    #[test]
    fn test_error_display() {
        let err = Error::MessageTooLong {
            len: 3_000_000,
            max: 2_097_152,
        };
        assert!(err.to_string().contains("3000000"));
        assert_eq!(Error::NoAddress.to_string(), "no available address");
    }
}
