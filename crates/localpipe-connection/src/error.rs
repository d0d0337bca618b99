//! Error taxonomy for connections, connect attempts and copies

use std::io;
use thiserror::Error;

/// Errors returned from an outbound connect attempt
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection timed out")]
    Timeout,

    #[error("Connection refused")]
    Refused,

    #[error("Connect attempt cancelled")]
    Cancelled,

    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Failed to configure socket: {0}")]
    Configure(#[source] io::Error),

    #[error("Connection failed: {0}")]
    Unknown(String),
}

impl ConnectionError {
    /// Classify an OS-level connect failure
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectionError::Refused,
            io::ErrorKind::TimedOut => ConnectionError::Timeout,
            _ => ConnectionError::Unknown(err.to_string()),
        }
    }
}

/// Socket option mutation failed
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Connection is closed")]
    Closed,

    #[error("Failed to apply socket option: {0}")]
    Io(#[from] io::Error),
}

/// Which end of a copy failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySide {
    /// Reading from the source failed
    Input,
    /// Writing to the sink failed
    Output,
}

impl std::fmt::Display for CopySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopySide::Input => write!(f, "input"),
            CopySide::Output => write!(f, "output"),
        }
    }
}

/// A copy between two endpoints stopped on an I/O failure
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("Input side failed: {0}")]
    InputSideFailure(#[source] io::Error),

    #[error("Output side failed: {0}")]
    OutputSideFailure(#[source] io::Error),
}

impl CopyError {
    pub fn side(&self) -> CopySide {
        match self {
            CopyError::InputSideFailure(_) => CopySide::Input,
            CopyError::OutputSideFailure(_) => CopySide::Output,
        }
    }

    /// The underlying I/O failure
    pub fn cause(&self) -> &io::Error {
        match self {
            CopyError::InputSideFailure(e) | CopyError::OutputSideFailure(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            ConnectionError::from_io(&refused),
            ConnectionError::Refused
        ));

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert!(matches!(
            ConnectionError::from_io(&timed_out),
            ConnectionError::Timeout
        ));

        let other = io::Error::new(io::ErrorKind::Other, "network unreachable");
        match ConnectionError::from_io(&other) {
            ConnectionError::Unknown(message) => assert!(message.contains("unreachable")),
            e => panic!("unexpected classification: {:?}", e),
        }
    }

    #[test]
    fn test_copy_error_side() {
        let input = CopyError::InputSideFailure(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(input.side(), CopySide::Input);
        assert_eq!(input.cause().kind(), io::ErrorKind::ConnectionReset);

        let output = CopyError::OutputSideFailure(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(output.side(), CopySide::Output);
        assert_eq!(output.to_string(), format!("Output side failed: {}", output.cause()));
    }
}
