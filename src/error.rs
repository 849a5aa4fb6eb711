//! Error types for rcstream.

use thiserror::Error;

/// Error type for transport operations.
///
/// `Timeout`, `WouldBlock` and `Interrupted` are retryable on the same
/// stream. `Comm` and `Protocol` mean the connection is dead: the sticky
/// error flag has been set and every subsequent call fails fast, so the
/// only recovery is a fresh stream and a new handshake.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation did not complete within the caller's timeout.
    #[error("operation timed out")]
    Timeout,
    /// Non-blocking operation could not make progress.
    #[error("operation would block")]
    WouldBlock,
    /// A wait was interrupted by a signal.
    #[error("operation interrupted")]
    Interrupted,
    /// Invalid configuration, detected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The connection is dead (hardware failure, unreachable peer,
    /// failed post/poll, bad completion status).
    #[error("communication error: {0}")]
    Comm(String),
    /// Malformed handshake private data or flow-control packet.
    /// The connection is dead.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether the same call may be retried on this stream.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::WouldBlock | Error::Interrupted
        )
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::WouldBlock.is_retryable());
        assert!(Error::Interrupted.is_retryable());
        assert!(!Error::Comm("dead".into()).is_retryable());
        assert!(!Error::Protocol("bad".into()).is_retryable());
        assert!(!Error::InvalidConfig("bad".into()).is_retryable());
    }
}
