//! # Protocol Error Types
//!
//! Errors raised while talking to the node.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       FCP Error Categories                              │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Connection    │  │    Framing      │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  ConnectFailed  │  │  MalformedReply │  │  Protocol               │ │
//! │  │  Handshake...   │  │  UnexpectedEof  │  │  DdaDenied              │ │
//! │  │  Timeout        │  │                 │  │                         │ │
//! │  │  Closed         │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! These never escape a single request lifecycle: get/put convert them into
//! a typed result at the operation boundary.

use std::io;

use thiserror::Error;

/// Result type alias for protocol operations.
pub type FcpResult<T> = Result<T, FcpError>;

/// Protocol client error type.
#[derive(Debug, Error)]
pub enum FcpError {
    // =========================================================================
    // Connection Errors
    // =========================================================================
    /// Could not open a socket to the node.
    #[error("Cannot connect to node at {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// The node answered the hello with something other than NodeHello.
    #[error("Node handshake rejected: expected NodeHello, got {0}")]
    HandshakeRejected(String),

    /// No data arrived within the socket's read timeout.
    #[error("Timed out waiting for the node")]
    Timeout,

    /// The connection was already closed.
    #[error("Connection is closed")]
    Closed,

    // =========================================================================
    // Framing Errors
    // =========================================================================
    /// The node closed the stream in the middle of a reply.
    #[error("Node closed the connection unexpectedly")]
    UnexpectedEof,

    /// A reply line did not follow the Key=Value grammar.
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The node sent a reply that makes no sense at this point.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The node refused direct disk access to a directory.
    #[error("Direct disk access denied for {0}")]
    DdaDenied(String),

    /// Any other socket or file error.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FcpError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            // Blocking reads report an expired SO_TIMEOUT as WouldBlock on Unix.
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => FcpError::Timeout,
            io::ErrorKind::UnexpectedEof => FcpError::UnexpectedEof,
            _ => FcpError::Io(err),
        }
    }
}

impl FcpError {
    /// Returns true if the node simply did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FcpError::Timeout)
    }

    /// Returns true if opening a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FcpError::ConnectFailed { .. }
                | FcpError::Timeout
                | FcpError::UnexpectedEof
                | FcpError::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeouts_map_to_timeout() {
        let err: FcpError = io::Error::new(io::ErrorKind::WouldBlock, "x").into();
        assert!(err.is_timeout());
        let err: FcpError = io::Error::new(io::ErrorKind::TimedOut, "x").into();
        assert!(err.is_timeout());
        let err: FcpError = io::Error::new(io::ErrorKind::UnexpectedEof, "x").into();
        assert!(matches!(err, FcpError::UnexpectedEof));
        let err: FcpError = io::Error::new(io::ErrorKind::PermissionDenied, "x").into();
        assert!(matches!(err, FcpError::Io(_)));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(FcpError::Timeout.is_retryable());
        assert!(FcpError::ConnectFailed {
            address: "127.0.0.1:9481".into(),
            reason: "refused".into()
        }
        .is_retryable());
        assert!(!FcpError::HandshakeRejected("ProtocolError".into()).is_retryable());
        assert!(!FcpError::MalformedReply("x".into()).is_retryable());
    }
}
