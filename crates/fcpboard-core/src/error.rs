//! # Error Types
//!
//! Domain-specific error types for fcpboard-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fcpboard-core errors (this file)                                      │
//! │  ├── CoreError        - Store and payload failures                     │
//! │  └── ValidationError  - Downloaded message sanity failures             │
//! │                                                                         │
//! │  fcpboard-fcp errors (separate crate)                                  │
//! │  └── FcpError         - Socket and protocol failures                   │
//! │                                                                         │
//! │  fcpboard-sync errors (separate crate)                                 │
//! │  └── SyncError        - Config, scheduling, wrapped lower errors       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised by domain types and the store interfaces.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The backing store failed to read or write.
    #[error("Store error: {0}")]
    Store(String),

    /// A record the caller relies on does not exist.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// A downloaded payload could not be parsed as a message envelope.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::MalformedMessage(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Application-level sanity failures for messages the node delivered fine.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too short.
    #[error("{field} must be at least {min} characters")]
    TooShort { field: String, min: usize },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., whitespace inside an identifier).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Envelope date is too far from the day bucket it was fetched from.
    #[error("message date {date} is outside the window of bucket {bucket}")]
    DateOutOfWindow { date: String, bucket: String },

    /// Field does not match the value implied by where it was fetched from.
    #[error("{field} mismatch: expected '{expected}', got '{actual}'")]
    Mismatch {
        field: String,
        expected: String,
        actual: String,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
