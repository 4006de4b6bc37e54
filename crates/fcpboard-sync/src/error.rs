//! # Sync Error Types
//!
//! Error types for board synchronization.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Collaborators │  │     Lifecycle           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Core (stores)  │  │  ThreadSpawn            │ │
//! │  │  ConfigLoad...  │  │  Fcp (node)     │  │  ShuttingDown           │ │
//! │  │  ConfigSave...  │  │  Io             │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Not-found slots, key collisions and invalid messages are scan outcomes,
//! not errors. Only a failing store or a failing thread spawn ends a scan
//! early.

use fcpboard_core::CoreError;
use fcpboard_fcp::FcpError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// A store collaborator failed.
    #[error("Store error: {0}")]
    Core(#[from] CoreError),

    /// The node protocol client failed outside a get/put.
    #[error("Node error: {0}")]
    Fcp(#[from] FcpError),

    /// Local file handling around a transfer failed.
    #[error("File error: {0}")]
    Io(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The OS refused to start a worker thread.
    #[error("Failed to spawn thread {name}: {reason}")]
    ThreadSpawn { name: String, reason: String },

    /// The component is shutting down.
    #[error("Board sync is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the next scheduled pass may succeed where this failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Fcp(err) => err.is_retryable(),
            SyncError::Io(_) | SyncError::ThreadSpawn { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
