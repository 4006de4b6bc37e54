//! # fcpboard-core: Pure Board Logic
//!
//! Types and rules shared by the node protocol client and the board update
//! scheduler. Nothing in this crate touches a socket, a file or a clock.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        fcpboard Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                fcpboard-sync (scheduler threads)                │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 fcpboard-fcp (node protocol)                    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ fcpboard-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   keys    │  │   types   │  │ validation│  │   store   │  │   │
//! │  │   │ encoding  │  │ SlotIndex │  │  message  │  │  traits + │  │   │
//! │  │   │ compose   │  │  Message  │  │  sanity   │  │  memory   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO SOCKETS • NO FILES • NO CLOCKS • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`keys`] - Percent-coding of node keys and board key composition
//! - [`types`] - Boards, slot indices, day progress, message envelopes
//! - [`validation`] - Sanity checks applied to downloaded messages
//! - [`store`] - Narrow interfaces to the persistence layer
//! - [`memory`] - In-memory implementations of the store interfaces
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::NaiveDate;
//! use fcpboard_core::{keys, Board, SlotIndex};
//!
//! let board = Board::public("test");
//! let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
//! let mut index = SlotIndex::new(board.id(), day);
//!
//! let slot = index.find_first_download_slot();
//! assert_eq!(slot, 0);
//! assert_eq!(
//!     keys::compose_download_key(&board, day, slot),
//!     "KSK@fcpboard|message|test|2024.1.1-0.json"
//! );
//!
//! index.mark_download_used(slot);
//! assert_eq!(index.find_first_download_slot(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod keys;
pub mod memory;
pub mod store;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use memory::MemoryStore;
pub use store::{AttachmentStore, MessageArchive, ProgressStore, SlotIndexStore, UnsentMessageQueue};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Namespace segment used in every public board key.
pub const KEY_NAMESPACE: &str = "fcpboard";

/// Minimum accepted length of a message identifier.
pub const MIN_MESSAGE_ID_LEN: usize = 8;

/// Maximum accepted length of a message identifier.
pub const MAX_MESSAGE_ID_LEN: usize = 64;
