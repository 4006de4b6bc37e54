//! # Store Interfaces
//!
//! Narrow interfaces to the persistence layer that owns slot indices, scan
//! progress and messages.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Who Calls What                                       │
//! │                                                                         │
//! │  BoardUpdateScheduler                                                  │
//! │  ├── SlotIndexStore      load_or_create / save   (after EVERY slot)    │
//! │  ├── ProgressStore       day counters, backlog checkpoint, flags       │
//! │  ├── MessageArchive      add_received / add_sent                       │
//! │  └── UnsentMessageQueue  next_pending / remove                         │
//! │                                                                         │
//! │  AttachmentUploadQueue                                                 │
//! │  └── AttachmentStore     attachment_uploaded                           │
//! │                                                                         │
//! │  Writes are write-through: a crash mid-scan loses at most one slot.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::CoreResult;
use crate::types::{BacklogCheckpoint, BoardId, BoardMessage, DayProgress, SlotIndex};

/// Slot indices keyed by (board, calendar day).
pub trait SlotIndexStore: Send + Sync {
    /// Returns the stored index, or a fresh empty one.
    fn load_or_create(&self, board: &BoardId, day: NaiveDate) -> CoreResult<SlotIndex>;

    /// Persists an index.
    fn save(&self, index: &SlotIndex) -> CoreResult<()>;
}

/// Scan progress and board-level update state.
pub trait ProgressStore: Send + Sync {
    /// Returns the stored counters for a day, or zeroed ones.
    fn load_day(&self, board: &BoardId, day: NaiveDate) -> CoreResult<DayProgress>;

    /// Persists a day's counters.
    fn save_day(&self, progress: &DayProgress) -> CoreResult<()>;

    /// Where a previous backlog scan was interrupted, if it was.
    fn backlog_checkpoint(&self, board: &BoardId) -> CoreResult<Option<BacklogCheckpoint>>;

    /// Stores or clears the backlog checkpoint.
    fn set_backlog_checkpoint(
        &self,
        board: &BoardId,
        checkpoint: Option<BacklogCheckpoint>,
    ) -> CoreResult<()>;

    /// When the last backlog scan ran to completion.
    fn last_backlog_finished(&self, board: &BoardId) -> CoreResult<Option<DateTime<Utc>>>;

    fn set_last_backlog_finished(&self, board: &BoardId, at: DateTime<Utc>) -> CoreResult<()>;

    /// Board-level "is updating" flag toggled by backlog scans.
    fn set_updating(&self, board: &BoardId, updating: bool) -> CoreResult<()>;

    fn is_updating(&self, board: &BoardId) -> CoreResult<bool>;
}

/// Received and sent messages.
pub trait MessageArchive: Send + Sync {
    /// Stores a received message. Returns false if it was already known.
    fn add_received(
        &self,
        board: &BoardId,
        day: NaiveDate,
        index: u32,
        message: BoardMessage,
    ) -> CoreResult<bool>;

    /// Stores a message this client inserted.
    fn add_sent(&self, message: &BoardMessage) -> CoreResult<()>;
}

/// Outgoing messages waiting for an upload slot.
pub trait UnsentMessageQueue: Send + Sync {
    /// Next pending message for a board, optionally restricted to one sender,
    /// skipping ids in `exclude`.
    fn next_pending(
        &self,
        board: &BoardId,
        from_name: Option<&str>,
        exclude: &HashSet<String>,
    ) -> CoreResult<Option<BoardMessage>>;

    /// Dequeues a message after it was inserted or deleted.
    fn remove(&self, message_id: &str) -> CoreResult<()>;
}

/// Receives content keys of uploaded attachments.
pub trait AttachmentStore: Send + Sync {
    /// Records the key of an uploaded attachment against its message.
    fn attachment_uploaded(&self, message_id: &str, file: &Path, key: &str) -> CoreResult<()>;
}
