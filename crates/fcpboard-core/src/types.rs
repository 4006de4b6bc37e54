//! # Domain Types
//!
//! Core domain types used throughout fcpboard.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Board       │   │   SlotIndex     │   │  DayProgress    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  name           │   │  board + day    │   │  tried          │       │
//! │  │  public_key?    │   │  download_used  │   │  not_found      │       │
//! │  │  private_key?   │   │  upload_used    │   │  invalid        │       │
//! │  └─────────────────┘   │  last_hit       │   │  adnf           │       │
//! │                        └─────────────────┘   │  current_index  │       │
//! │  ┌─────────────────┐   ┌─────────────────┐   └─────────────────┘       │
//! │  │  BoardMessage   │   │   Attachment    │                             │
//! │  │  ─────────────  │   │  ─────────────  │                             │
//! │  │  message_id     │   │  file_name      │                             │
//! │  │  board, date    │   │  size, key?     │                             │
//! │  │  body           │   │  local_path?    │                             │
//! │  └─────────────────┘   └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreResult;

// =============================================================================
// Board
// =============================================================================

/// Stable identity of a board: its lower-cased name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoardId(String);

impl BoardId {
    /// Creates a board id from a display name.
    pub fn new(name: &str) -> Self {
        BoardId(name.trim().to_lowercase())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BoardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability descriptor of a board.
///
/// A board with a public key is write-access-controlled: readers fetch from
/// the public key's subspace and only holders of the private key can post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    name: String,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
}

impl Board {
    /// Creates a public (keyword-addressed) board.
    pub fn public(name: impl Into<String>) -> Self {
        Board {
            name: name.into(),
            public_key: None,
            private_key: None,
        }
    }

    /// Creates an access-controlled board.
    pub fn access_controlled(
        name: impl Into<String>,
        public_key: impl Into<String>,
        private_key: Option<String>,
    ) -> Self {
        Board {
            name: name.into(),
            public_key: Some(public_key.into()),
            private_key,
        }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity used by stores and the registry.
    pub fn id(&self) -> BoardId {
        BoardId::new(&self.name)
    }

    /// Name segment embedded in slot keys.
    pub fn filename(&self) -> String {
        self.name.trim().to_lowercase()
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref()
    }

    /// Returns true if posting requires the board's private key.
    pub fn is_access_controlled(&self) -> bool {
        self.public_key.is_some()
    }

    /// Returns true if this client can upload messages to the board.
    pub fn can_write(&self) -> bool {
        !self.is_access_controlled() || self.private_key.is_some()
    }
}

// =============================================================================
// Scan Kind
// =============================================================================

/// Which range of days a scheduler thread walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Today and yesterday, followed by the upload pass.
    Today,
    /// Older days, resumable across runs.
    Backlog,
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanKind::Today => write!(f, "today"),
            ScanKind::Backlog => write!(f, "backlog"),
        }
    }
}

// =============================================================================
// Slot Index
// =============================================================================

/// Per board, per day bookkeeping of which slot positions are taken.
///
/// ## Slot Semantics
/// ```text
/// index:          0     1     2     3     4     5 ...
/// download_used:  ■     ■           ■
/// upload_used:                      ■
///
/// find_first_download_slot() -> 2   (first index nobody consumed)
/// find_next_download_slot(2) -> 4
/// find_first_upload_slot()   -> 2
/// ```
/// A download slot is "used" once it held a message (valid or not) or was
/// permanently skipped. Slots that returned not-found stay free: someone may
/// still post there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotIndex {
    board: BoardId,
    day: NaiveDate,
    #[serde(default)]
    download_used: BTreeSet<u32>,
    #[serde(default)]
    upload_used: BTreeSet<u32>,
    #[serde(default)]
    last_hit: Option<u32>,
}

impl SlotIndex {
    /// Creates an empty index for a board and day.
    pub fn new(board: BoardId, day: NaiveDate) -> Self {
        SlotIndex {
            board,
            day,
            download_used: BTreeSet::new(),
            upload_used: BTreeSet::new(),
            last_hit: None,
        }
    }

    pub fn board(&self) -> &BoardId {
        &self.board
    }

    /// Calendar day this index buckets.
    pub fn day(&self) -> NaiveDate {
        self.day
    }

    /// Calendar day as epoch milliseconds of its UTC midnight.
    pub fn day_millis(&self) -> i64 {
        self.day
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default()
    }

    pub fn is_download_used(&self, index: u32) -> bool {
        self.download_used.contains(&index)
    }

    /// First slot not yet consumed by a download.
    pub fn find_first_download_slot(&self) -> u32 {
        self.free_download_from(0)
    }

    /// Next slot after `after` not yet consumed by a download.
    pub fn find_next_download_slot(&self, after: u32) -> u32 {
        self.free_download_from(after.saturating_add(1))
    }

    /// First slot free for an insert.
    pub fn find_first_upload_slot(&self) -> u32 {
        self.free_upload_from(0)
    }

    /// Next slot after `after` free for an insert.
    pub fn find_next_upload_slot(&self, after: u32) -> u32 {
        self.free_upload_from(after.saturating_add(1))
    }

    /// Marks a slot as consumed so scans skip it.
    pub fn mark_download_used(&mut self, index: u32) {
        self.download_used.insert(index);
    }

    /// Marks a slot as taken by an insert (ours or a collision).
    pub fn mark_upload_used(&mut self, index: u32) {
        self.upload_used.insert(index);
        self.download_used.insert(index);
    }

    /// Records that a message was found at `index`.
    pub fn record_hit(&mut self, index: u32) {
        self.last_hit = Some(self.last_hit.map_or(index, |hit| hit.max(index)));
    }

    /// Highest slot a message was found at, if any.
    pub fn last_hit(&self) -> Option<u32> {
        self.last_hit
    }

    /// Number of slots consumed so far.
    pub fn used_count(&self) -> usize {
        self.download_used.len()
    }

    fn free_download_from(&self, start: u32) -> u32 {
        let mut index = start;
        while self.download_used.contains(&index) {
            index += 1;
        }
        index
    }

    fn free_upload_from(&self, start: u32) -> u32 {
        let mut index = start;
        while self.download_used.contains(&index) || self.upload_used.contains(&index) {
            index += 1;
        }
        index
    }
}

// =============================================================================
// Day Progress
// =============================================================================

/// Per board, per day scan counters observed by listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayProgress {
    pub board: BoardId,
    pub day: NaiveDate,
    /// Slot fetches attempted.
    pub tried: u32,
    /// Fetches that found no data.
    pub not_found: u32,
    /// Fetches that failed or delivered an unacceptable message.
    pub invalid: u32,
    /// Fetches whose data was announced but no longer retrievable.
    pub all_data_missing: u32,
    /// Messages accepted.
    pub received: u32,
    /// Slot currently being probed.
    pub current_index: Option<u32>,
}

impl DayProgress {
    pub fn new(board: BoardId, day: NaiveDate) -> Self {
        DayProgress {
            board,
            day,
            tried: 0,
            not_found: 0,
            invalid: 0,
            all_data_missing: 0,
            received: 0,
            current_index: None,
        }
    }
}

/// Where an interrupted backlog scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogCheckpoint {
    /// Day offset (days before the run's "today") that was being scanned.
    pub day_offset: u32,
    /// Reference time `day_offset` counts back from.
    pub recorded_at: DateTime<Utc>,
}

// =============================================================================
// Messages
// =============================================================================

/// A file attached to a board message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub size: u64,
    /// Content key, known once the file was inserted.
    #[serde(default)]
    pub key: Option<String>,
    /// Source file on this machine; never part of the envelope.
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
}

/// Envelope of a board message as stored in a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardMessage {
    pub message_id: String,
    pub board: String,
    pub from_name: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl BoardMessage {
    /// Creates a new outgoing message with a fresh identifier.
    pub fn compose(
        board: &Board,
        from_name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        date: DateTime<Utc>,
    ) -> Self {
        BoardMessage {
            message_id: Uuid::new_v4().to_string(),
            board: board.name().to_string(),
            from_name: from_name.into(),
            subject: subject.into(),
            date,
            in_reply_to: None,
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    /// Returns true while any attachment still lacks its content key.
    pub fn has_pending_attachments(&self) -> bool {
        self.attachments.iter().any(|a| a.key.is_none())
    }

    /// Serializes the envelope for insertion.
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a downloaded envelope.
    pub fn from_json(bytes: &[u8]) -> CoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
