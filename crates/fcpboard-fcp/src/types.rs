//! # Request and Result Types
//!
//! Typed inputs and outcomes of node transfers.
//!
//! ## Result Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  GET                               PUT                                  │
//! │  ───                               ───                                  │
//! │  AllData / DataFound ─► Success    PutSuccessful        ─► Success      │
//! │  GetFailed           ─► Failed     URIGenerated (key-only) ─► KeyOnly   │
//! │  IdentifierCollision ─► Collision  PutFailed code 9     ─► KeyCollision │
//! │  blocked hash        ─► Disabled   PutFailed code 5     ─► Retry        │
//! │  anything else       ─► Failed     anything else        ─► Error        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::FcpError;

/// Node sends every message kind when this mask is set.
pub const VERBOSITY_ALL: i32 = -1;

// =============================================================================
// Failure Codes
// =============================================================================

/// GetFailed: data not found.
pub const DATA_NOT_FOUND: i32 = 13;
/// GetFailed: route not found. Treated like data not found.
pub const ROUTE_NOT_FOUND: i32 = 14;
/// GetFailed: some blocks were found but the rest is gone.
pub const ALL_DATA_NOT_FOUND: i32 = 28;
/// PutFailed: the node asks for the insert to be retried.
pub const PUT_RETRY: i32 = 5;
/// PutFailed: a different payload already lives at this key.
pub const PUT_COLLISION: i32 = 9;

// =============================================================================
// Shared Parameters
// =============================================================================

/// Node scheduling priority, 0 (highest) to 6 (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PriorityClass(u8);

impl PriorityClass {
    pub const MAXIMUM: PriorityClass = PriorityClass(0);
    pub const INTERACTIVE: PriorityClass = PriorityClass(1);
    pub const SEMI_INTERACTIVE: PriorityClass = PriorityClass(2);
    pub const UPDATE: PriorityClass = PriorityClass(3);
    pub const BULK: PriorityClass = PriorityClass(4);
    pub const PREFETCH: PriorityClass = PriorityClass(5);
    pub const MINIMUM: PriorityClass = PriorityClass(6);

    pub fn new(value: u8) -> Option<Self> {
        (value <= 6).then_some(PriorityClass(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for PriorityClass {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        PriorityClass::new(value).ok_or_else(|| format!("priority class {value} is not in 0..=6"))
    }
}

impl From<PriorityClass> for u8 {
    fn from(p: PriorityClass) -> u8 {
        p.0
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How many times the node may retry a fetch internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    Bounded(u32),
    Unbounded,
}

impl RetryBudget {
    /// Value of the `MaxRetries` field. A bounded budget allows at least
    /// one retry.
    pub fn wire_value(&self) -> i64 {
        match self {
            RetryBudget::Bounded(n) => i64::from((*n).max(1)),
            RetryBudget::Unbounded => -1,
        }
    }
}

/// Where a download's payload goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    /// The node writes the file itself (requires direct disk access).
    Disk,
    /// Bytes are streamed over the socket.
    Direct,
}

impl ReturnType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ReturnType::Disk => "disk",
            ReturnType::Direct => "direct",
        }
    }
}

/// Snapshot of a transfer's block counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleProgress {
    pub total: u64,
    pub required: u64,
    pub failed: u64,
    pub fatally_failed: u64,
    pub succeeded: u64,
    pub finalized: bool,
}

/// Receives progress updates during a transfer.
pub trait TransferProgress: Send + Sync {
    fn progress(&self, identifier: &str, progress: &SimpleProgress);
}

/// Content hashes the user never wants fetched.
pub trait HashBlocklist: Send + Sync {
    /// `sha256` is the node's base64 rendering of the hash.
    fn is_blocked(&self, sha256: &str) -> bool;
}

// =============================================================================
// Get
// =============================================================================

/// A single-shot download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub key: String,
    pub target: PathBuf,
    pub retries: RetryBudget,
    pub priority: Option<PriorityClass>,
    pub max_size: Option<u64>,
}

impl GetRequest {
    pub fn new(key: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
            retries: RetryBudget::Unbounded,
            priority: None,
            max_size: None,
        }
    }

    pub fn with_retries(mut self, retries: RetryBudget) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    Success,
    Failed,
    IdentifierCollision,
    /// Refused locally because the content hash is blocklisted.
    Disabled,
}

/// Outcome of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub outcome: GetOutcome,
    pub code: Option<i32>,
    pub fatal: bool,
    pub description: Option<String>,
    pub redirect_key: Option<String>,
    pub data_length: Option<u64>,
}

impl GetResult {
    pub fn success(data_length: u64) -> Self {
        Self {
            outcome: GetOutcome::Success,
            code: None,
            fatal: false,
            description: None,
            redirect_key: None,
            data_length: Some(data_length),
        }
    }

    pub fn failed(code: Option<i32>, fatal: bool, description: impl Into<String>) -> Self {
        Self {
            outcome: GetOutcome::Failed,
            code,
            fatal,
            description: Some(description.into()),
            redirect_key: None,
            data_length: None,
        }
    }

    /// A failure that never reached the node's request logic.
    pub fn connection_failure(err: &FcpError) -> Self {
        Self::failed(None, false, err.to_string())
    }

    pub fn identifier_collision() -> Self {
        Self {
            outcome: GetOutcome::IdentifierCollision,
            ..Self::failed(None, false, "identifier collision")
        }
    }

    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            outcome: GetOutcome::Disabled,
            ..Self::failed(None, true, reason)
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == GetOutcome::Success
    }

    /// Nothing was found at the key (including no route to it).
    pub fn is_data_not_found(&self) -> bool {
        self.outcome == GetOutcome::Failed
            && matches!(self.code, Some(DATA_NOT_FOUND) | Some(ROUTE_NOT_FOUND))
    }

    /// The key resolved but its data blocks are gone.
    pub fn is_all_data_not_found(&self) -> bool {
        self.outcome == GetOutcome::Failed && self.code == Some(ALL_DATA_NOT_FOUND)
    }
}

// =============================================================================
// Put
// =============================================================================

/// Whether the node actually inserts or only computes the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    KeyOnly,
    Insert { priority: PriorityClass },
}

/// `TargetFilename` handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetFilename {
    /// Let the node derive it from the key (the field is sent empty).
    Omit,
    Name(String),
}

/// A single-shot insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub source: PathBuf,
    pub key: String,
    pub mode: PutMode,
    pub target_filename: TargetFilename,
    pub max_retries: u32,
    pub extra_inserts_single_block: Option<u32>,
    pub extra_inserts_header_block: Option<u32>,
    /// Insert every block once, early, and let healing do the rest.
    pub quick_heal: bool,
    pub compress: bool,
    pub crypto_key: Option<String>,
    pub compatibility_mode: Option<String>,
}

impl PutRequest {
    /// Plain content-hash insert of a file.
    pub fn new(source: impl Into<PathBuf>, key: impl Into<String>, mode: PutMode) -> Self {
        Self {
            source: source.into(),
            key: key.into(),
            mode,
            target_filename: TargetFilename::Omit,
            max_retries: 3,
            extra_inserts_single_block: None,
            extra_inserts_header_block: None,
            quick_heal: false,
            compress: false,
            crypto_key: None,
            compatibility_mode: None,
        }
    }

    pub fn with_target_filename(mut self, name: impl Into<String>) -> Self {
        self.target_filename = TargetFilename::Name(name.into());
        self
    }

    pub fn with_extra_inserts(mut self, single_block: u32, header_block: u32) -> Self {
        self.extra_inserts_single_block = Some(single_block);
        self.extra_inserts_header_block = Some(header_block);
        self
    }

    pub fn with_quick_heal(mut self) -> Self {
        self.quick_heal = true;
        self
    }

    pub fn with_compression(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn with_crypto_key(mut self, key: impl Into<String>) -> Self {
        self.crypto_key = Some(key.into());
        self
    }

    pub fn with_compatibility_mode(mut self, mode: impl Into<String>) -> Self {
        self.compatibility_mode = Some(mode.into());
        self
    }

    pub fn is_key_only(&self) -> bool {
        self.mode == PutMode::KeyOnly
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Success,
    /// Key computed without inserting.
    KeyOnly,
    KeyCollision,
    Retry,
    IdentifierCollision,
    Error,
}

/// Outcome of an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub outcome: PutOutcome,
    pub key: Option<String>,
    pub code: Option<i32>,
    pub description: Option<String>,
}

impl PutResult {
    pub fn success(key: String) -> Self {
        Self {
            outcome: PutOutcome::Success,
            key: Some(key),
            code: None,
            description: None,
        }
    }

    pub fn key_only(key: String) -> Self {
        Self {
            outcome: PutOutcome::KeyOnly,
            ..Self::success(key)
        }
    }

    /// Classifies a PutFailed code.
    pub fn from_failure(code: Option<i32>, description: impl Into<String>) -> Self {
        let outcome = match code {
            Some(PUT_COLLISION) => PutOutcome::KeyCollision,
            Some(PUT_RETRY) => PutOutcome::Retry,
            _ => PutOutcome::Error,
        };
        Self {
            outcome,
            key: None,
            code,
            description: Some(description.into()),
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self::from_failure(None, description)
    }

    pub fn connection_failure(err: &FcpError) -> Self {
        Self::error(err.to_string())
    }

    pub fn identifier_collision() -> Self {
        Self {
            outcome: PutOutcome::IdentifierCollision,
            ..Self::error("identifier collision")
        }
    }

    /// The node holds the data under the returned key.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PutOutcome::Success | PutOutcome::KeyOnly)
    }
}

// =============================================================================
// Other Replies
// =============================================================================

/// A freshly generated signed-subspace key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SskKeypair {
    pub insert_uri: String,
    pub request_uri: String,
}

/// What the node reports about a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub origin_uri: Option<String>,
    pub is_talkable: bool,
    pub version: Option<String>,
}
