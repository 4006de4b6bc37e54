//! # Board Sync Configuration
//!
//! Configuration management for the board update scheduler.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FCPBOARD_NODE_HOST=10.0.0.2                                        │
//! │     FCPBOARD_MAX_DNF_RETRIES=4                                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fcpboard/board-sync.toml (Linux)                         │
//! │     ~/Library/Application Support/org.fcpboard.fcpboard/... (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     local node on 9481, no boards                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # board-sync.toml
//! [node]
//! host = "127.0.0.1"
//! port = 9481
//! use_dda = false
//!
//! [download]
//! max_dnf_retries = 3
//! quickly_fail_on_adnf = false
//!
//! [backlog]
//! max_days_back = 5
//! interval_hours = 6
//!
//! [[boards]]
//! name = "news"
//! ```

use std::path::PathBuf;

use fcpboard_core::Board;
use fcpboard_fcp::socket::DEFAULT_PORT;
use fcpboard_fcp::{NodeAddress, PriorityClass};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Lowest accepted consecutive not-found limit.
pub const MIN_DNF_RETRIES: u32 = 2;

/// Highest accepted consecutive not-found limit.
pub const MAX_DNF_RETRIES: u32 = 5;

// =============================================================================
// Node Settings
// =============================================================================

/// Where the node listens and how files reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Let the node read and write local files directly when it shares
    /// this machine's filesystem.
    #[serde(default)]
    pub use_dda: bool,

    /// Scratch directory for downloaded slots and outgoing envelopes.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_work_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "fcpboard", "fcpboard")
        .map(|dirs| dirs.cache_dir().join("transfers"))
        .unwrap_or_else(|| std::env::temp_dir().join("fcpboard"))
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            host: default_host(),
            port: default_port(),
            use_dda: false,
            work_dir: default_work_dir(),
        }
    }
}

impl NodeSettings {
    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(self.host.clone(), self.port)
    }
}

// =============================================================================
// Download Settings
// =============================================================================

/// How slots are fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Consecutive not-found slots after the last hit that end a day.
    /// Clamped to 2..=5 at use.
    #[serde(default = "default_max_dnf_retries")]
    pub max_dnf_retries: u32,

    /// Give up on slots whose data the node announced but lost, and bound
    /// the node's retries per fetch.
    #[serde(default)]
    pub quickly_fail_on_adnf: bool,

    /// Node-side retries per fetch under quick fail.
    #[serde(default = "default_max_get_retries")]
    pub max_get_retries: u32,

    #[serde(default = "default_message_download_priority")]
    pub priority: PriorityClass,

    /// Largest envelope accepted from a slot.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
}

fn default_max_dnf_retries() -> u32 {
    3
}

fn default_max_get_retries() -> u32 {
    2
}

fn default_message_download_priority() -> PriorityClass {
    PriorityClass::SEMI_INTERACTIVE
}

fn default_max_message_size() -> u64 {
    1024 * 1024
}

impl Default for DownloadSettings {
    fn default() -> Self {
        DownloadSettings {
            max_dnf_retries: default_max_dnf_retries(),
            quickly_fail_on_adnf: false,
            max_get_retries: default_max_get_retries(),
            priority: default_message_download_priority(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl DownloadSettings {
    /// The consecutive not-found limit actually applied.
    pub fn dnf_limit(&self) -> u32 {
        self.max_dnf_retries.clamp(MIN_DNF_RETRIES, MAX_DNF_RETRIES)
    }
}

// =============================================================================
// Upload Settings
// =============================================================================

/// How messages and attachments are inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    #[serde(default = "default_extra_inserts_single_block")]
    pub extra_inserts_single_block: u32,

    #[serde(default = "default_extra_inserts_header_block")]
    pub extra_inserts_header_block: u32,

    #[serde(default)]
    pub quick_heal: bool,

    /// Compress message envelopes before insertion.
    #[serde(default)]
    pub compress: bool,

    #[serde(default = "default_file_upload_priority")]
    pub file_priority: PriorityClass,

    #[serde(default = "default_message_upload_priority")]
    pub message_priority: PriorityClass,

    /// Occupied slots skipped for one message before the pass gives up on it.
    #[serde(default = "default_max_collision_retries")]
    pub max_collision_retries: u32,
}

fn default_extra_inserts_single_block() -> u32 {
    2
}

fn default_extra_inserts_header_block() -> u32 {
    1
}

fn default_file_upload_priority() -> PriorityClass {
    PriorityClass::BULK
}

fn default_message_upload_priority() -> PriorityClass {
    PriorityClass::SEMI_INTERACTIVE
}

fn default_max_collision_retries() -> u32 {
    10
}

impl Default for UploadSettings {
    fn default() -> Self {
        UploadSettings {
            extra_inserts_single_block: default_extra_inserts_single_block(),
            extra_inserts_header_block: default_extra_inserts_header_block(),
            quick_heal: false,
            compress: false,
            file_priority: default_file_upload_priority(),
            message_priority: default_message_upload_priority(),
            max_collision_retries: default_max_collision_retries(),
        }
    }
}

// =============================================================================
// Backlog Settings
// =============================================================================

/// Range and cadence of backlog scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogSettings {
    /// Oldest day offset a backlog scan reaches. Backlog scans start at
    /// offset 2; the today scan covers 0 and 1.
    #[serde(default = "default_max_days_back")]
    pub max_days_back: u32,

    /// Minimum hours between completed backlog scans of one board.
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u32,
}

fn default_max_days_back() -> u32 {
    5
}

fn default_interval_hours() -> u32 {
    6
}

impl Default for BacklogSettings {
    fn default() -> Self {
        BacklogSettings {
            max_days_back: default_max_days_back(),
            interval_hours: default_interval_hours(),
        }
    }
}

// =============================================================================
// Pacing Settings
// =============================================================================

/// Randomized pauses between node requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingSettings {
    #[serde(default = "default_slot_min_ms")]
    pub slot_min_ms: u64,

    #[serde(default = "default_slot_max_ms")]
    pub slot_max_ms: u64,

    #[serde(default = "default_upload_min_ms")]
    pub upload_min_ms: u64,

    #[serde(default = "default_upload_max_ms")]
    pub upload_max_ms: u64,

    #[serde(default = "default_attachment_min_ms")]
    pub attachment_min_ms: u64,

    #[serde(default = "default_attachment_max_ms")]
    pub attachment_max_ms: u64,
}

fn default_slot_min_ms() -> u64 {
    100
}
fn default_slot_max_ms() -> u64 {
    500
}
fn default_upload_min_ms() -> u64 {
    1_000
}
fn default_upload_max_ms() -> u64 {
    3_000
}
fn default_attachment_min_ms() -> u64 {
    1_000
}
fn default_attachment_max_ms() -> u64 {
    5_000
}

impl Default for PacingSettings {
    fn default() -> Self {
        PacingSettings {
            slot_min_ms: default_slot_min_ms(),
            slot_max_ms: default_slot_max_ms(),
            upload_min_ms: default_upload_min_ms(),
            upload_max_ms: default_upload_max_ms(),
            attachment_min_ms: default_attachment_min_ms(),
            attachment_max_ms: default_attachment_max_ms(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete board sync configuration.
///
/// ## Example Config File
/// ```toml
/// [node]
/// host = "127.0.0.1"
/// port = 9481
///
/// [download]
/// max_dnf_retries = 3
/// quickly_fail_on_adnf = true
/// max_get_retries = 2
///
/// [upload]
/// extra_inserts_single_block = 2
/// quick_heal = false
/// message_priority = 2
///
/// [pacing]
/// slot_min_ms = 100
/// slot_max_ms = 500
///
/// [[boards]]
/// name = "news"
///
/// [[boards]]
/// name = "team"
/// public_key = "SSK@..."
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardSyncConfig {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub download: DownloadSettings,

    #[serde(default)]
    pub upload: UploadSettings,

    #[serde(default)]
    pub backlog: BacklogSettings,

    #[serde(default)]
    pub pacing: PacingSettings,

    /// Boards kept in sync.
    #[serde(default)]
    pub boards: Vec<Board>,
}

impl BoardSyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (board-sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading board sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load board sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Board sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.node.host.trim().is_empty() {
            return Err(SyncError::InvalidConfig("node.host must not be empty".into()));
        }
        if self.node.port == 0 {
            return Err(SyncError::InvalidConfig("node.port must not be 0".into()));
        }

        if self.download.quickly_fail_on_adnf && self.download.max_get_retries == 0 {
            return Err(SyncError::InvalidConfig(
                "download.max_get_retries must be at least 1 when quick fail is on".into(),
            ));
        }
        if self.download.max_message_size == 0 {
            return Err(SyncError::InvalidConfig(
                "download.max_message_size must be greater than 0".into(),
            ));
        }

        if self.backlog.max_days_back == 0 {
            return Err(SyncError::InvalidConfig(
                "backlog.max_days_back must be greater than 0".into(),
            ));
        }

        let pacing = &self.pacing;
        for (name, min, max) in [
            ("slot", pacing.slot_min_ms, pacing.slot_max_ms),
            ("upload", pacing.upload_min_ms, pacing.upload_max_ms),
            ("attachment", pacing.attachment_min_ms, pacing.attachment_max_ms),
        ] {
            if min > max {
                return Err(SyncError::InvalidConfig(format!(
                    "pacing.{name}_min_ms ({min}) exceeds pacing.{name}_max_ms ({max})"
                )));
            }
        }

        for board in &self.boards {
            if board.name().trim().is_empty() {
                return Err(SyncError::InvalidConfig("board name must not be empty".into()));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FCPBOARD_NODE_HOST") {
            debug!(host = %host, "Overriding node host from environment");
            self.node.host = host;
        }

        if let Ok(port) = std::env::var("FCPBOARD_NODE_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding node port from environment");
                self.node.port = p;
            }
        }

        if let Ok(dda) = std::env::var("FCPBOARD_USE_DDA") {
            if let Ok(enabled) = dda.parse::<bool>() {
                self.node.use_dda = enabled;
            }
        }

        if let Ok(dir) = std::env::var("FCPBOARD_WORK_DIR") {
            self.node.work_dir = PathBuf::from(dir);
        }

        if let Ok(retries) = std::env::var("FCPBOARD_MAX_DNF_RETRIES") {
            if let Ok(n) = retries.parse::<u32>() {
                self.download.max_dnf_retries = n;
            }
        }

        if let Ok(quick) = std::env::var("FCPBOARD_QUICKLY_FAIL_ON_ADNF") {
            match quick.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.download.quickly_fail_on_adnf = true,
                "false" | "0" | "no" => self.download.quickly_fail_on_adnf = false,
                _ => warn!(value = %quick, "Unknown quick-fail flag in environment"),
            }
        }

        if let Ok(days) = std::env::var("FCPBOARD_BACKLOG_DAYS") {
            if let Ok(n) = days.parse::<u32>() {
                self.backlog.max_days_back = n;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "fcpboard", "fcpboard")
            .map(|dirs| dirs.config_dir().join("board-sync.toml"))
    }
}
