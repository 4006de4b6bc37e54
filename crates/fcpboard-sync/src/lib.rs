//! # fcpboard-sync: Board Update Scheduling
//!
//! Keeps day-bucketed boards in sync with the node: downloads each day's
//! messages slot by slot, uploads queued messages into free slots and pushes
//! attachment files ahead of their messages.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Board Sync Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                BoardSyncService (Main Orchestrator)              │  │
//! │  │                                                                  │  │
//! │  │  Decides which scans are due and starts them                     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │SchedulerRegistry│ │BoardUpdate     │  │ AttachmentUploadQueue  │    │
//! │  │                │  │Scheduler       │  │                        │    │
//! │  │ Running threads│  │ today: 2 days  │  │ One worker thread      │    │
//! │  │ per board      │  │ backlog: N days│  │ FIFO, failures requeue │    │
//! │  │ Listener fanout│  │ then uploads   │  │ to the tail            │    │
//! │  └────────────────┘  └───────┬────────┘  └───────────┬────────────┘    │
//! │                              │                       │                  │
//! │                              ▼                       ▼                  │
//! │                    fcpboard-fcp TransferClient (get / put)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`service`] - `BoardSyncService` orchestrator
//! - [`config`] - Sync configuration (node, download, upload, backlog, pacing)
//! - [`error`] - Sync error types
//! - [`scheduler`] - Per-board scan thread body
//! - [`registry`] - Running scans and update listeners
//! - [`attachments`] - Attachment upload queue
//! - [`clock`] - Wall clock seam
//! - [`pacing`] - Randomized pauses between requests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fcpboard_sync::{BoardSyncConfig, BoardSyncService, SyncContext};
//!
//! let config = BoardSyncConfig::load_or_default(None);
//! let service = BoardSyncService::new(config, ctx, store, notifier)?;
//!
//! for handle in service.update_all()? {
//!     let _ = handle.join();
//! }
//! service.shutdown();
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod attachments;
pub mod clock;
pub mod config;
pub mod error;
pub mod pacing;
pub mod registry;
pub mod scheduler;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use attachments::{AttachmentJob, AttachmentUploadQueue, LogNotifier, UserNotifier};
pub use clock::{Clock, SystemClock};
pub use config::{
    BacklogSettings, BoardSyncConfig, DownloadSettings, NodeSettings, PacingSettings,
    UploadSettings,
};
pub use error::{SyncError, SyncResult};
pub use pacing::{NoPacing, Pacer, Pause, RandomPacer};
pub use registry::{BoardUpdateListener, NoOpListener, ScanHandle, SchedulerRegistry};
pub use scheduler::{BoardUpdateScheduler, ScanSummary, StopToken, SyncContext, UploadPass};
pub use service::BoardSyncService;
