//! # Board Sync Service
//!
//! Assembles the registry, the scheduler factory and the attachment queue
//! from one configuration.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     BoardSyncService Lifecycle                          │
//! │                                                                         │
//! │  new() ──► attachment worker running                                   │
//! │    │                                                                    │
//! │    ├─► update_board(b)   today scan, plus backlog scan when due        │
//! │    ├─► submit_attachments(msg)   queue files still lacking keys        │
//! │    ├─► delete_message(id)        cancel its uploads, dequeue it        │
//! │    │                                                                    │
//! │    ▼                                                                    │
//! │  shutdown() ──► stop flags set, attachment worker joined               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::Duration;
use fcpboard_core::{AttachmentStore, Board, BoardMessage, ScanKind};
use tracing::{debug, info};

use crate::attachments::{AttachmentJob, AttachmentUploadQueue, UserNotifier};
use crate::config::BoardSyncConfig;
use crate::error::SyncResult;
use crate::registry::{BoardUpdateListener, ScanHandle, SchedulerRegistry};
use crate::scheduler::{BoardUpdateScheduler, SyncContext};

/// Entry point of the sync layer.
pub struct BoardSyncService {
    config: Arc<BoardSyncConfig>,
    ctx: SyncContext,
    registry: Arc<SchedulerRegistry>,
    attachments: AttachmentUploadQueue,
}

impl BoardSyncService {
    /// Builds the service and starts the attachment worker.
    pub fn new(
        config: BoardSyncConfig,
        ctx: SyncContext,
        attachment_store: Arc<dyn AttachmentStore>,
        notifier: Arc<dyn UserNotifier>,
    ) -> SyncResult<Self> {
        let attachments = AttachmentUploadQueue::new(
            ctx.transfer.clone(),
            attachment_store,
            notifier,
            ctx.pacer.clone(),
            config.upload.clone(),
        );
        attachments.start()?;

        Ok(Self {
            config: Arc::new(config),
            ctx,
            registry: Arc::new(SchedulerRegistry::new()),
            attachments,
        })
    }

    pub fn config(&self) -> &BoardSyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchedulerRegistry> {
        &self.registry
    }

    pub fn attachments(&self) -> &AttachmentUploadQueue {
        &self.attachments
    }

    pub fn add_listener(&self, listener: Arc<dyn BoardUpdateListener>) {
        self.registry.add_listener(listener);
    }

    /// Starts a today scan of `board`, and a backlog scan when one is due.
    /// Scans already running for the board are not duplicated.
    pub fn update_board(&self, board: &Board) -> SyncResult<Vec<ScanHandle>> {
        let mut handles = Vec::new();
        let id = board.id();

        if self.registry.is_running(&id, ScanKind::Today) {
            debug!(board = %id, "Today scan already running");
        } else {
            handles.push(self.spawn(board, ScanKind::Today)?);
        }

        if self.registry.is_running(&id, ScanKind::Backlog) {
            debug!(board = %id, "Backlog scan already running");
        } else if self.backlog_due(board)? {
            handles.push(self.spawn(board, ScanKind::Backlog)?);
        }

        Ok(handles)
    }

    /// Runs [`update_board`](Self::update_board) for every configured board.
    pub fn update_all(&self) -> SyncResult<Vec<ScanHandle>> {
        let mut handles = Vec::new();
        for board in &self.config.boards {
            handles.extend(self.update_board(board)?);
        }
        Ok(handles)
    }

    /// Interrupted backlogs resume at once; otherwise one runs every
    /// `interval_hours`.
    fn backlog_due(&self, board: &Board) -> SyncResult<bool> {
        let id = board.id();
        if self.ctx.progress.backlog_checkpoint(&id)?.is_some() {
            return Ok(true);
        }
        let interval = Duration::hours(i64::from(self.config.backlog.interval_hours));
        Ok(match self.ctx.progress.last_backlog_finished(&id)? {
            Some(finished) => self.ctx.clock.now() - finished >= interval,
            None => true,
        })
    }

    fn spawn(&self, board: &Board, kind: ScanKind) -> SyncResult<ScanHandle> {
        let scheduler =
            BoardUpdateScheduler::new(board.clone(), kind, self.ctx.clone(), Arc::clone(&self.config));
        self.registry.spawn(scheduler)
    }

    /// Queues every attachment of `message` that has no key yet.
    pub fn submit_attachments(&self, message: &BoardMessage) -> SyncResult<usize> {
        let mut queued = 0;
        for attachment in message.attachments.iter().filter(|a| a.key.is_none()) {
            if let Some(path) = &attachment.local_path {
                self.attachments
                    .enqueue(AttachmentJob::new(&message.message_id, path))?;
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Cancels a message's attachment uploads and removes it from the
    /// outgoing queue.
    pub fn delete_message(&self, message_id: &str) -> SyncResult<usize> {
        let cancelled = self.attachments.message_deleted(message_id);
        self.ctx.unsent.remove(message_id)?;
        info!(message_id = %message_id, cancelled, "Message deleted");
        Ok(cancelled)
    }

    /// Signals every scan to stop and joins the attachment worker.
    pub fn shutdown(&self) {
        let stopped = self.registry.stop_all();
        self.attachments.shutdown();
        info!(scans = stopped, "Board sync shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::LogNotifier;
    use crate::pacing::NoPacing;
    use crate::testing::{ManualClock, MockNode};
    use chrono::{TimeZone, Utc};
    use fcpboard_core::{Attachment, BacklogCheckpoint, MemoryStore, ProgressStore};

    struct Fixture {
        service: BoardSyncService,
        store: Arc<MemoryStore>,
        node: Arc<MockNode>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BoardSyncConfig::default();
        config.node.work_dir = dir.path().to_path_buf();
        config.backlog.max_days_back = 2;
        config.boards = vec![Board::public("news"), Board::public("chat")];

        let store = Arc::new(MemoryStore::new());
        let node = Arc::new(MockNode::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let ctx = SyncContext::from_store(node.clone(), store.clone(), clock, Arc::new(NoPacing));
        let service = BoardSyncService::new(config, ctx, store.clone(), Arc::new(LogNotifier)).unwrap();

        Fixture {
            service,
            store,
            node,
            _dir: dir,
        }
    }

    fn join_all(handles: Vec<ScanHandle>) -> Vec<ScanKind> {
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().kind)
            .collect()
    }

    #[test]
    fn test_first_update_runs_today_and_backlog() {
        let fx = fixture();
        let board = Board::public("news");

        let mut kinds = join_all(fx.service.update_board(&board).unwrap());
        kinds.sort_by_key(|k| *k == ScanKind::Backlog);
        assert_eq!(kinds, vec![ScanKind::Today, ScanKind::Backlog]);
        assert!(fx.store.last_backlog_finished(&board.id()).unwrap().is_some());

        // backlog just finished, so only today runs next time
        let kinds = join_all(fx.service.update_board(&board).unwrap());
        assert_eq!(kinds, vec![ScanKind::Today]);
        fx.service.shutdown();
    }

    #[test]
    fn test_concurrent_today_and_backlog_scan_disjoint_days() {
        let fx = fixture();
        let board = Board::public("news");

        let handles = fx.service.update_board(&board).unwrap();
        assert_eq!(handles.len(), 2);
        join_all(handles);

        let keys = fx.node.requested_keys();
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len(), "a slot was fetched twice");

        for (y, m, d) in [(2024, 3, 1), (2024, 2, 29), (2024, 2, 28)] {
            let day = chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap();
            let fetched = keys
                .iter()
                .filter(|k| k.contains(&format!("|{}-", fcpboard_core::keys::format_day(day))))
                .count();
            let progress = fx.store.load_day(&board.id(), day).unwrap();
            assert!(fetched > 0);
            assert_eq!(progress.tried as usize, fetched);
            assert_eq!(progress.not_found as usize, fetched);
        }
        fx.service.shutdown();
    }

    #[test]
    fn test_interrupted_backlog_is_due_immediately() {
        let fx = fixture();
        let board = Board::public("news");
        fx.store
            .set_last_backlog_finished(&board.id(), Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap())
            .unwrap();
        fx.store
            .set_backlog_checkpoint(
                &board.id(),
                Some(BacklogCheckpoint {
                    day_offset: 2,
                    recorded_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
                }),
            )
            .unwrap();

        assert!(fx.service.backlog_due(&board).unwrap());
        fx.store.set_backlog_checkpoint(&board.id(), None).unwrap();
        assert!(!fx.service.backlog_due(&board).unwrap());
        fx.service.shutdown();
    }

    #[test]
    fn test_update_all_covers_configured_boards() {
        let fx = fixture();
        let handles = fx.service.update_all().unwrap();
        assert_eq!(handles.len(), 4);
        join_all(handles);

        let keys = fx.node.requested_keys();
        assert!(keys.iter().any(|k| k.contains("|news|")));
        assert!(keys.iter().any(|k| k.contains("|chat|")));
        assert_eq!(fx.service.registry().running_count(), 0);
        fx.service.shutdown();
    }

    #[test]
    fn test_delete_message_cancels_attachments_and_dequeues() {
        let fx = fixture();
        fx.service.attachments().shutdown();

        let board = Board::public("news");
        let mut message = BoardMessage::compose(&board, "bob", "s", "b", Utc::now());
        message.attachments.push(Attachment {
            file_name: "a.bin".into(),
            size: 1,
            key: None,
            local_path: Some("/nonexistent/a.bin".into()),
        });
        fx.store.queue_unsent(message.clone()).unwrap();

        // the worker is stopped, so queuing is refused
        assert!(fx.service.submit_attachments(&message).is_err());
        assert_eq!(fx.service.delete_message(&message.message_id).unwrap(), 0);
        assert!(fx.store.unsent().unwrap().is_empty());
    }

    #[test]
    fn test_submit_attachments_queues_only_missing_keys() {
        let fx = fixture();
        // keep jobs in the queue
        fx.service.attachments().shutdown();
        let fx_queue = AttachmentUploadQueue::new(
            fx.node.clone(),
            fx.store.clone(),
            Arc::new(LogNotifier),
            Arc::new(NoPacing),
            Default::default(),
        );
        let board = Board::public("news");
        let mut message = BoardMessage::compose(&board, "bob", "s", "b", Utc::now());
        for (name, key) in [("a", None), ("b", Some("CHK@done".to_string())), ("c", None)] {
            message.attachments.push(Attachment {
                file_name: name.into(),
                size: 1,
                key,
                local_path: Some(format!("/files/{name}").into()),
            });
        }

        let service = BoardSyncService {
            config: fx.service.config.clone(),
            ctx: fx.service.ctx.clone(),
            registry: Arc::new(SchedulerRegistry::new()),
            attachments: fx_queue,
        };
        assert_eq!(service.submit_attachments(&message).unwrap(), 2);
        assert_eq!(service.attachments().pending(), 2);
        assert_eq!(service.delete_message(&message.message_id).unwrap(), 2);
        assert_eq!(service.attachments().pending(), 0);
    }
}
