//! # Board Update Scheduler
//!
//! Walks a board's day-bucketed slots, downloads what it finds, and inserts
//! the board's pending outgoing messages into free slots.
//!
//! ## Scan Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       One Scheduler Thread                              │
//! │                                                                         │
//! │  today:    day 0 ──► upload pass ──► day -1                            │
//! │  backlog:  set updating ──► day -start ... day -end ──► clear updating │
//! │                                                                         │
//! │  per day:                                                              │
//! │    ┌──────────► stop? ──yes──► finalize progress, leave                │
//! │    │              │ no                                                  │
//! │    │        next free slot ──► compose key ──► get                      │
//! │    │              │                                                     │
//! │    │     ┌────────┼──────────────┬───────────────┐                     │
//! │    │   found    not found    all data lost    other failure            │
//! │    │  validate   count DNF    quick fail?      mark used                │
//! │    │  store or   N in a row    mark used      invalid++                │
//! │    │  invalid++  ──► day done                                          │
//! │    │              │                                                     │
//! │    └──── persist index + progress, notify listeners                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Stale Day Guard
//! A scan of day 0 that runs past midnight must not insert with the old
//! day's index: readers of the new day would never look there. Every insert
//! checks the index day against the clock first. On a mismatch the pass
//! reloads today's index once and retries; a second mismatch defers the
//! uploads to the next scan.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use fcpboard_core::{
    keys, validation, BacklogCheckpoint, Board, BoardMessage, CoreResult, DayProgress,
    MessageArchive, ProgressStore, ScanKind, SlotIndex, SlotIndexStore, UnsentMessageQueue,
};
use fcpboard_fcp::{GetRequest, GetResult, PutMode, PutOutcome, PutRequest, RetryBudget, TransferClient};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::BoardSyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::pacing::{Pacer, Pause};
use crate::registry::BoardUpdateListener;

/// First day offset a backlog scan may touch. Offsets below it belong to
/// the today scan, which can run at the same time.
pub const FIRST_BACKLOG_OFFSET: u32 = 2;

// =============================================================================
// Stop Token
// =============================================================================

/// Cooperative stop flag shared between a scheduler and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// Everything a scheduler talks to.
#[derive(Clone)]
pub struct SyncContext {
    pub transfer: Arc<dyn TransferClient>,
    pub slots: Arc<dyn SlotIndexStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub archive: Arc<dyn MessageArchive>,
    pub unsent: Arc<dyn UnsentMessageQueue>,
    pub clock: Arc<dyn Clock>,
    pub pacer: Arc<dyn Pacer>,
}

impl SyncContext {
    /// Builds a context whose stores are all backed by one object.
    pub fn from_store<S>(
        transfer: Arc<dyn TransferClient>,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        pacer: Arc<dyn Pacer>,
    ) -> Self
    where
        S: SlotIndexStore + ProgressStore + MessageArchive + UnsentMessageQueue + 'static,
    {
        SyncContext {
            transfer,
            slots: store.clone(),
            progress: store.clone(),
            archive: store.clone(),
            unsent: store,
            clock,
            pacer,
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// What one scheduler run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub kind: ScanKind,
    pub days_scanned: u32,
    pub received: u32,
    pub uploaded: u32,
    /// The stop flag ended the run early.
    pub stopped: bool,
}

impl ScanSummary {
    fn new(kind: ScanKind) -> Self {
        Self {
            kind,
            days_scanned: 0,
            received: 0,
            uploaded: 0,
            stopped: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DayEnd {
    /// Enough consecutive empty slots: nothing more to find today.
    Exhausted,
    Stopped,
}

/// Result of one upload pass over a slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadPass {
    pub uploaded: u32,
    /// The pass stopped because the index no longer bucketed today.
    pub stale_index: bool,
}

enum MessageUpload {
    Inserted,
    /// Left in the queue for a later pass.
    Deferred,
    StaleIndex,
}

// =============================================================================
// Scheduler
// =============================================================================

/// One (board, scan kind) run. Construct, then hand to the registry.
pub struct BoardUpdateScheduler {
    board: Board,
    kind: ScanKind,
    ctx: SyncContext,
    config: Arc<BoardSyncConfig>,
    stop: StopToken,
}

impl BoardUpdateScheduler {
    pub fn new(board: Board, kind: ScanKind, ctx: SyncContext, config: Arc<BoardSyncConfig>) -> Self {
        Self {
            board,
            kind,
            ctx,
            config,
            stop: StopToken::new(),
        }
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Runs the scan on the calling thread.
    pub fn run(&self, listener: &dyn BoardUpdateListener) -> SyncResult<ScanSummary> {
        info!(board = %self.board.name(), kind = %self.kind, "Board update started");
        std::fs::create_dir_all(&self.config.node.work_dir)
            .map_err(|e| SyncError::Io(format!("{}: {}", self.config.node.work_dir.display(), e)))?;

        let mut summary = ScanSummary::new(self.kind);
        match self.kind {
            ScanKind::Today => self.run_today(listener, &mut summary)?,
            ScanKind::Backlog => self.run_backlog(listener, &mut summary)?,
        }
        Ok(summary)
    }

    // =========================================================================
    // Today
    // =========================================================================

    fn run_today(&self, listener: &dyn BoardUpdateListener, summary: &mut ScanSummary) -> SyncResult<()> {
        let today = self.ctx.clock.today();
        for offset in 0..FIRST_BACKLOG_OFFSET {
            if self.stop.is_stopped() {
                summary.stopped = true;
                return Ok(());
            }
            let day = today - Duration::days(i64::from(offset));
            if self.scan_day(day, listener, summary)? == DayEnd::Stopped {
                summary.stopped = true;
                return Ok(());
            }
            if offset == 0 {
                self.upload_after_scan(day, summary)?;
            }
        }
        Ok(())
    }

    fn upload_after_scan(&self, day: NaiveDate, summary: &mut ScanSummary) -> SyncResult<()> {
        if !self.board.can_write() || self.stop.is_stopped() {
            return Ok(());
        }
        self.ctx.pacer.pause(Pause::Upload);

        let index = self.ctx.slots.load_or_create(&self.board.id(), day)?;
        let first = self.upload_pending_messages(index)?;
        summary.uploaded += first.uploaded;
        if !first.stale_index {
            return Ok(());
        }

        let today = self.ctx.clock.today();
        warn!(
            board = %self.board.name(),
            index_day = %day,
            today = %today,
            "Day changed during scan, retrying uploads with today's slot index"
        );
        let fresh = self.ctx.slots.load_or_create(&self.board.id(), today)?;
        let second = self.upload_pending_messages(fresh)?;
        summary.uploaded += second.uploaded;
        if second.stale_index {
            warn!(board = %self.board.name(), "Day changed again, uploads deferred to the next scan");
        }
        Ok(())
    }

    // =========================================================================
    // Backlog
    // =========================================================================

    fn run_backlog(&self, listener: &dyn BoardUpdateListener, summary: &mut ScanSummary) -> SyncResult<()> {
        let board = self.board.id();
        let now = self.ctx.clock.now();
        let (start, end) = self.backlog_range(now)?;
        debug!(board = %board, start, end, "Backlog range");

        self.ctx.progress.set_updating(&board, true)?;
        let scanned = self.scan_backlog(now, start, end, listener, summary);
        let cleared = self.ctx.progress.set_updating(&board, false);
        scanned?;
        cleared?;
        Ok(())
    }

    /// Day offsets to scan, shifted forward when resuming an interrupted run.
    fn backlog_range(&self, now: DateTime<Utc>) -> SyncResult<(u32, u32)> {
        let max_days_back = self.config.backlog.max_days_back;
        let checkpoint = self.ctx.progress.backlog_checkpoint(&self.board.id())?;
        Ok(match checkpoint {
            Some(cp) => {
                let elapsed = (now.date_naive() - cp.recorded_at.date_naive())
                    .num_days()
                    .clamp(0, i64::from(u32::MAX)) as u32;
                (
                    cp.day_offset.saturating_add(elapsed).max(FIRST_BACKLOG_OFFSET),
                    max_days_back.saturating_add(elapsed),
                )
            }
            None => (FIRST_BACKLOG_OFFSET, max_days_back),
        })
    }

    fn scan_backlog(
        &self,
        now: DateTime<Utc>,
        start: u32,
        end: u32,
        listener: &dyn BoardUpdateListener,
        summary: &mut ScanSummary,
    ) -> SyncResult<()> {
        let board = self.board.id();
        let today = now.date_naive();
        for offset in start..=end {
            if self.stop.is_stopped() {
                summary.stopped = true;
                return Ok(());
            }
            self.ctx.progress.set_backlog_checkpoint(
                &board,
                Some(BacklogCheckpoint {
                    day_offset: offset,
                    recorded_at: now,
                }),
            )?;
            let day = today - Duration::days(i64::from(offset));
            if self.scan_day(day, listener, summary)? == DayEnd::Stopped {
                summary.stopped = true;
                return Ok(());
            }
        }
        self.ctx.progress.set_backlog_checkpoint(&board, None)?;
        self.ctx
            .progress
            .set_last_backlog_finished(&board, self.ctx.clock.now())?;
        Ok(())
    }

    // =========================================================================
    // Slot Scan
    // =========================================================================

    fn retry_budget(&self) -> RetryBudget {
        let download = &self.config.download;
        if download.quickly_fail_on_adnf {
            RetryBudget::Bounded(download.max_get_retries.max(1))
        } else {
            RetryBudget::Unbounded
        }
    }

    fn scratch_file(&self, day: NaiveDate, slot: u32) -> PathBuf {
        let name: String = self
            .board
            .filename()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.config.node.work_dir.join(format!(
            "{}-{}-{}-{}.json",
            name,
            self.kind,
            keys::format_day(day),
            slot
        ))
    }

    fn scan_day(
        &self,
        day: NaiveDate,
        listener: &dyn BoardUpdateListener,
        summary: &mut ScanSummary,
    ) -> SyncResult<DayEnd> {
        let board = self.board.id();
        let mut index = self.ctx.slots.load_or_create(&board, day)?;
        let mut progress = self.ctx.progress.load_day(&board, day)?;
        let dnf_limit = self.config.download.dnf_limit();
        let quick_fail = self.config.download.quickly_fail_on_adnf;
        let mut consecutive_dnf = 0;
        let mut slot = index.find_first_download_slot();
        summary.days_scanned += 1;
        debug!(board = %board, day = %day, first_slot = slot, "Scanning day");

        let end = loop {
            if self.stop.is_stopped() {
                break DayEnd::Stopped;
            }
            progress.current_index = Some(slot);
            progress.tried += 1;
            self.ctx.pacer.pause(Pause::Slot);

            let key = keys::compose_download_key(&self.board, day, slot);
            let target = self.scratch_file(day, slot);
            let request = GetRequest::new(key, &target)
                .with_retries(self.retry_budget())
                .with_priority(self.config.download.priority)
                .with_max_size(self.config.download.max_message_size);
            let result = self.ctx.transfer.get(&request);

            let mut day_done = false;
            if result.is_data_not_found() {
                progress.not_found += 1;
                if index.last_hit().map_or(true, |hit| slot >= hit) {
                    consecutive_dnf += 1;
                }
                debug!(board = %board, day = %day, index = slot, consecutive_dnf, "Slot empty");
                day_done = consecutive_dnf >= dnf_limit;
            } else if result.is_all_data_not_found() {
                progress.all_data_missing += 1;
                if quick_fail {
                    index.mark_download_used(slot);
                }
                debug!(board = %board, day = %day, index = slot, skipped = quick_fail, "Slot data lost");
            } else if result.is_success() {
                self.receive(&mut index, &mut progress, &result, &target, slot, summary)?;
                consecutive_dnf = 0;
            } else {
                index.mark_download_used(slot);
                progress.invalid += 1;
                warn!(
                    board = %board,
                    day = %day,
                    index = slot,
                    code = ?result.code,
                    description = ?result.description,
                    "Slot fetch failed"
                );
            }
            let _ = std::fs::remove_file(&target);

            self.ctx.slots.save(&index)?;
            self.ctx.progress.save_day(&progress)?;
            listener.progress_changed(&board, &progress);

            if day_done {
                break DayEnd::Exhausted;
            }
            slot = index.find_next_download_slot(slot);
        };

        progress.current_index = None;
        self.ctx.progress.save_day(&progress)?;
        listener.progress_changed(&board, &progress);
        debug!(board = %board, day = %day, end = ?end, received = progress.received, "Day scanned");
        Ok(end)
    }

    /// Validates and stores a downloaded slot. The slot is consumed either way.
    fn receive(
        &self,
        index: &mut SlotIndex,
        progress: &mut DayProgress,
        result: &GetResult,
        target: &std::path::Path,
        slot: u32,
        summary: &mut ScanSummary,
    ) -> SyncResult<()> {
        let day = index.day();
        index.mark_download_used(slot);

        match self.parse_slot(target, day) {
            Ok(message) => {
                let message_id = message.message_id.clone();
                let added = self.ctx.archive.add_received(&self.board.id(), day, slot, message)?;
                index.record_hit(slot);
                progress.received += 1;
                summary.received += 1;
                info!(
                    board = %self.board.name(),
                    day = %day,
                    index = slot,
                    message_id = %message_id,
                    bytes = ?result.data_length,
                    new = added,
                    "Message received"
                );
            }
            Err(err) => {
                progress.invalid += 1;
                warn!(board = %self.board.name(), day = %day, index = slot, error = %err, "Rejected slot content");
            }
        }
        Ok(())
    }

    fn parse_slot(&self, target: &std::path::Path, day: NaiveDate) -> CoreResult<BoardMessage> {
        let bytes = std::fs::read(target)
            .map_err(|e| fcpboard_core::CoreError::MalformedMessage(e.to_string()))?;
        let message = BoardMessage::from_json(&bytes)?;
        validation::validate_message(&message, &self.board, day)?;
        Ok(message)
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Inserts the board's pending messages into free slots of `index`.
    ///
    /// Messages still waiting for attachment keys are skipped. A message
    /// whose insert fails stays queued for the next pass. Nothing is sent
    /// once `index` no longer buckets today.
    pub fn upload_pending_messages(&self, mut index: SlotIndex) -> SyncResult<UploadPass> {
        let board = self.board.id();
        let mut pass = UploadPass::default();
        let mut skipped = HashSet::new();

        while !self.stop.is_stopped() {
            let Some(message) = self.ctx.unsent.next_pending(&board, None, &skipped)? else {
                break;
            };
            if message.has_pending_attachments() {
                debug!(board = %board, message_id = %message.message_id, "Waiting for attachments");
                skipped.insert(message.message_id);
                continue;
            }
            let message_id = message.message_id.clone();
            match self.upload_message(&mut index, message)? {
                MessageUpload::Inserted => pass.uploaded += 1,
                MessageUpload::Deferred => {
                    skipped.insert(message_id);
                }
                MessageUpload::StaleIndex => {
                    pass.stale_index = true;
                    break;
                }
            }
        }
        Ok(pass)
    }

    fn upload_message(&self, index: &mut SlotIndex, mut message: BoardMessage) -> SyncResult<MessageUpload> {
        let day = index.day();
        let mut slot = index.find_first_upload_slot();
        let mut collisions = 0;

        loop {
            if day != self.ctx.clock.today() {
                return Ok(MessageUpload::StaleIndex);
            }
            let Some(key) = keys::compose_upload_key(&self.board, day, slot) else {
                return Ok(MessageUpload::Deferred);
            };

            message.date = self.ctx.clock.now();
            let source = self
                .config
                .node
                .work_dir
                .join(format!("outgoing-{}.json", message.message_id));
            std::fs::write(&source, message.to_json()?)
                .map_err(|e| SyncError::Io(format!("{}: {}", source.display(), e)))?;

            let result = self.ctx.transfer.put(&self.message_put_request(source.clone(), key));
            let _ = std::fs::remove_file(&source);

            match result.outcome {
                PutOutcome::Success => {
                    index.mark_upload_used(slot);
                    self.ctx.slots.save(index)?;
                    self.ctx.archive.add_sent(&message)?;
                    self.ctx.unsent.remove(&message.message_id)?;
                    info!(
                        board = %self.board.name(),
                        day = %day,
                        index = slot,
                        message_id = %message.message_id,
                        "Message inserted"
                    );
                    return Ok(MessageUpload::Inserted);
                }
                PutOutcome::KeyCollision => {
                    index.mark_upload_used(slot);
                    self.ctx.slots.save(index)?;
                    collisions += 1;
                    debug!(board = %self.board.name(), index = slot, collisions, "Slot already taken");
                    if collisions > self.config.upload.max_collision_retries {
                        warn!(
                            board = %self.board.name(),
                            message_id = %message.message_id,
                            "Too many occupied slots, message stays queued"
                        );
                        return Ok(MessageUpload::Deferred);
                    }
                    slot = index.find_next_upload_slot(slot);
                }
                outcome => {
                    warn!(
                        board = %self.board.name(),
                        message_id = %message.message_id,
                        outcome = ?outcome,
                        description = ?result.description,
                        "Insert failed, message stays queued"
                    );
                    return Ok(MessageUpload::Deferred);
                }
            }
        }
    }

    fn message_put_request(&self, source: PathBuf, key: String) -> PutRequest {
        let upload = &self.config.upload;
        let mut request = PutRequest::new(
            source,
            key,
            PutMode::Insert {
                priority: upload.message_priority,
            },
        )
        .with_extra_inserts(upload.extra_inserts_single_block, upload.extra_inserts_header_block);
        if upload.quick_heal {
            request = request.with_quick_heal();
        }
        if upload.compress {
            request = request.with_compression();
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::NoPacing;
    use crate::registry::NoOpListener;
    use crate::testing::{ManualClock, MockNode, SlotReply};
    use chrono::TimeZone;
    use fcpboard_core::MemoryStore;
    use fcpboard_fcp::{PutResult, PUT_COLLISION};

    struct Fixture {
        node: Arc<MockNode>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        config: BoardSyncConfig,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(node: MockNode, now: DateTime<Utc>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = BoardSyncConfig::default();
            config.node.work_dir = dir.path().to_path_buf();
            Self {
                node: Arc::new(node),
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(ManualClock::new(now)),
                config,
                _dir: dir,
            }
        }

        fn scheduler(&self, board: &Board, kind: ScanKind) -> BoardUpdateScheduler {
            let ctx = SyncContext::from_store(
                self.node.clone(),
                self.store.clone(),
                self.clock.clone(),
                Arc::new(NoPacing),
            );
            BoardUpdateScheduler::new(board.clone(), kind, ctx, Arc::new(self.config.clone()))
        }
    }

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn envelope(board: &Board, date: DateTime<Utc>) -> Vec<u8> {
        BoardMessage::compose(board, "alice", "hello", "body", date)
            .to_json()
            .unwrap()
            .into_bytes()
    }

    fn key(board: &Board, d: NaiveDate, slot: u32) -> String {
        keys::compose_download_key(board, d, slot)
    }

    #[test]
    fn test_failed_slot_marked_used_and_scan_moves_on() {
        let board = Board::public("test");
        let d = day(2024, 1, 1);
        let node = MockNode::new().with_slot(&key(&board, d, 0), SlotReply::Failed(10));
        let fx = Fixture::new(node, noon(2024, 1, 1));

        let scheduler = fx.scheduler(&board, ScanKind::Today);
        assert_eq!(scheduler.scan_day(d, &NoOpListener, &mut ScanSummary::new(ScanKind::Today)).unwrap(), DayEnd::Exhausted);

        let index = fx.store.load_or_create(&board.id(), d).unwrap();
        assert!(index.is_download_used(0));
        let progress = fx.store.load_day(&board.id(), d).unwrap();
        assert_eq!(progress.invalid, 1);
        assert_eq!(progress.current_index, None);

        let keys = fx.node.requested_keys();
        assert_eq!(keys[0], key(&board, d, 0));
        assert_eq!(keys[1], key(&board, d, 1));
    }

    #[test]
    fn test_day_ends_after_consecutive_not_found() {
        let board = Board::public("test");
        let d = day(2024, 1, 1);
        let fx = Fixture::new(MockNode::new(), noon(2024, 1, 1));

        let scheduler = fx.scheduler(&board, ScanKind::Today);
        scheduler.scan_day(d, &NoOpListener, &mut ScanSummary::new(ScanKind::Today)).unwrap();

        assert_eq!(fx.node.requested_keys().len(), 3);
        let progress = fx.store.load_day(&board.id(), d).unwrap();
        assert_eq!(progress.not_found, 3);
        assert_eq!(progress.tried, 3);
        let index = fx.store.load_or_create(&board.id(), d).unwrap();
        assert_eq!(index.used_count(), 0);
    }

    #[test]
    fn test_not_found_limit_is_clamped() {
        let board = Board::public("test");
        let d = day(2024, 1, 1);
        let mut fx = Fixture::new(MockNode::new(), noon(2024, 1, 1));
        fx.config.download.max_dnf_retries = 0;
        fx.scheduler(&board, ScanKind::Today)
            .scan_day(d, &NoOpListener, &mut ScanSummary::new(ScanKind::Today))
            .unwrap();
        assert_eq!(fx.node.requested_keys().len(), 2);

        let mut fx = Fixture::new(MockNode::new(), noon(2024, 1, 1));
        fx.config.download.max_dnf_retries = 99;
        fx.scheduler(&board, ScanKind::Today)
            .scan_day(d, &NoOpListener, &mut ScanSummary::new(ScanKind::Today))
            .unwrap();
        assert_eq!(fx.node.requested_keys().len(), 5);
    }

    #[test]
    fn test_not_found_below_last_hit_does_not_count() {
        let board = Board::public("test");
        let d = day(2024, 1, 1);
        let node = MockNode::new().with_slot(&key(&board, d, 5), SlotReply::Data(envelope(&board, noon(2024, 1, 1))));
        let fx = Fixture::new(node, noon(2024, 1, 1));

        // an earlier pass already found a message at slot 5
        let mut index = SlotIndex::new(board.id(), d);
        index.record_hit(5);
        fx.store.save(&index).unwrap();

        fx.scheduler(&board, ScanKind::Today)
            .scan_day(d, &NoOpListener, &mut ScanSummary::new(ScanKind::Today))
            .unwrap();

        // slots 0..=4 are empty but below the hit, 5 delivers, 6..=8 end the day
        assert_eq!(fx.node.requested_keys().len(), 9);
        let index = fx.store.load_or_create(&board.id(), d).unwrap();
        assert!(index.is_download_used(5));
        assert_eq!(index.used_count(), 1);
    }

    #[test]
    fn test_scan_never_revisits_used_slots() {
        let board = Board::public("test");
        let d = day(2024, 1, 1);
        let fx = Fixture::new(MockNode::new(), noon(2024, 1, 1));
        let mut index = SlotIndex::new(board.id(), d);
        for used in [0, 1, 3] {
            index.mark_download_used(used);
        }
        fx.store.save(&index).unwrap();

        fx.scheduler(&board, ScanKind::Today)
            .scan_day(d, &NoOpListener, &mut ScanSummary::new(ScanKind::Today))
            .unwrap();

        assert_eq!(
            fx.node.requested_keys(),
            vec![key(&board, d, 2), key(&board, d, 4), key(&board, d, 5)]
        );
    }

    #[test]
    fn test_valid_message_is_stored() {
        let board = Board::public("test");
        let d = day(2024, 1, 1);
        let node = MockNode::new().with_slot(&key(&board, d, 0), SlotReply::Data(envelope(&board, noon(2024, 1, 1))));
        let fx = Fixture::new(node, noon(2024, 1, 1));

        let mut summary = ScanSummary::new(ScanKind::Today);
        fx.scheduler(&board, ScanKind::Today)
            .scan_day(d, &NoOpListener, &mut summary)
            .unwrap();

        assert_eq!(summary.received, 1);
        let received = fx.store.received().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].index, 0);
        assert_eq!(received[0].day, d);

        let index = fx.store.load_or_create(&board.id(), d).unwrap();
        assert_eq!(index.last_hit(), Some(0));
        assert_eq!(fx.store.load_day(&board.id(), d).unwrap().received, 1);
        // scratch files do not pile up
        assert_eq!(std::fs::read_dir(&fx.config.node.work_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_messages_are_counted_not_stored() {
        let board = Board::public("test");
        let d = day(2024, 1, 1);
        let wrong_board = envelope(&Board::public("elsewhere"), noon(2024, 1, 1));
        let wrong_date = envelope(&board, noon(2023, 6, 1));
        let node = MockNode::new()
            .with_slot(&key(&board, d, 0), SlotReply::Data(wrong_board))
            .with_slot(&key(&board, d, 1), SlotReply::Data(wrong_date))
            .with_slot(&key(&board, d, 2), SlotReply::Data(b"not json".to_vec()));
        let fx = Fixture::new(node, noon(2024, 1, 1));

        fx.scheduler(&board, ScanKind::Today)
            .scan_day(d, &NoOpListener, &mut ScanSummary::new(ScanKind::Today))
            .unwrap();

        assert!(fx.store.received().unwrap().is_empty());
        let progress = fx.store.load_day(&board.id(), d).unwrap();
        assert_eq!(progress.invalid, 3);
        let index = fx.store.load_or_create(&board.id(), d).unwrap();
        assert!((0..3).all(|slot| index.is_download_used(slot)));
        assert_eq!(index.last_hit(), None);
    }

    #[test]
    fn test_all_data_not_found_policy() {
        let board = Board::public("test");
        let d = day(2024, 1, 1);
        let node = || MockNode::new().with_slot(&key(&board, d, 0), SlotReply::AllDataNotFound);

        let fx = Fixture::new(node(), noon(2024, 1, 1));
        fx.scheduler(&board, ScanKind::Today)
            .scan_day(d, &NoOpListener, &mut ScanSummary::new(ScanKind::Today))
            .unwrap();
        let index = fx.store.load_or_create(&board.id(), d).unwrap();
        assert!(!index.is_download_used(0));
        assert_eq!(fx.store.load_day(&board.id(), d).unwrap().all_data_missing, 1);
        assert!(fx.node.gets().iter().all(|r| r.retries == RetryBudget::Unbounded));

        let mut fx = Fixture::new(node(), noon(2024, 1, 1));
        fx.config.download.quickly_fail_on_adnf = true;
        fx.scheduler(&board, ScanKind::Today)
            .scan_day(d, &NoOpListener, &mut ScanSummary::new(ScanKind::Today))
            .unwrap();
        let index = fx.store.load_or_create(&board.id(), d).unwrap();
        assert!(index.is_download_used(0));
        assert!(fx.node.gets().iter().all(|r| r.retries == RetryBudget::Bounded(2)));
    }

    #[test]
    fn test_today_scans_two_days_then_uploads() {
        let board = Board::public("test");
        let fx = Fixture::new(MockNode::new(), noon(2024, 1, 2));
        let message = BoardMessage::compose(&board, "bob", "hi", "text", noon(2024, 1, 2));
        fx.store.queue_unsent(message.clone()).unwrap();

        let summary = fx.scheduler(&board, ScanKind::Today).run(&NoOpListener).unwrap();

        assert_eq!(summary.days_scanned, 2);
        assert_eq!(summary.uploaded, 1);
        assert!(!summary.stopped);

        let keys = fx.node.requested_keys();
        assert!(keys[..3].iter().all(|k| k.contains("2024.1.2-")));
        assert!(keys[3..].iter().all(|k| k.contains("2024.1.1-")));

        let puts = fx.node.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0.key, keys::compose_upload_key(&board, day(2024, 1, 2), 0).unwrap());
        let sent = BoardMessage::from_json(&puts[0].1).unwrap();
        assert_eq!(sent.message_id, message.message_id);

        assert!(fx.store.unsent().unwrap().is_empty());
        assert_eq!(fx.store.sent().unwrap().len(), 1);
        let index = fx.store.load_or_create(&board.id(), day(2024, 1, 2)).unwrap();
        assert!(index.is_download_used(0));
    }

    #[test]
    fn test_upload_skips_collisions_and_waiting_messages() {
        let board = Board::public("test");
        let node = MockNode::new()
            .with_put_reply(PutResult::from_failure(Some(PUT_COLLISION), "collision"))
            .with_put_reply(PutResult::from_failure(Some(PUT_COLLISION), "collision"));
        let fx = Fixture::new(node, noon(2024, 1, 1));

        let mut waiting = BoardMessage::compose(&board, "bob", "files", "see attached", noon(2024, 1, 1));
        waiting.attachments.push(fcpboard_core::Attachment {
            file_name: "a.bin".into(),
            size: 3,
            key: None,
            local_path: Some("/tmp/a.bin".into()),
        });
        let ready = BoardMessage::compose(&board, "bob", "plain", "text", noon(2024, 1, 1));
        fx.store.queue_unsent(waiting.clone()).unwrap();
        fx.store.queue_unsent(ready.clone()).unwrap();

        let scheduler = fx.scheduler(&board, ScanKind::Today);
        let index = SlotIndex::new(board.id(), day(2024, 1, 1));
        let pass = scheduler.upload_pending_messages(index).unwrap();

        assert_eq!(pass, UploadPass { uploaded: 1, stale_index: false });
        let put_keys: Vec<_> = fx.node.puts().into_iter().map(|(r, _)| r.key).collect();
        assert_eq!(put_keys.len(), 3);
        assert!(put_keys[2].ends_with("2024.1.1-2.json"));

        let unsent = fx.store.unsent().unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].message_id, waiting.message_id);
        let index = fx.store.load_or_create(&board.id(), day(2024, 1, 1)).unwrap();
        assert!((0..3).all(|slot| index.is_download_used(slot)));
    }

    #[test]
    fn test_failed_insert_keeps_message_queued() {
        let board = Board::public("test");
        let node = MockNode::new().with_put_reply(PutResult::error("node busy"));
        let fx = Fixture::new(node, noon(2024, 1, 1));
        fx.store
            .queue_unsent(BoardMessage::compose(&board, "bob", "s", "b", noon(2024, 1, 1)))
            .unwrap();

        let pass = fx
            .scheduler(&board, ScanKind::Today)
            .upload_pending_messages(SlotIndex::new(board.id(), day(2024, 1, 1)))
            .unwrap();

        assert_eq!(pass.uploaded, 0);
        assert_eq!(fx.node.puts().len(), 1);
        assert_eq!(fx.store.unsent().unwrap().len(), 1);
        assert!(fx.store.sent().unwrap().is_empty());
    }

    #[test]
    fn test_stale_index_sends_nothing() {
        let board = Board::public("test");
        let fx = Fixture::new(MockNode::new(), noon(2024, 1, 2));
        fx.store
            .queue_unsent(BoardMessage::compose(&board, "bob", "s", "b", noon(2024, 1, 1)))
            .unwrap();

        let pass = fx
            .scheduler(&board, ScanKind::Today)
            .upload_pending_messages(SlotIndex::new(board.id(), day(2024, 1, 1)))
            .unwrap();

        assert!(pass.stale_index);
        assert!(fx.node.puts().is_empty());
        assert_eq!(fx.store.unsent().unwrap().len(), 1);
    }

    #[test]
    fn test_midnight_crossing_uploads_with_fresh_index() {
        let board = Board::public("test");
        let late = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 50).unwrap();
        let clock = Arc::new(ManualClock::new(late));
        let hook_clock = clock.clone();
        let node = MockNode::new().on_get(move |request| {
            // the third probe of day 0 happens after midnight
            if request.key.ends_with("2024.1.1-2.json") {
                hook_clock.set(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 5).unwrap());
            }
        });
        let mut fx = Fixture::new(node, late);
        fx.clock = clock;
        fx.store
            .queue_unsent(BoardMessage::compose(&board, "bob", "s", "b", late))
            .unwrap();

        let summary = fx.scheduler(&board, ScanKind::Today).run(&NoOpListener).unwrap();

        assert_eq!(summary.uploaded, 1);
        let puts = fx.node.puts();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].0.key.contains("2024.1.2-0"));
        let sent = BoardMessage::from_json(&puts[0].1).unwrap();
        assert_eq!(sent.date.date_naive(), day(2024, 1, 2));
        let fresh = fx.store.load_or_create(&board.id(), day(2024, 1, 2)).unwrap();
        assert!(fresh.is_download_used(0));
    }

    #[test]
    fn test_read_only_board_never_uploads() {
        let board = Board::access_controlled("team", "SSK@pub", None);
        let fx = Fixture::new(MockNode::new(), noon(2024, 1, 1));
        fx.store
            .queue_unsent(BoardMessage::compose(&board, "bob", "s", "b", noon(2024, 1, 1)))
            .unwrap();

        fx.scheduler(&board, ScanKind::Today).run(&NoOpListener).unwrap();

        assert!(fx.node.puts().is_empty());
        assert!(fx.node.requested_keys()[0].starts_with("SSK@pub/"));
    }

    #[test]
    fn test_stop_before_run_scans_nothing() {
        let board = Board::public("test");
        let fx = Fixture::new(MockNode::new(), noon(2024, 1, 1));
        let scheduler = fx.scheduler(&board, ScanKind::Today);
        scheduler.stop_token().stop();

        let summary = scheduler.run(&NoOpListener).unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.days_scanned, 0);
        assert!(fx.node.requested_keys().is_empty());
    }

    #[test]
    fn test_stop_mid_day_finalizes_progress() {
        let board = Board::public("test");
        let fx = Fixture::new(MockNode::new(), noon(2024, 1, 1));
        let scheduler = fx.scheduler(&board, ScanKind::Today);
        let stop = scheduler.stop_token();

        struct StopAfterFirst(StopToken);
        impl BoardUpdateListener for StopAfterFirst {
            fn progress_changed(&self, _board: &fcpboard_core::BoardId, _progress: &DayProgress) {
                self.0.stop();
            }
        }

        let summary = scheduler.run(&StopAfterFirst(stop)).unwrap();
        assert!(summary.stopped);
        assert_eq!(fx.node.requested_keys().len(), 1);
        let progress = fx.store.load_day(&board.id(), day(2024, 1, 1)).unwrap();
        assert_eq!(progress.tried, 1);
        assert_eq!(progress.current_index, None);
    }

    #[test]
    fn test_backlog_scans_range_and_records_completion() {
        let board = Board::public("test");
        let mut fx = Fixture::new(MockNode::new(), noon(2024, 1, 10));
        fx.config.backlog.max_days_back = 4;

        let summary = fx.scheduler(&board, ScanKind::Backlog).run(&NoOpListener).unwrap();

        // today and yesterday are left to the today scan
        assert_eq!(summary.days_scanned, 3);
        let keys = fx.node.requested_keys();
        assert!(keys[0].contains("2024.1.8-"));
        assert!(keys.iter().all(|k| !k.contains("2024.1.9-") && !k.contains("2024.1.10-")));
        assert!(keys.last().unwrap().contains("2024.1.6-"));
        assert!(fx.store.backlog_checkpoint(&board.id()).unwrap().is_none());
        assert_eq!(
            fx.store.last_backlog_finished(&board.id()).unwrap(),
            Some(noon(2024, 1, 10))
        );
        assert!(!fx.store.is_updating(&board.id()).unwrap());
    }

    #[test]
    fn test_backlog_resumes_shifted_by_elapsed_days() {
        let board = Board::public("test");
        let mut fx = Fixture::new(MockNode::new(), noon(2024, 1, 10));
        fx.config.backlog.max_days_back = 5;
        fx.store
            .set_backlog_checkpoint(
                &board.id(),
                Some(BacklogCheckpoint {
                    day_offset: 3,
                    recorded_at: noon(2024, 1, 8),
                }),
            )
            .unwrap();

        let summary = fx.scheduler(&board, ScanKind::Backlog).run(&NoOpListener).unwrap();

        // interrupted at Jan 5 (offset 3 from Jan 8); resumes there, ends at Jan 3
        assert_eq!(summary.days_scanned, 3);
        let keys = fx.node.requested_keys();
        assert!(keys[0].contains("2024.1.5-"));
        assert!(keys.last().unwrap().contains("2024.1.3-"));
    }

    #[test]
    fn test_resumed_backlog_stays_clear_of_today_scan() {
        let board = Board::public("test");
        let mut fx = Fixture::new(MockNode::new(), noon(2024, 1, 10));
        fx.config.backlog.max_days_back = 3;
        fx.store
            .set_backlog_checkpoint(
                &board.id(),
                Some(BacklogCheckpoint {
                    day_offset: 0,
                    recorded_at: noon(2024, 1, 10),
                }),
            )
            .unwrap();

        let summary = fx.scheduler(&board, ScanKind::Backlog).run(&NoOpListener).unwrap();

        assert_eq!(summary.days_scanned, 2);
        let keys = fx.node.requested_keys();
        assert!(keys[0].contains("2024.1.8-"));
        assert!(keys.last().unwrap().contains("2024.1.7-"));
    }

    #[test]
    fn test_interrupted_backlog_leaves_checkpoint() {
        let board = Board::public("test");
        let fx = Fixture::new(MockNode::new(), noon(2024, 1, 10));
        let scheduler = fx.scheduler(&board, ScanKind::Backlog);
        let stop = scheduler.stop_token();

        struct StopOnSecondDay(StopToken);
        impl BoardUpdateListener for StopOnSecondDay {
            fn progress_changed(&self, _board: &fcpboard_core::BoardId, progress: &DayProgress) {
                if progress.day == NaiveDate::from_ymd_opt(2024, 1, 8).unwrap() {
                    self.0.stop();
                }
            }
        }

        let summary = scheduler.run(&StopOnSecondDay(stop)).unwrap();
        assert!(summary.stopped);
        let checkpoint = fx.store.backlog_checkpoint(&board.id()).unwrap().unwrap();
        assert_eq!(checkpoint.day_offset, 2);
        assert_eq!(checkpoint.recorded_at, noon(2024, 1, 10));
        assert!(fx.store.last_backlog_finished(&board.id()).unwrap().is_none());
        assert!(!fx.store.is_updating(&board.id()).unwrap());
    }

    #[test]
    fn test_requests_carry_download_settings() {
        let board = Board::public("test");
        let fx = Fixture::new(MockNode::new(), noon(2024, 1, 1));
        fx.scheduler(&board, ScanKind::Today)
            .scan_day(day(2024, 1, 1), &NoOpListener, &mut ScanSummary::new(ScanKind::Today))
            .unwrap();

        let request = &fx.node.gets()[0];
        assert_eq!(request.priority, Some(fx.config.download.priority));
        assert_eq!(request.max_size, Some(fx.config.download.max_message_size));
        assert!(request.target.starts_with(&fx.config.node.work_dir));
    }
}
