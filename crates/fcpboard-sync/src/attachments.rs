//! # Attachment Upload Queue
//!
//! One worker thread inserts attachment files in submission order.
//!
//! ## Job Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Attachment Job Lifecycle                           │
//! │                                                                         │
//! │  enqueue ──► [ FIFO ] ──► worker dequeues (in flight)                  │
//! │                 ▲                │                                      │
//! │                 │            pause(Attachment)                          │
//! │                 │                │                                      │
//! │                 │         deleted? ──yes──► drop                        │
//! │                 │                │ no                                   │
//! │                 │         file gone? ──yes──► notify user, drop         │
//! │                 │                │ no                                   │
//! │                 │               put                                     │
//! │                 │           ┌────┴────┐                                 │
//! │                 └─ failed ──┘         └── ok ──► record key             │
//! │                  (tail)                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `message_deleted` removes queued jobs of a message and flags the one in
//! flight, so a deletion that races the worker still prevents the upload
//! unless the put has already started.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use fcpboard_core::AttachmentStore;
use fcpboard_fcp::{PutMode, PutOutcome, PutRequest, TransferClient};
use tracing::{debug, error, info, warn};

use crate::config::UploadSettings;
use crate::error::{SyncError, SyncResult};
use crate::pacing::{Pacer, Pause};

/// Consecutive job errors after which the worker gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

// =============================================================================
// Collaborators
// =============================================================================

/// Tells the user about conditions only they can fix.
pub trait UserNotifier: Send + Sync {
    /// A file queued for upload no longer exists.
    fn upload_file_missing(&self, message_id: &str, file: &Path);
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl UserNotifier for LogNotifier {
    fn upload_file_missing(&self, message_id: &str, file: &Path) {
        warn!(message_id = %message_id, file = %file.display(), "Attachment file vanished, upload cancelled");
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// A file waiting to be inserted for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentJob {
    pub message_id: String,
    pub file: PathBuf,
}

impl AttachmentJob {
    pub fn new(message_id: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            message_id: message_id.into(),
            file: file.into(),
        }
    }
}

#[derive(Debug)]
struct QueuedJob {
    job: AttachmentJob,
    deleted: AtomicBool,
}

enum JobOutcome {
    Uploaded,
    /// Put failed; try again later.
    Failed,
    Dropped,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Arc<QueuedJob>>,
    in_flight: Option<Arc<QueuedJob>>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    transfer: Arc<dyn TransferClient>,
    store: Arc<dyn AttachmentStore>,
    notifier: Arc<dyn UserNotifier>,
    pacer: Arc<dyn Pacer>,
    upload: UploadSettings,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a job is available. `None` once shut down.
    fn next_job(&self) -> Option<Arc<QueuedJob>> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(job) = state.jobs.pop_front() {
                state.in_flight = Some(Arc::clone(&job));
                return Some(job);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self, job: Arc<QueuedJob>, requeue: bool) {
        let mut state = self.lock();
        state.in_flight = None;
        if requeue && !job.deleted.load(Ordering::SeqCst) {
            state.jobs.push_back(job);
        }
    }

    fn process(&self, queued: &QueuedJob) -> SyncResult<JobOutcome> {
        let job = &queued.job;
        if queued.deleted.load(Ordering::SeqCst) {
            debug!(message_id = %job.message_id, file = %job.file.display(), "Message deleted, attachment dropped");
            return Ok(JobOutcome::Dropped);
        }
        if !job.file.is_file() {
            self.notifier.upload_file_missing(&job.message_id, &job.file);
            return Ok(JobOutcome::Dropped);
        }

        let mut request = PutRequest::new(
            &job.file,
            "CHK@",
            PutMode::Insert {
                priority: self.upload.file_priority,
            },
        );
        if let Some(name) = job.file.file_name() {
            request = request.with_target_filename(name.to_string_lossy());
        }

        let result = self.transfer.put(&request);
        match (result.outcome, result.key) {
            (PutOutcome::Success, Some(key)) => {
                if queued.deleted.load(Ordering::SeqCst) {
                    debug!(message_id = %job.message_id, "Message deleted during upload, key discarded");
                    return Ok(JobOutcome::Dropped);
                }
                self.store.attachment_uploaded(&job.message_id, &job.file, &key)?;
                info!(message_id = %job.message_id, file = %job.file.display(), key = %key, "Attachment uploaded");
                Ok(JobOutcome::Uploaded)
            }
            (outcome, _) => {
                warn!(
                    message_id = %job.message_id,
                    file = %job.file.display(),
                    outcome = ?outcome,
                    description = ?result.description,
                    "Attachment upload failed, requeued"
                );
                Ok(JobOutcome::Failed)
            }
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// FIFO of attachment uploads drained by a single worker thread.
pub struct AttachmentUploadQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AttachmentUploadQueue {
    pub fn new(
        transfer: Arc<dyn TransferClient>,
        store: Arc<dyn AttachmentStore>,
        notifier: Arc<dyn UserNotifier>,
        pacer: Arc<dyn Pacer>,
        upload: UploadSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                available: Condvar::new(),
                transfer,
                store,
                notifier,
                pacer,
                upload,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the worker thread. Does nothing if it is already running.
    pub fn start(&self) -> SyncResult<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        if self.shared.lock().shutdown {
            return Err(SyncError::ShuttingDown);
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("attachment-upload".into())
            .spawn(move || run_worker(shared))
            .map_err(|err| SyncError::ThreadSpawn {
                name: "attachment-upload".into(),
                reason: err.to_string(),
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Appends a job to the queue.
    pub fn enqueue(&self, job: AttachmentJob) -> SyncResult<()> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(SyncError::ShuttingDown);
        }
        debug!(message_id = %job.message_id, file = %job.file.display(), "Attachment queued");
        state.jobs.push_back(Arc::new(QueuedJob {
            job,
            deleted: AtomicBool::new(false),
        }));
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Drops every job of a deleted message, including the one in flight.
    /// Returns how many jobs were affected.
    pub fn message_deleted(&self, message_id: &str) -> usize {
        let mut state = self.shared.lock();
        let before = state.jobs.len();
        state.jobs.retain(|queued| queued.job.message_id != message_id);
        let mut affected = before - state.jobs.len();
        if let Some(in_flight) = &state.in_flight {
            if in_flight.job.message_id == message_id {
                in_flight.deleted.store(true, Ordering::SeqCst);
                affected += 1;
            }
        }
        if affected > 0 {
            debug!(message_id = %message_id, jobs = affected, "Attachment jobs cancelled");
        }
        affected
    }

    /// Jobs waiting, not counting the one in flight.
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the worker after its current job and waits for it.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.available.notify_all();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Attachment worker panicked");
            }
        }
    }
}

impl Drop for AttachmentUploadQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<Shared>) {
    info!("Attachment upload worker started");
    let mut consecutive_errors = 0;

    while let Some(job) = shared.next_job() {
        shared.pacer.pause(Pause::Attachment);
        match shared.process(&job) {
            Ok(outcome) => {
                consecutive_errors = 0;
                shared.finish(job, matches!(outcome, JobOutcome::Failed));
            }
            Err(err) => {
                consecutive_errors += 1;
                error!(
                    message_id = %job.job.message_id,
                    error = %err,
                    consecutive_errors,
                    "Attachment job failed"
                );
                shared.finish(job, false);
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!("Too many consecutive attachment errors, worker stopping");
                    break;
                }
            }
        }
    }
    info!("Attachment upload worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::NoPacing;
    use crate::testing::{GatedPacer, MockNode};
    use chrono::Utc;
    use fcpboard_core::{Attachment, Board, BoardMessage, CoreError, CoreResult, MemoryStore};
    use fcpboard_fcp::PutResult;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn message_with(files: &[&Path]) -> BoardMessage {
        let mut message = BoardMessage::compose(&Board::public("test"), "bob", "files", "", Utc::now());
        for file in files {
            message.attachments.push(Attachment {
                file_name: file.file_name().unwrap().to_string_lossy().into_owned(),
                size: 3,
                key: None,
                local_path: Some(file.to_path_buf()),
            });
        }
        message
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<PathBuf>>);

    impl UserNotifier for RecordingNotifier {
        fn upload_file_missing(&self, _message_id: &str, file: &Path) {
            self.0.lock().unwrap().push(file.to_path_buf());
        }
    }

    struct BrokenStore;

    impl AttachmentStore for BrokenStore {
        fn attachment_uploaded(&self, _message_id: &str, _file: &Path, _key: &str) -> CoreResult<()> {
            Err(CoreError::Store("disk full".into()))
        }
    }

    #[test]
    fn test_uploads_in_order_and_records_keys() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"aaa").unwrap();
        std::fs::write(&b, b"bbb").unwrap();

        let store = Arc::new(MemoryStore::new());
        let message = message_with(&[&a, &b]);
        store.queue_unsent(message.clone()).unwrap();
        let node = Arc::new(MockNode::new());

        let queue = AttachmentUploadQueue::new(
            node.clone(),
            store.clone(),
            Arc::new(LogNotifier),
            Arc::new(NoPacing),
            UploadSettings::default(),
        );
        queue.enqueue(AttachmentJob::new(&message.message_id, &a)).unwrap();
        queue.enqueue(AttachmentJob::new(&message.message_id, &b)).unwrap();
        queue.start().unwrap();

        wait_until("both uploads", || {
            store.unsent().unwrap()[0].attachments.iter().all(|a| a.key.is_some())
        });
        queue.shutdown();

        let puts = node.puts();
        assert_eq!(puts[0].0.source, a);
        assert_eq!(puts[1].0.source, b);
        assert_eq!(puts[0].0.key, "CHK@");
        assert!(!puts[0].0.compress);
        assert!(puts[0].0.crypto_key.is_none());
        assert!(!store.unsent().unwrap()[0].has_pending_attachments());
    }

    #[test]
    fn test_failed_upload_moves_to_tail() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"aaa").unwrap();
        std::fs::write(&b, b"bbb").unwrap();

        let store = Arc::new(MemoryStore::new());
        let message = message_with(&[&a, &b]);
        store.queue_unsent(message.clone()).unwrap();
        let node = Arc::new(MockNode::new().with_put_reply(PutResult::error("node busy")));

        let queue = AttachmentUploadQueue::new(
            node.clone(),
            store.clone(),
            Arc::new(LogNotifier),
            Arc::new(NoPacing),
            UploadSettings::default(),
        );
        queue.enqueue(AttachmentJob::new(&message.message_id, &a)).unwrap();
        queue.enqueue(AttachmentJob::new(&message.message_id, &b)).unwrap();
        queue.start().unwrap();

        wait_until("retry", || node.puts().len() == 3);
        queue.shutdown();

        let order: Vec<_> = node.puts().into_iter().map(|(r, _)| r.source).collect();
        assert_eq!(order, vec![a, b.clone(), dir.path().join("a.txt")]);
    }

    #[test]
    fn test_missing_file_notifies_and_drops() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone.txt");
        let notifier = Arc::new(RecordingNotifier::default());
        let node = Arc::new(MockNode::new());

        let queue = AttachmentUploadQueue::new(
            node.clone(),
            Arc::new(MemoryStore::new()),
            notifier.clone(),
            Arc::new(NoPacing),
            UploadSettings::default(),
        );
        queue.start().unwrap();
        queue.enqueue(AttachmentJob::new("message-1", &gone)).unwrap();

        wait_until("notification", || !notifier.0.lock().unwrap().is_empty());
        queue.shutdown();

        assert_eq!(notifier.0.lock().unwrap()[0], gone);
        assert!(node.puts().is_empty());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_deleted_message_never_uploads_even_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"aaa").unwrap();
        std::fs::write(&b, b"bbb").unwrap();

        let pacer = Arc::new(GatedPacer::default());
        let node = Arc::new(MockNode::new());
        let queue = AttachmentUploadQueue::new(
            node.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(LogNotifier),
            pacer.clone(),
            UploadSettings::default(),
        );
        queue.enqueue(AttachmentJob::new("doomed", &a)).unwrap();
        queue.enqueue(AttachmentJob::new("doomed", &b)).unwrap();
        queue.start().unwrap();

        // first job is dequeued and held in the pause
        pacer.wait_for_waiter();
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.message_deleted("doomed"), 2);
        assert_eq!(queue.pending(), 0);

        pacer.open();
        wait_until("in-flight job released", || queue.shared.lock().in_flight.is_none());
        queue.shutdown();

        assert!(node.puts().is_empty());
    }

    #[test]
    fn test_worker_stops_after_consecutive_errors() {
        let dir = tempfile::tempdir().unwrap();
        let queue = AttachmentUploadQueue::new(
            Arc::new(MockNode::new()),
            Arc::new(BrokenStore),
            Arc::new(LogNotifier),
            Arc::new(NoPacing),
            UploadSettings::default(),
        );
        for i in 0..7 {
            let file = dir.path().join(format!("{i}.txt"));
            std::fs::write(&file, b"x").unwrap();
            queue.enqueue(AttachmentJob::new(format!("message-{i}"), file)).unwrap();
        }
        queue.start().unwrap();

        wait_until("worker exit", || !queue.is_running());
        assert_eq!(queue.pending(), 2);
    }

    #[test]
    fn test_enqueue_after_shutdown_is_refused() {
        let queue = AttachmentUploadQueue::new(
            Arc::new(MockNode::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(LogNotifier),
            Arc::new(NoPacing),
            UploadSettings::default(),
        );
        queue.start().unwrap();
        queue.shutdown();

        assert!(!queue.is_running());
        assert!(matches!(
            queue.enqueue(AttachmentJob::new("m", "/tmp/x")),
            Err(SyncError::ShuttingDown)
        ));
        assert!(matches!(queue.start(), Err(SyncError::ShuttingDown)));
    }
}
