//! # Scheduler Registry
//!
//! Tracks the scheduler threads running per board and fans their events
//! out to listeners.
//!
//! ## Notification Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Event Fan-out                                      │
//! │                                                                         │
//! │  scheduler thread ──► registry ──► snapshot(listeners) ──► release lock │
//! │                                        │                                │
//! │                                        ├─► global listeners (in order) │
//! │                                        └─► board listeners  (in order) │
//! │                                                                         │
//! │  Listeners run on the scheduler thread without the registry lock, so   │
//! │  they may add listeners or stop boards from inside a callback.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use fcpboard_core::{BoardId, DayProgress, ScanKind};
use tracing::{debug, error, info};

use crate::error::{SyncError, SyncResult};
use crate::scheduler::{BoardUpdateScheduler, ScanSummary, StopToken};

// =============================================================================
// Listener
// =============================================================================

/// Observer of board update threads. Every method defaults to doing nothing.
pub trait BoardUpdateListener: Send + Sync {
    fn thread_started(&self, _board: &BoardId, _kind: ScanKind) {}

    fn thread_finished(&self, _board: &BoardId, _kind: ScanKind) {}

    /// Called after every slot outcome, once the progress is persisted.
    fn progress_changed(&self, _board: &BoardId, _progress: &DayProgress) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpListener;

impl BoardUpdateListener for NoOpListener {}

// =============================================================================
// Registry
// =============================================================================

/// Join handle of a spawned scan.
pub type ScanHandle = JoinHandle<SyncResult<ScanSummary>>;

struct RunningScan {
    id: u64,
    kind: ScanKind,
    stop: StopToken,
}

#[derive(Default)]
struct RegistryState {
    running: HashMap<BoardId, Vec<RunningScan>>,
    global: Vec<Arc<dyn BoardUpdateListener>>,
    per_board: HashMap<BoardId, Vec<Arc<dyn BoardUpdateListener>>>,
    next_id: u64,
}

/// Running scheduler threads and their listeners, keyed by board.
#[derive(Default)]
pub struct SchedulerRegistry {
    state: Mutex<RegistryState>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a listener notified for every board.
    pub fn add_listener(&self, listener: Arc<dyn BoardUpdateListener>) {
        self.lock().global.push(listener);
    }

    /// Adds a listener notified for one board only.
    pub fn add_board_listener(&self, board: &BoardId, listener: Arc<dyn BoardUpdateListener>) {
        self.lock()
            .per_board
            .entry(board.clone())
            .or_default()
            .push(listener);
    }

    /// Starts `scheduler` on its own thread.
    pub fn spawn(self: &Arc<Self>, scheduler: BoardUpdateScheduler) -> SyncResult<ScanHandle> {
        let board = scheduler.board().id();
        let kind = scheduler.kind();
        let name = format!("board-{}-{}", board, kind);

        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.running.entry(board.clone()).or_default().push(RunningScan {
                id,
                kind,
                stop: scheduler.stop_token(),
            });
            id
        };
        self.notify(&board, |l| l.thread_started(&board, kind));

        let registry = Arc::clone(self);
        let thread_board = board.clone();
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            // Deregisters the scan even when a listener or the scan panics.
            let _finish = FinishGuard {
                registry: Arc::clone(&registry),
                board: thread_board.clone(),
                id,
                kind,
            };
            let result = scheduler.run(registry.as_ref());
            match &result {
                Ok(summary) => info!(
                    board = %thread_board,
                    kind = %kind,
                    days = summary.days_scanned,
                    received = summary.received,
                    uploaded = summary.uploaded,
                    stopped = summary.stopped,
                    "Board update finished"
                ),
                Err(err) => error!(board = %thread_board, kind = %kind, error = %err, "Board update failed"),
            }
            result
        });

        spawned.map_err(|err| {
            self.finish(&board, id, kind);
            SyncError::ThreadSpawn {
                name,
                reason: err.to_string(),
            }
        })
    }

    fn finish(&self, board: &BoardId, id: u64, kind: ScanKind) {
        {
            let mut state = self.lock();
            if let Some(scans) = state.running.get_mut(board) {
                scans.retain(|scan| scan.id != id);
                if scans.is_empty() {
                    state.running.remove(board);
                }
            }
        }
        self.notify(board, |l| l.thread_finished(board, kind));
    }

    /// Sets the stop flag of every thread running for `board`. Returns how
    /// many were signalled.
    pub fn stop_board(&self, board: &BoardId) -> usize {
        let state = self.lock();
        let scans = state.running.get(board).map(Vec::as_slice).unwrap_or_default();
        for scan in scans {
            scan.stop.stop();
        }
        debug!(board = %board, threads = scans.len(), "Stop requested");
        scans.len()
    }

    /// Sets the stop flag of every running thread.
    pub fn stop_all(&self) -> usize {
        let state = self.lock();
        let mut stopped = 0;
        for scan in state.running.values().flatten() {
            scan.stop.stop();
            stopped += 1;
        }
        stopped
    }

    /// Total running scheduler threads.
    pub fn running_count(&self) -> usize {
        self.lock().running.values().map(Vec::len).sum()
    }

    /// Boards with at least one running thread.
    pub fn updating_board_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn is_updating(&self, board: &BoardId) -> bool {
        self.lock().running.contains_key(board)
    }

    /// Whether a scan of `kind` is running for `board`.
    pub fn is_running(&self, board: &BoardId, kind: ScanKind) -> bool {
        self.lock()
            .running
            .get(board)
            .is_some_and(|scans| scans.iter().any(|scan| scan.kind == kind))
    }

    /// Global listeners first, then the board's own.
    fn snapshot(&self, board: &BoardId) -> Vec<Arc<dyn BoardUpdateListener>> {
        let state = self.lock();
        let mut listeners = state.global.clone();
        if let Some(own) = state.per_board.get(board) {
            listeners.extend(own.iter().cloned());
        }
        listeners
    }

    fn notify(&self, board: &BoardId, event: impl Fn(&dyn BoardUpdateListener)) {
        for listener in self.snapshot(board) {
            event(listener.as_ref());
        }
    }
}

struct FinishGuard {
    registry: Arc<SchedulerRegistry>,
    board: BoardId,
    id: u64,
    kind: ScanKind,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(board = %self.board, kind = %self.kind, "Board update panicked");
        }
        self.registry.finish(&self.board, self.id, self.kind);
    }
}

impl BoardUpdateListener for SchedulerRegistry {
    fn thread_started(&self, board: &BoardId, kind: ScanKind) {
        self.notify(board, |l| l.thread_started(board, kind));
    }

    fn thread_finished(&self, board: &BoardId, kind: ScanKind) {
        self.notify(board, |l| l.thread_finished(board, kind));
    }

    fn progress_changed(&self, board: &BoardId, progress: &DayProgress) {
        self.notify(board, |l| l.progress_changed(board, progress));
    }
}
