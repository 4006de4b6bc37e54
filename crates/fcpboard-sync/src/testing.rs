//! Test doubles for the scheduler and the attachment queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fcpboard_core::{BoardId, DayProgress, ScanKind};
use fcpboard_fcp::{
    GetRequest, GetResult, PutRequest, PutResult, TransferClient, ALL_DATA_NOT_FOUND,
    DATA_NOT_FOUND,
};

use crate::clock::Clock;
use crate::pacing::{Pacer, Pause};
use crate::registry::BoardUpdateListener;

// =============================================================================
// Clock
// =============================================================================

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// Pacer
// =============================================================================

#[derive(Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

/// Holds every pause until the gate is opened.
#[derive(Default)]
pub struct GatedPacer {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl GatedPacer {
    /// Blocks until some thread sits in a pause.
    pub fn wait_for_waiter(&self) {
        let mut state = self.state.lock().unwrap();
        while state.waiting == 0 {
            let (next, timeout) = self
                .changed
                .wait_timeout(state, Duration::from_secs(5))
                .unwrap();
            assert!(!timeout.timed_out(), "nobody reached the pause");
            state = next;
        }
    }

    pub fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }
}

impl Pacer for GatedPacer {
    fn pause(&self, _pause: Pause) {
        let mut state = self.state.lock().unwrap();
        state.waiting += 1;
        self.changed.notify_all();
        while !state.open {
            state = self.changed.wait(state).unwrap();
        }
        state.waiting -= 1;
    }
}

// =============================================================================
// Node
// =============================================================================

/// What a slot key answers.
#[derive(Debug, Clone)]
pub enum SlotReply {
    Data(Vec<u8>),
    Failed(i32),
    AllDataNotFound,
}

type GetHook = Box<dyn Fn(&GetRequest) + Send + Sync>;

/// A node whose slots and insert answers are scripted per test.
///
/// Unknown keys answer data-not-found. Puts answer from the scripted queue,
/// then succeed.
#[derive(Default)]
pub struct MockNode {
    slots: Mutex<HashMap<String, SlotReply>>,
    put_replies: Mutex<VecDeque<PutResult>>,
    gets: Mutex<Vec<GetRequest>>,
    puts: Mutex<Vec<(PutRequest, Vec<u8>)>>,
    on_get: Mutex<Option<GetHook>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot(self, key: &str, reply: SlotReply) -> Self {
        self.slots.lock().unwrap().insert(key.to_string(), reply);
        self
    }

    pub fn with_put_reply(self, reply: PutResult) -> Self {
        self.put_replies.lock().unwrap().push_back(reply);
        self
    }

    /// Runs `hook` before answering every get.
    pub fn on_get(self, hook: impl Fn(&GetRequest) + Send + Sync + 'static) -> Self {
        *self.on_get.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn requested_keys(&self) -> Vec<String> {
        self.gets.lock().unwrap().iter().map(|r| r.key.clone()).collect()
    }

    pub fn gets(&self) -> Vec<GetRequest> {
        self.gets.lock().unwrap().clone()
    }

    /// Requests and the bytes their source files held when put.
    pub fn puts(&self) -> Vec<(PutRequest, Vec<u8>)> {
        self.puts.lock().unwrap().clone()
    }
}

impl TransferClient for MockNode {
    fn get(&self, request: &GetRequest) -> GetResult {
        if let Some(hook) = self.on_get.lock().unwrap().as_ref() {
            hook(request);
        }
        self.gets.lock().unwrap().push(request.clone());
        let reply = self.slots.lock().unwrap().get(&request.key).cloned();
        match reply {
            Some(SlotReply::Data(bytes)) => {
                std::fs::write(&request.target, &bytes).unwrap();
                GetResult::success(bytes.len() as u64)
            }
            Some(SlotReply::Failed(code)) => GetResult::failed(Some(code), false, "failed"),
            Some(SlotReply::AllDataNotFound) => {
                GetResult::failed(Some(ALL_DATA_NOT_FOUND), false, "all data not found")
            }
            None => GetResult::failed(Some(DATA_NOT_FOUND), false, "data not found"),
        }
    }

    fn put(&self, request: &PutRequest) -> PutResult {
        let payload = std::fs::read(&request.source).unwrap_or_default();
        self.puts.lock().unwrap().push((request.clone(), payload));
        self.put_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| PutResult::success(format!("CHK@inserted/{}", self.puts.lock().unwrap().len())))
    }
}

// =============================================================================
// Listener
// =============================================================================

/// What a listener saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Started(BoardId, ScanKind),
    Finished(BoardId, ScanKind),
    Progress(BoardId, DayProgress),
}

/// Records every notification under a label.
pub struct RecordingListener {
    label: &'static str,
    log: Arc<Mutex<Vec<(&'static str, Seen)>>>,
}

impl RecordingListener {
    pub fn new(label: &'static str, log: Arc<Mutex<Vec<(&'static str, Seen)>>>) -> Self {
        Self { label, log }
    }
}

impl BoardUpdateListener for RecordingListener {
    fn thread_started(&self, board: &BoardId, kind: ScanKind) {
        self.log
            .lock()
            .unwrap()
            .push((self.label, Seen::Started(board.clone(), kind)));
    }

    fn thread_finished(&self, board: &BoardId, kind: ScanKind) {
        self.log
            .lock()
            .unwrap()
            .push((self.label, Seen::Finished(board.clone(), kind)));
    }

    fn progress_changed(&self, board: &BoardId, progress: &DayProgress) {
        self.log
            .lock()
            .unwrap()
            .push((self.label, Seen::Progress(board.clone(), progress.clone())));
    }
}
