//! # In-Memory Store
//!
//! A single [`MemoryStore`] implementing every store interface. Used by the
//! daemon when no database is wired in, and by tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{CoreError, CoreResult};
use crate::store::{AttachmentStore, MessageArchive, ProgressStore, SlotIndexStore, UnsentMessageQueue};
use crate::types::{BacklogCheckpoint, BoardId, BoardMessage, DayProgress, SlotIndex};

/// A message received into a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub board: BoardId,
    pub day: NaiveDate,
    pub index: u32,
    pub message: BoardMessage,
}

#[derive(Default)]
struct MemoryState {
    slots: HashMap<(BoardId, NaiveDate), SlotIndex>,
    progress: HashMap<(BoardId, NaiveDate), DayProgress>,
    checkpoints: HashMap<BoardId, BacklogCheckpoint>,
    backlog_finished: HashMap<BoardId, DateTime<Utc>>,
    updating: HashSet<BoardId>,
    received: Vec<ReceivedMessage>,
    sent: Vec<BoardMessage>,
    unsent: VecDeque<BoardMessage>,
}

/// Thread-safe in-memory implementation of all store traits.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::Store("memory store lock poisoned".into()))
    }

    /// Queues an outgoing message.
    pub fn queue_unsent(&self, message: BoardMessage) -> CoreResult<()> {
        self.lock()?.unsent.push_back(message);
        Ok(())
    }

    /// Messages still waiting for upload.
    pub fn unsent(&self) -> CoreResult<Vec<BoardMessage>> {
        Ok(self.lock()?.unsent.iter().cloned().collect())
    }

    /// Messages received so far, in arrival order.
    pub fn received(&self) -> CoreResult<Vec<ReceivedMessage>> {
        Ok(self.lock()?.received.clone())
    }

    /// Messages inserted so far, in insertion order.
    pub fn sent(&self) -> CoreResult<Vec<BoardMessage>> {
        Ok(self.lock()?.sent.clone())
    }
}

impl SlotIndexStore for MemoryStore {
    fn load_or_create(&self, board: &BoardId, day: NaiveDate) -> CoreResult<SlotIndex> {
        let state = self.lock()?;
        Ok(state
            .slots
            .get(&(board.clone(), day))
            .cloned()
            .unwrap_or_else(|| SlotIndex::new(board.clone(), day)))
    }

    fn save(&self, index: &SlotIndex) -> CoreResult<()> {
        self.lock()?
            .slots
            .insert((index.board().clone(), index.day()), index.clone());
        Ok(())
    }
}

impl ProgressStore for MemoryStore {
    fn load_day(&self, board: &BoardId, day: NaiveDate) -> CoreResult<DayProgress> {
        let state = self.lock()?;
        Ok(state
            .progress
            .get(&(board.clone(), day))
            .cloned()
            .unwrap_or_else(|| DayProgress::new(board.clone(), day)))
    }

    fn save_day(&self, progress: &DayProgress) -> CoreResult<()> {
        self.lock()?
            .progress
            .insert((progress.board.clone(), progress.day), progress.clone());
        Ok(())
    }

    fn backlog_checkpoint(&self, board: &BoardId) -> CoreResult<Option<BacklogCheckpoint>> {
        Ok(self.lock()?.checkpoints.get(board).copied())
    }

    fn set_backlog_checkpoint(
        &self,
        board: &BoardId,
        checkpoint: Option<BacklogCheckpoint>,
    ) -> CoreResult<()> {
        let mut state = self.lock()?;
        match checkpoint {
            Some(cp) => state.checkpoints.insert(board.clone(), cp),
            None => state.checkpoints.remove(board),
        };
        Ok(())
    }

    fn last_backlog_finished(&self, board: &BoardId) -> CoreResult<Option<DateTime<Utc>>> {
        Ok(self.lock()?.backlog_finished.get(board).copied())
    }

    fn set_last_backlog_finished(&self, board: &BoardId, at: DateTime<Utc>) -> CoreResult<()> {
        self.lock()?.backlog_finished.insert(board.clone(), at);
        Ok(())
    }

    fn set_updating(&self, board: &BoardId, updating: bool) -> CoreResult<()> {
        let mut state = self.lock()?;
        if updating {
            state.updating.insert(board.clone());
        } else {
            state.updating.remove(board);
        }
        Ok(())
    }

    fn is_updating(&self, board: &BoardId) -> CoreResult<bool> {
        Ok(self.lock()?.updating.contains(board))
    }
}

impl MessageArchive for MemoryStore {
    fn add_received(
        &self,
        board: &BoardId,
        day: NaiveDate,
        index: u32,
        message: BoardMessage,
    ) -> CoreResult<bool> {
        let mut state = self.lock()?;
        if state
            .received
            .iter()
            .any(|r| r.message.message_id == message.message_id)
        {
            return Ok(false);
        }
        state.received.push(ReceivedMessage {
            board: board.clone(),
            day,
            index,
            message,
        });
        Ok(true)
    }

    fn add_sent(&self, message: &BoardMessage) -> CoreResult<()> {
        self.lock()?.sent.push(message.clone());
        Ok(())
    }
}

impl UnsentMessageQueue for MemoryStore {
    fn next_pending(
        &self,
        board: &BoardId,
        from_name: Option<&str>,
        exclude: &HashSet<String>,
    ) -> CoreResult<Option<BoardMessage>> {
        let state = self.lock()?;
        Ok(state
            .unsent
            .iter()
            .filter(|m| BoardId::new(&m.board) == *board)
            .filter(|m| from_name.map_or(true, |name| m.from_name == name))
            .find(|m| !exclude.contains(&m.message_id))
            .cloned())
    }

    fn remove(&self, message_id: &str) -> CoreResult<()> {
        self.lock()?.unsent.retain(|m| m.message_id != message_id);
        Ok(())
    }
}

impl AttachmentStore for MemoryStore {
    fn attachment_uploaded(&self, message_id: &str, file: &Path, key: &str) -> CoreResult<()> {
        let mut state = self.lock()?;
        let message = state
            .unsent
            .iter_mut()
            .find(|m| m.message_id == message_id)
            .ok_or_else(|| CoreError::NotFound {
                what: "unsent message",
                id: message_id.to_string(),
            })?;

        let attachment = message
            .attachments
            .iter_mut()
            .find(|a| a.local_path.as_deref() == Some(file))
            .ok_or_else(|| CoreError::NotFound {
                what: "attachment",
                id: file.display().to_string(),
            })?;

        attachment.key = Some(key.to_string());
        Ok(())
    }
}
