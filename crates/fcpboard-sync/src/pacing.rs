//! # Request Pacing
//!
//! Short randomized sleeps between node requests so a board scan does not
//! hammer the node. Correctness never depends on them.
//!
//! ```text
//! slot 0 ──pause(Slot)──► slot 1 ──pause(Slot)──► ... ──pause(Upload)──► upload pass
//!
//! attachment worker:  dequeue ──pause(Attachment)──► deleted? ──► put
//! ```

use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::config::PacingSettings;

/// Where a pause happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    /// Between two slot fetches.
    Slot,
    /// Before a scan's upload pass.
    Upload,
    /// Between dequeuing an attachment job and uploading it.
    Attachment,
}

/// Inserts pauses between node requests.
pub trait Pacer: Send + Sync {
    fn pause(&self, pause: Pause);
}

/// Sleeps a uniformly random time within the configured bounds.
#[derive(Debug, Clone)]
pub struct RandomPacer {
    settings: PacingSettings,
}

impl RandomPacer {
    pub fn new(settings: PacingSettings) -> Self {
        Self { settings }
    }

    /// Bounds in milliseconds for a pause.
    pub fn bounds(&self, pause: Pause) -> (u64, u64) {
        let s = &self.settings;
        match pause {
            Pause::Slot => (s.slot_min_ms, s.slot_max_ms),
            Pause::Upload => (s.upload_min_ms, s.upload_max_ms),
            Pause::Attachment => (s.attachment_min_ms, s.attachment_max_ms),
        }
    }

    fn pick(&self, pause: Pause) -> Duration {
        let (min, max) = self.bounds(pause);
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

impl Pacer for RandomPacer {
    fn pause(&self, pause: Pause) {
        let delay = self.pick(pause);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// Never pauses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacing;

impl Pacer for NoPacing {
    fn pause(&self, _pause: Pause) {}
}
