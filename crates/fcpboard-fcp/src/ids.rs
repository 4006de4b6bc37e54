//! Unique identifiers for connections and requests.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Generates identifiers unique within this process and, via the session
/// prefix, distinct from other processes sharing the node's global queue.
#[derive(Debug)]
pub struct IdGenerator {
    session: String,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self {
            session: uuid[..12].to_string(),
            counter: AtomicU64::new(0),
        }
    }

    /// Next identifier for the given kind, e.g. `get-5f0c6d1e2b7a-17`.
    pub fn next(&self, kind: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{kind}-{}-{n}", self.session)
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
