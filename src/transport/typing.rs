use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Authors currently typing. Each entry expires after a fixed window unless
/// refreshed, so a dropped "stopped typing" signal cannot leave a stuck
/// indicator.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    expiry: Duration,
    entries: HashMap<String, Instant>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            entries: HashMap::new(),
        }
    }

    pub fn apply(&mut self, author: String, is_typing: bool, now: Instant) {
        if is_typing {
            self.entries.insert(author, now + self.expiry);
        } else {
            self.entries.remove(&author);
        }
    }

    /// Returns true if anything expired.
    pub fn prune(&mut self, now: Instant) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        self.entries.len() != before
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().min().copied()
    }

    /// Sorted so snapshots are stable.
    pub fn authors(&self) -> Vec<String> {
        let mut authors: Vec<String> = self.entries.keys().cloned().collect();
        authors.sort();
        authors
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
