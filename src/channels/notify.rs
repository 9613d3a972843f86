//! Notifications and bell: fire-and-forget, with short-window
//! deduplication by notification id.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// A notification with an id seen within this window is a duplicate.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct NotificationChannel {
    seen: HashMap<u64, Instant>,
}

impl NotificationChannel {
    pub fn new() -> NotificationChannel {
        NotificationChannel::default()
    }

    /// Whether a notification should be forwarded; remembers it either way.
    pub fn should_forward(&mut self, nid: u64, now: Instant) -> bool {
        self.seen
            .retain(|_, t| now.saturating_duration_since(*t) <= DEDUP_WINDOW);
        match self.seen.get(&nid) {
            Some(_) => false,
            None => {
                self.seen.insert(nid, now);
                true
            }
        }
    }

    /// Closing always forwards and clears the dedup slot so a later show
    /// with the same id works.
    pub fn closed(&mut self, nid: u64) {
        self.seen.remove(&nid);
    }
}
