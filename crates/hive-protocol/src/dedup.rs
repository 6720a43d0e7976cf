use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::constants::DEDUP_WINDOW_SECS;
use crate::ProtocolError;

/// Rolling window of recently delivered message ids.
///
/// Channels backed by an external broker deliver at least once, so every
/// receiver runs inbound ids through this window before dispatching.
/// Entries older than the window are evicted on each check.
pub struct DeliveryWindow {
    /// message id → first time it was seen
    seen: HashMap<String, DateTime<Utc>>,
    window: Duration,
}

impl DeliveryWindow {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(DEDUP_WINDOW_SECS))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window,
        }
    }

    /// Record `message_id` as delivered at `now`.
    /// Returns `ProtocolError::Duplicate` if it was already seen inside the window.
    pub fn check_and_insert(
        &mut self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolError> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        self.seen.retain(|_, first_seen| now.signed_duration_since(*first_seen) < window);

        if self.seen.contains_key(message_id) {
            return Err(ProtocolError::Duplicate(message_id.to_string()));
        }

        self.seen.insert(message_id.to_string(), now);
        Ok(())
    }

    /// Returns the number of tracked ids (for testing/monitoring).
    pub fn size(&self) -> usize {
        self.seen.len()
    }
}

impl Default for DeliveryWindow {
    fn default() -> Self {
        Self::new()
    }
}
