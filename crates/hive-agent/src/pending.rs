//! Outstanding requests awaiting a correlated reply.
//!
//! Each entry is resolved exactly once: by a matching reply, by its ttl
//! timer, or by explicit cancellation. Whichever path removes the entry
//! from the map owns the result sender; the others find nothing to do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hive_protocol::{AgentId, Message};
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;

use crate::AgentError;

type ResponseResult = Result<Message, AgentError>;

struct PendingEntry {
    message_id: String,
    created_at: DateTime<Utc>,
    ttl: Duration,
    /// `None` for broadcast requests, where any peer may answer.
    expected_from: Option<AgentId>,
    tx: oneshot::Sender<ResponseResult>,
    timer: AbortHandle,
}

/// Public view of an outstanding request.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub message_id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// Resolution counters, mainly for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    pub resolved: u64,
    pub expired: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct PendingInner {
    entries: Mutex<HashMap<String, PendingEntry>>,
    resolved: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
}

/// Map of outstanding requests keyed by conversation id.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<PendingInner>,
}

/// Await handle for one outstanding request.
pub struct PendingResponse {
    conversation_id: String,
    rx: oneshot::Receiver<ResponseResult>,
}

impl PendingResponse {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Wait for the reply, the timeout or a cancellation.
    pub async fn wait(self) -> Result<Message, AgentError> {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without a result: the map was torn down.
            Err(_) => Err(AgentError::Cancelled(self.conversation_id)),
        }
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `request` until a reply arrives or its ttl elapses.
    pub async fn register(
        &self,
        request: &Message,
        expected_from: Option<AgentId>,
    ) -> Result<PendingResponse, AgentError> {
        let conversation_id = request.conversation_id.clone();
        let mut entries = self.inner.entries.lock().await;
        if entries.contains_key(&conversation_id) {
            return Err(AgentError::DuplicateConversation(conversation_id));
        }

        let (tx, rx) = oneshot::channel();
        let timer = {
            let this = self.clone();
            let conversation_id = conversation_id.clone();
            let message_id = request.id.clone();
            let ttl = request.ttl;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                this.expire(&conversation_id, &message_id).await;
            })
            .abort_handle()
        };

        entries.insert(
            conversation_id.clone(),
            PendingEntry {
                message_id: request.id.clone(),
                created_at: request.created_at,
                ttl: request.ttl,
                expected_from,
                tx,
                timer,
            },
        );
        tracing::trace!(conversation_id = %conversation_id, ttl = ?request.ttl, "pending request registered");

        Ok(PendingResponse {
            conversation_id,
            rx,
        })
    }

    /// Hand `reply` to the request waiting on its conversation.
    ///
    /// Returns `false` when nothing is waiting, or when the reply comes
    /// from a peer other than the one the request was addressed to.
    pub async fn resolve(&self, reply: &Message) -> bool {
        let entry = {
            let mut entries = self.inner.entries.lock().await;
            let matches = match entries.get(&reply.conversation_id) {
                Some(entry) => {
                    entry.message_id != reply.id
                        && entry
                            .expected_from
                            .as_ref()
                            .map_or(true, |expected| *expected == reply.from)
                        && reply
                            .in_reply_to
                            .as_ref()
                            .map_or(true, |id| *id == entry.message_id)
                }
                None => false,
            };
            if !matches {
                return false;
            }
            entries.remove(&reply.conversation_id)
        };

        let Some(entry) = entry else {
            return false;
        };
        entry.timer.abort();
        self.inner.resolved.fetch_add(1, Ordering::Relaxed);
        if entry.tx.send(Ok(reply.clone())).is_err() {
            tracing::debug!(conversation_id = %reply.conversation_id, "reply arrived after caller went away");
        }
        true
    }

    /// Cancel the request waiting on `conversation_id`.
    /// Its caller fails with `AgentError::Cancelled`.
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        let Some(entry) = self.inner.entries.lock().await.remove(conversation_id) else {
            return false;
        };
        entry.timer.abort();
        self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
        let _ = entry
            .tx
            .send(Err(AgentError::Cancelled(conversation_id.to_string())));
        tracing::debug!(conversation_id = %conversation_id, "pending request cancelled");
        true
    }

    /// Cancel everything still outstanding. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.inner.entries.lock().await.keys().cloned().collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(&id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Forget a request whose message never made it onto the channel.
    pub(crate) async fn discard(&self, conversation_id: &str) {
        if let Some(entry) = self.inner.entries.lock().await.remove(conversation_id) {
            entry.timer.abort();
        }
    }

    async fn expire(&self, conversation_id: &str, message_id: &str) {
        let entry = {
            let mut entries = self.inner.entries.lock().await;
            // A later request may reuse the conversation id; only expire our own.
            match entries.get(conversation_id) {
                Some(entry) if entry.message_id == message_id => entries.remove(conversation_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return;
        };
        self.inner.expired.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conversation_id = %conversation_id, ttl = ?entry.ttl, "pending request timed out");
        let _ = entry.tx.send(Err(AgentError::ResponseTimeout {
            conversation_id: conversation_id.to_string(),
            ttl: entry.ttl,
        }));
    }

    pub async fn contains(&self, conversation_id: &str) -> bool {
        self.inner.entries.lock().await.contains_key(conversation_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<PendingRequest> {
        let entries = self.inner.entries.lock().await;
        let mut out: Vec<PendingRequest> = entries
            .iter()
            .map(|(conversation_id, e)| PendingRequest {
                message_id: e.message_id.clone(),
                conversation_id: conversation_id.clone(),
                created_at: e.created_at,
                ttl: e.ttl,
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn stats(&self) -> PendingStats {
        PendingStats {
            resolved: self.inner.resolved.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_protocol::Performative;

    fn request(ttl: Duration) -> Message {
        Message::new(
            AgentId::from("me"),
            AgentId::from("peer"),
            Performative::Request,
            serde_json::json!({}),
        )
        .with_ttl(ttl)
        .expecting_response(true)
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_exactly_once() {
        let pending = PendingRequests::new();
        let req = request(Duration::from_millis(50));
        let started = tokio::time::Instant::now();
        let handle = pending.register(&req, None).await.unwrap();

        let err = handle.wait().await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, AgentError::ResponseTimeout { .. }));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));
        assert!(pending.is_empty().await);

        // A late reply finds nothing and does not count as a resolution.
        let late = Message::reply_to(&req, AgentId::from("peer"), Performative::Inform, serde_json::json!({}));
        assert!(!pending.resolve(&late).await);
        assert!(!pending.cancel(&req.conversation_id).await);
        assert_eq!(
            pending.stats(),
            PendingStats {
                resolved: 0,
                expired: 1,
                cancelled: 0
            }
        );
    }

    #[tokio::test]
    async fn test_reply_wins_over_timer() {
        let pending = PendingRequests::new();
        let req = request(Duration::from_millis(100));
        let handle = pending.register(&req, Some(AgentId::from("peer"))).await.unwrap();

        let reply = Message::reply_to(&req, AgentId::from("peer"), Performative::Accept, serde_json::json!({"ok": true}));
        assert!(pending.resolve(&reply).await);
        assert_eq!(handle.wait().await.unwrap().id, reply.id);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            pending.stats(),
            PendingStats {
                resolved: 1,
                expired: 0,
                cancelled: 0
            }
        );
    }

    #[tokio::test]
    async fn test_reply_from_wrong_peer_is_ignored() {
        let pending = PendingRequests::new();
        let req = request(Duration::from_secs(5));
        let _handle = pending.register(&req, Some(AgentId::from("peer"))).await.unwrap();

        let spoofed = Message::reply_to(&req, AgentId::from("intruder"), Performative::Accept, serde_json::json!({}));
        assert!(!pending.resolve(&spoofed).await);
        assert!(pending.contains(&req.conversation_id).await);
    }

    #[tokio::test]
    async fn test_cancel_is_distinct_from_timeout() {
        let pending = PendingRequests::new();
        let req = request(Duration::from_secs(5));
        let handle = pending.register(&req, None).await.unwrap();

        assert!(pending.cancel(&req.conversation_id).await);
        assert!(matches!(handle.wait().await, Err(AgentError::Cancelled(_))));
        assert!(pending.is_empty().await);
        assert_eq!(pending.stats().cancelled, 1);
        assert_eq!(pending.stats().expired, 0);
    }

    #[tokio::test]
    async fn test_duplicate_conversation_rejected() {
        let pending = PendingRequests::new();
        let req = request(Duration::from_secs(5));
        let _handle = pending.register(&req, None).await.unwrap();
        let again = request(Duration::from_secs(5)).with_conversation(req.conversation_id.clone());
        assert!(matches!(
            pending.register(&again, None).await,
            Err(AgentError::DuplicateConversation(_))
        ));
    }
}
