use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hive_protocol::AgentId;
use serde::{Deserialize, Serialize};

/// State transition worth keeping an audit trail of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    NegotiationAccepted,
    NegotiationRejected,
    CollaborationAccepted,
    CollaborationRejected,
    TaskDelegated,
    TaskCompleted,
    TaskFailed,
    BidAwarded,
    ConsensusReached,
    KnowledgeVerified,
    PlanFinished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub agent: AgentId,
    pub kind: AuditKind,
    /// Id of the negotiation, task, round or plan concerned.
    pub subject: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(agent: AgentId, kind: AuditKind, subject: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            agent,
            kind,
            subject: subject.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Fire-and-forget sink for audit entries.
///
/// `record` must not block; a sink that cannot store an entry drops it.
pub trait AuditLog: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Emits audit entries as structured tracing events.
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "hive::audit",
            agent = %entry.agent,
            kind = ?entry.kind,
            subject = %entry.subject,
            detail = %entry.detail,
            "audit"
        );
    }
}

/// Keeps entries in memory.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.entries().iter().filter(|e| e.kind == kind).count()
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, entry: AuditEntry) {
        // A poisoned log loses the entry rather than blocking the caller.
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}
