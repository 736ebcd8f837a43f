//! Shared types used across modules.
//!
//! Kept separate from the per-component modules to avoid circular
//! dependencies, the same rationale the teacher's own `types.rs` documents.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::EndReason;

/// Role of a conversation-log entry (§3 call session: "an ordered sequence
/// of `{role, content, timestamp}`").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry in a call's conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// `firstMessageMode` (§3 agent configuration).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FirstMessageMode {
    AssistantSpeaksFirst,
    UserSpeaksFirst,
}

/// Immutable per-call agent configuration (§3): model, voice, transcriber
/// settings plus the call-level knobs the orchestrator enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub model: crate::llm::ModelConfig,
    pub voice: crate::tts::VoiceConfig,
    pub transcriber: crate::stt::TranscriberConfig,
    pub first_message: String,
    pub first_message_mode: FirstMessageMode,
    pub max_duration_seconds: u64,
    pub silence_timeout_seconds: u64,
    pub response_delay_seconds: f64,
}

/// The status a persisted call record can be in (§6.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Failed,
}

/// The only externally visible state the core produces (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_reason: Option<EndReason>,
    pub transcript: Vec<ConversationEntry>,
    pub recording_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub agent_id: String,
    pub customer_number: String,
}

impl CallRecord {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, customer_number: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: CallStatus::Initiated,
            started_at: Utc::now(),
            ended_at: None,
            ended_reason: None,
            transcript: Vec::new(),
            recording_url: None,
            duration_seconds: None,
            agent_id: agent_id.into(),
            customer_number: customer_number.into(),
        }
    }

    pub fn mark_ended(&mut self, reason: EndReason, status: CallStatus) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.ended_reason = Some(reason);
        self.status = status;
        self.duration_seconds = Some((now - self.started_at).num_seconds());
    }
}

/// Persistence seam for call records (§6.3). No MongoDB driver is wired up
/// here; this trait documents where one would plug in, mirroring the
/// teacher's `MemoryStore` "try a real backend, fall back to local" shape.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn save(&self, record: CallRecord);
    async fn get(&self, id: &str) -> Option<CallRecord>;
    async fn list(&self, limit: usize) -> Vec<CallRecord>;
}

/// Default in-process store, keyed by call id. Good enough for a single
/// engine instance; a real deployment backs `CallStore` with durable
/// storage instead.
#[derive(Default)]
pub struct InMemoryCallStore {
    records: RwLock<HashMap<String, CallRecord>>,
}

impl InMemoryCallStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn save(&self, record: CallRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    async fn get(&self, id: &str) -> Option<CallRecord> {
        self.records.read().await.get(id).cloned()
    }

    async fn list(&self, limit: usize) -> Vec<CallRecord> {
        let mut records: Vec<CallRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        records.truncate(limit);
        records
    }
}
