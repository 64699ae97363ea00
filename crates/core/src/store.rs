//! Call Record Persistence
//!
//! The upstream store that keeps call records, intent events and agent
//! interactions. Sessions treat it as a best-effort side channel: writes are
//! queued on a [`StoreWriter`] and failures are logged, never propagated.

use crate::events::IntentEvent;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{Instrument, warn};
use uuid::Uuid;

/// Status of a persisted call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RecordStatus::Active),
            "completed" => Ok(RecordStatus::Completed),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(anyhow!("unknown call status {:?}", other)),
        }
    }
}

/// Kind of a persisted agent interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    UserSpeech,
    AgentResponse,
    SystemEvent,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::UserSpeech => "user_speech",
            InteractionKind::AgentResponse => "agent_response",
            InteractionKind::SystemEvent => "system_event",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCallSession {
    pub id: Uuid,
    pub call_sid: String,
    pub caller_number: Option<String>,
    pub status: RecordStatus,
    pub start_time: DateTime<Utc>,
    pub metadata: Value,
}

/// Partial update of a call record. `transcript` is appended to the record's
/// transcript rather than replacing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSessionUpdate {
    pub transcript: Option<String>,
    pub status: Option<RecordStatus>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAgentInteraction {
    pub call_session_id: Uuid,
    pub kind: InteractionKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create_call_session(&self, record: NewCallSession) -> Result<()>;
    async fn update_call_session(&self, id: Uuid, update: CallSessionUpdate) -> Result<()>;
    async fn create_intent_event(&self, event: IntentEvent) -> Result<()>;
    async fn create_agent_interaction(&self, interaction: NewAgentInteraction) -> Result<()>;
    /// Every call record, most recent first.
    async fn list_call_sessions(&self) -> Result<Vec<CallRecord>>;
}

/// Writes a session may have waiting before new ones are dropped.
pub const STORE_QUEUE_CAPACITY: usize = 1024;

/// A queued write.
#[derive(Debug)]
pub enum StoreJob {
    CreateCall(NewCallSession),
    UpdateCall(Uuid, CallSessionUpdate),
    Intent(IntentEvent),
    Interaction(NewAgentInteraction),
}

impl StoreJob {
    fn name(&self) -> &'static str {
        match self {
            StoreJob::CreateCall(_) => "create_call_session",
            StoreJob::UpdateCall(..) => "update_call_session",
            StoreJob::Intent(_) => "create_intent_event",
            StoreJob::Interaction(_) => "create_agent_interaction",
        }
    }

    async fn run(self, store: &dyn CallStore) -> Result<()> {
        match self {
            StoreJob::CreateCall(record) => store.create_call_session(record).await,
            StoreJob::UpdateCall(id, update) => store.update_call_session(id, update).await,
            StoreJob::Intent(event) => store.create_intent_event(event).await,
            StoreJob::Interaction(interaction) => store.create_agent_interaction(interaction).await,
        }
    }
}

/// Applies store writes one at a time, in submission order, on a background
/// task. Submitting never waits; when the queue is full the write is dropped.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<StoreJob>,
}

impl StoreWriter {
    /// Spawns the writer task. It exits once every clone of the writer is
    /// dropped and the queue is drained.
    pub fn spawn(store: Arc<dyn CallStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreJob>(STORE_QUEUE_CAPACITY);
        tokio::spawn(
            async move {
                while let Some(job) = rx.recv().await {
                    let name = job.name();
                    if let Err(e) = job.run(store.as_ref()).await {
                        warn!(job = name, error = ?e, "upstream persistence failed");
                    }
                }
            }
            .in_current_span(),
        );
        Self { tx }
    }

    /// Queues `job`. Returns `false` if it was dropped.
    pub fn submit(&self, job: StoreJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(job = job.name(), "store writer is backed up; dropping write");
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(job = job.name(), "store writer has stopped; dropping write");
                false
            }
        }
    }
}

/// A persisted call record.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub id: Uuid,
    pub call_sid: String,
    pub caller_number: Option<String>,
    pub status: RecordStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub transcript: Option<String>,
    pub metadata: Value,
}

#[derive(Default)]
struct MemoryState {
    calls: HashMap<Uuid, CallRecord>,
    intents: Vec<IntentEvent>,
    interactions: Vec<NewAgentInteraction>,
    unavailable: bool,
}

/// In-process [`CallStore`], used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryCallStore {
    state: Mutex<MemoryState>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail, as an unreachable database would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn call(&self, id: Uuid) -> Option<CallRecord> {
        self.lock().calls.get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.values().cloned().collect()
    }

    pub fn intents(&self) -> Vec<IntentEvent> {
        self.lock().intents.clone()
    }

    pub fn interactions(&self) -> Vec<NewAgentInteraction> {
        self.lock().interactions.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        let state = self.lock();
        if state.unavailable {
            return Err(anyhow!("call store is unavailable"));
        }
        Ok(state)
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn create_call_session(&self, record: NewCallSession) -> Result<()> {
        let mut state = self.available()?;
        state.calls.insert(
            record.id,
            CallRecord {
                id: record.id,
                call_sid: record.call_sid,
                caller_number: record.caller_number,
                status: record.status,
                start_time: record.start_time,
                end_time: None,
                duration_secs: None,
                transcript: None,
                metadata: record.metadata,
            },
        );
        Ok(())
    }

    async fn update_call_session(&self, id: Uuid, update: CallSessionUpdate) -> Result<()> {
        let mut state = self.available()?;
        let record = state
            .calls
            .get_mut(&id)
            .ok_or_else(|| anyhow!("call session {} not found", id))?;
        if let Some(fragment) = update.transcript {
            record.transcript = Some(match record.transcript.take() {
                Some(existing) => format!("{}\n{}", existing, fragment),
                None => fragment,
            });
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        if update.end_time.is_some() {
            record.end_time = update.end_time;
        }
        if update.duration_secs.is_some() {
            record.duration_secs = update.duration_secs;
        }
        Ok(())
    }

    async fn create_intent_event(&self, event: IntentEvent) -> Result<()> {
        let mut state = self.available()?;
        if !state.calls.contains_key(&event.call_session_id) {
            return Err(anyhow!(
                "intent references unknown call session {}",
                event.call_session_id
            ));
        }
        state.intents.push(event);
        Ok(())
    }

    async fn create_agent_interaction(&self, interaction: NewAgentInteraction) -> Result<()> {
        let mut state = self.available()?;
        state.interactions.push(interaction);
        Ok(())
    }

    async fn list_call_sessions(&self) -> Result<Vec<CallRecord>> {
        let state = self.available()?;
        let mut calls: Vec<CallRecord> = state.calls.values().cloned().collect();
        calls.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(calls)
    }
}
