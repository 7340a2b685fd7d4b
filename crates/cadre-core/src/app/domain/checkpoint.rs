use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::domain::event::{AgentEvent, EventPayload};
use crate::app::domain::slice::SliceData;
use crate::app::domain::types::{AgentId, CheckpointId, RequestId, Timestamp};

/// Key under which the event log travels inside [`Checkpoint::state`].
pub const EVENT_LOG_STATE: &str = "events";

/// Serialized snapshot of one agent: its event log and every slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub agent_id: AgentId,
    /// Milliseconds since the Unix epoch.
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: SliceData,
}

impl Checkpoint {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Splits the event log out of the state, leaving only slice entries.
    pub fn into_parts(mut self) -> Result<(Vec<AgentEvent>, SliceData), CheckpointError> {
        let events = match self.state.remove(EVENT_LOG_STATE) {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| CheckpointError::protocol(format!("malformed event log: {e}")))?,
            None => Vec::new(),
        };
        Ok((events, self.state))
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {id}")]
    NotFound { id: String },

    #[error("Malformed checkpoint: {message}")]
    Protocol { message: String },

    #[error("In-memory checkpoint store lock poisoned")]
    LockPoisoned,
}

impl CheckpointError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

/// Drops events that must not survive a restore: `agent.stopped`, inputs
/// that never completed, and questions that were never answered.
pub fn sanitize_restored_events(events: Vec<AgentEvent>) -> Vec<AgentEvent> {
    let mut handled: HashSet<RequestId> = HashSet::new();
    let mut answered: HashSet<RequestId> = HashSet::new();
    for event in &events {
        match &event.payload {
            EventPayload::InputHandled { request_id, .. } => {
                handled.insert(*request_id);
            }
            EventPayload::HumanResponse { request_id, .. } => {
                answered.insert(*request_id);
            }
            _ => {}
        }
    }

    events
        .into_iter()
        .filter(|event| match &event.payload {
            EventPayload::AgentStopped { .. } => false,
            EventPayload::InputReceived { request_id, .. } => handled.contains(request_id),
            EventPayload::HumanRequest { request_id, .. } => answered.contains(request_id),
            _ => true,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub id: CheckpointId,
    pub name: Option<String>,
    pub created_at: Timestamp,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn store(&self, checkpoint: Checkpoint) -> Result<CheckpointId, CheckpointError>;

    async fn retrieve(&self, id: CheckpointId) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<CheckpointId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn store(&self, checkpoint: Checkpoint) -> Result<CheckpointId, CheckpointError> {
        let id = CheckpointId::new();
        self.checkpoints
            .write()
            .map_err(|_| CheckpointError::LockPoisoned)?
            .insert(id, checkpoint);
        Ok(id)
    }

    async fn retrieve(&self, id: CheckpointId) -> Result<Option<Checkpoint>, CheckpointError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| CheckpointError::LockPoisoned)?;
        Ok(checkpoints.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| CheckpointError::LockPoisoned)?;
        let mut summaries: Vec<_> = checkpoints
            .iter()
            .map(|(id, checkpoint)| CheckpointSummary {
                id: *id,
                name: checkpoint.name.clone(),
                created_at: checkpoint.created_at,
            })
            .collect();
        summaries.sort_by_key(|summary| summary.created_at);
        Ok(summaries)
    }
}
