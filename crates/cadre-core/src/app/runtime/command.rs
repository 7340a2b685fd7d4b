use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::app::domain::slice::SliceError;
use crate::app::domain::types::RequestId;

use super::agent::{Agent, AgentError};
use super::bridge::{SubAgentOutcome, SubAgentRequest, run_sub_agent};
use super::orchestrator::OrchestratorHandle;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },

    #[error("Command failed: {message}")]
    Execution { message: String },

    #[error("Command cancelled")]
    Cancelled,

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Slice(#[from] SliceError),
}

impl CommandError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }
}

/// Everything a command handler may touch while executing one input.
#[derive(Clone)]
pub struct CommandContext {
    pub agent: Agent,
    pub orchestrator: OrchestratorHandle,
    pub request_id: RequestId,
    /// Fires when this request is aborted or the agent stops.
    pub cancel: CancellationToken,
}

impl CommandContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs a child agent under this request's cancellation.
    pub async fn run_sub_agent(&self, request: SubAgentRequest) -> SubAgentOutcome {
        run_sub_agent(&self.agent, &self.orchestrator, request, &self.cancel).await
    }
}

/// Interprets input text. Whatever it returns (or raises) is recorded by the
/// agent as the input's `input.handled` event.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn execute(
        &self,
        ctx: CommandContext,
        input: String,
    ) -> Result<Option<String>, CommandError>;
}
