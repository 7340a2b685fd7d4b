use thiserror::Error;

use crate::app::domain::checkpoint::CheckpointError;
use crate::app::domain::slice::SliceError;
use crate::app::runtime::agent::AgentError;
use crate::app::runtime::command::CommandError;
use crate::app::runtime::orchestrator::OrchestratorError;
use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("Slice error: {0}")]
    Slice(#[from] SliceError),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
