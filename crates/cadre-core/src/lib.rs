// Multi-agent runtime: event-sourced agents, state slices, sub-agent bridging and orchestration

pub mod app;
pub mod config;
pub mod error;
pub mod test_utils;
pub mod utils;

pub use app::domain::{AgentEvent, AgentId, EventLog, EventPayload, InputStatus, RequestId};
pub use app::runtime::{
    Agent, AgentStatus, CommandContext, CommandDispatcher, OrchestratorHandle,
    OrchestratorService,
};
pub use config::AgentConfig;
pub use error::{Error, Result};
