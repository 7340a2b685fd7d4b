pub mod agent;
pub mod bridge;
pub mod command;
pub mod orchestrator;
pub mod surface;

pub use agent::{Agent, AgentDescriptor, AgentError, AgentStatus, InputOutcome};
pub use bridge::{SubAgentOutcome, SubAgentRequest, SubAgentResult};
pub use command::{CommandContext, CommandDispatcher, CommandError};
pub use orchestrator::{
    OrchestratorBuilder, OrchestratorError, OrchestratorHandle, OrchestratorService,
};
pub use surface::{AgentTypeInfo, EventsPage};
