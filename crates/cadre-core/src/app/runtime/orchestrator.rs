use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::app::domain::checkpoint::Checkpoint;
use crate::app::domain::event::EventPayload;
use crate::app::domain::slice::SliceError;
use crate::app::domain::slices::{SliceCatalog, SliceFactory};
use crate::app::domain::types::AgentId;
use crate::config::{
    AgentConfig, ConfigError, OrchestratorConfig, SpawnOverrides, validate_blueprints,
};

use super::agent::{Agent, AgentError, run_command_loop};
use super::command::CommandDispatcher;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Unknown agent type: {agent_type}")]
    UnknownAgentType { agent_type: String },

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("Unknown state slice '{name}' in blueprint '{agent_type}'")]
    UnknownSlice { agent_type: String, name: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Slice(#[from] SliceError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Orchestrator shutting down")]
    ShuttingDown,
}

pub(crate) enum OrchestratorCmd {
    AddAgentConfigs {
        configs: Vec<AgentConfig>,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    SpawnAgent {
        agent_type: String,
        parent: Option<Agent>,
        overrides: SpawnOverrides,
        reply: oneshot::Sender<Result<Agent, OrchestratorError>>,
    },
    DeleteAgent {
        agent_id: AgentId,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    GetAgent {
        agent_id: AgentId,
        reply: oneshot::Sender<Option<Agent>>,
    },
    ListAgents {
        reply: oneshot::Sender<Vec<Agent>>,
    },
    ListAgentTypes {
        reply: oneshot::Sender<Vec<Arc<AgentConfig>>>,
    },
}

struct Orchestrator {
    configs: HashMap<String, Arc<AgentConfig>>,
    agents: HashMap<AgentId, Agent>,
    catalog: SliceCatalog,
    dispatcher: Arc<dyn CommandDispatcher>,
    tracker: TaskTracker,
    config: OrchestratorConfig,
    tx: mpsc::WeakSender<OrchestratorCmd>,
    stop: CancellationToken,
    shutting_down: bool,
}

impl Orchestrator {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<OrchestratorCmd>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweep.tick().await;

        loop {
            tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        self.shutdown_all(&mut cmd_rx).await;
        tracing::info!("Orchestrator stopped");
    }

    fn handle_command(&mut self, cmd: OrchestratorCmd) {
        match cmd {
            OrchestratorCmd::AddAgentConfigs { configs, reply } => {
                let _ = reply.send(self.add_agent_configs(configs));
            }
            OrchestratorCmd::SpawnAgent {
                agent_type,
                parent,
                overrides,
                reply,
            } => {
                let _ = reply.send(self.spawn_agent(&agent_type, parent.as_ref(), &overrides));
            }
            OrchestratorCmd::DeleteAgent {
                agent_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.delete_agent(agent_id, &reason));
            }
            OrchestratorCmd::GetAgent { agent_id, reply } => {
                let _ = reply.send(self.agents.get(&agent_id).cloned());
            }
            OrchestratorCmd::ListAgents { reply } => {
                let mut agents: Vec<Agent> = self.agents.values().cloned().collect();
                agents.sort_by_key(Agent::id);
                let _ = reply.send(agents);
            }
            OrchestratorCmd::ListAgentTypes { reply } => {
                let mut types: Vec<Arc<AgentConfig>> = self.configs.values().cloned().collect();
                types.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
                let _ = reply.send(types);
            }
        }
    }

    fn add_agent_configs(&mut self, configs: Vec<AgentConfig>) -> Result<(), OrchestratorError> {
        validate_blueprints(&configs)?;
        for config in &configs {
            if self.configs.contains_key(&config.agent_type) {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "agent type '{}' is already registered",
                        config.agent_type
                    ),
                }
                .into());
            }
            if let Some(name) = config.slices.iter().find(|name| !self.catalog.contains(name)) {
                return Err(OrchestratorError::UnknownSlice {
                    agent_type: config.agent_type.clone(),
                    name: name.clone(),
                });
            }
        }

        for config in configs {
            tracing::debug!(agent_type = %config.agent_type, "Registered agent blueprint");
            self.configs
                .insert(config.agent_type.clone(), Arc::new(config));
        }
        Ok(())
    }

    fn spawn_agent(
        &mut self,
        agent_type: &str,
        parent: Option<&Agent>,
        overrides: &SpawnOverrides,
    ) -> Result<Agent, OrchestratorError> {
        if self.shutting_down {
            return Err(OrchestratorError::ShuttingDown);
        }
        let handle = self
            .tx
            .upgrade()
            .map(|tx| OrchestratorHandle {
                tx,
                stop: self.stop.clone(),
            })
            .ok_or(OrchestratorError::ShuttingDown)?;

        let blueprint =
            self.configs
                .get(agent_type)
                .ok_or_else(|| OrchestratorError::UnknownAgentType {
                    agent_type: agent_type.to_string(),
                })?;
        let config = overrides.apply(blueprint);

        let mut slices = self.catalog.build_registry(&config).map_err(|e| match e {
            SliceError::NotFound { name } => OrchestratorError::UnknownSlice {
                agent_type: agent_type.to_string(),
                name,
            },
            other => OrchestratorError::Slice(other),
        })?;
        if let Some(parent) = parent {
            slices.transfer_from_parent(parent, &parent.transferable_slice_names())?;
        }

        let (agent, inbox) = Agent::new(Arc::new(config), parent.map(Agent::id), slices);
        agent.emit(EventPayload::AgentCreated {
            message: format!("Agent '{}' ({}) created", agent.name(), agent.agent_type()),
        });

        self.tracker.spawn(run_command_loop(
            agent.clone(),
            inbox,
            self.dispatcher.clone(),
            handle,
        ));
        self.agents.insert(agent.id(), agent.clone());

        if let Some(parent) = parent {
            parent.info_message(format!(
                "Started sub-agent '{}' ({}) with id {}",
                agent.name(),
                agent.agent_type(),
                agent.id()
            ));
        }

        tracing::info!(
            agent_id = %agent.id(),
            agent_type = %agent_type,
            parent_id = ?parent.map(Agent::id),
            "Spawned agent"
        );
        Ok(agent)
    }

    fn delete_agent(&mut self, agent_id: AgentId, reason: &str) -> bool {
        match self.agents.remove(&agent_id) {
            Some(agent) => {
                agent.shutdown(reason);
                tracing::info!(agent_id = %agent_id, reason = %reason, "Deleted agent");
                true
            }
            None => false,
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<(AgentId, String)> = self
            .agents
            .iter()
            .filter_map(|(id, agent)| agent.retirement_reason(now).map(|reason| (*id, reason)))
            .collect();

        for (agent_id, reason) in expired {
            let retired = catch_unwind(AssertUnwindSafe(|| self.delete_agent(agent_id, &reason)));
            if retired.is_err() {
                self.agents.remove(&agent_id);
                tracing::error!(agent_id = %agent_id, "Failed to retire agent");
            }
        }
    }

    async fn shutdown_all(&mut self, cmd_rx: &mut mpsc::Receiver<OrchestratorCmd>) {
        self.shutting_down = true;
        for (agent_id, agent) in self.agents.drain() {
            agent.shutdown("Orchestrator shutting down");
            tracing::debug!(agent_id = %agent_id, "Shutting down agent");
        }

        let tracker = self.tracker.clone();
        tracker.close();
        let wait = tracker.wait();
        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(wait, deadline);

        // Keep answering commands so stopping agents never block on a reply.
        loop {
            tokio::select! {
                biased;
                () = &mut wait => break,
                () = &mut deadline => {
                    tracing::warn!(
                        remaining = tracker.len(),
                        "Agent command loops still running after shutdown grace period"
                    );
                    break;
                }
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd),
            }
        }
    }
}

#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorCmd>,
    stop: CancellationToken,
}

impl std::fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl OrchestratorHandle {
    /// A handle whose every call fails with [`OrchestratorError::ChannelClosed`].
    #[cfg(any(test, feature = "test-utils"))]
    pub fn detached() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self {
            tx,
            stop: CancellationToken::new(),
        }
    }

    async fn request<T>(
        &self,
        cmd: impl FnOnce(oneshot::Sender<T>) -> OrchestratorCmd,
    ) -> Result<T, OrchestratorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(cmd(reply_tx))
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)?;
        reply_rx.await.map_err(|_| OrchestratorError::ChannelClosed)
    }

    pub async fn add_agent_config(&self, config: AgentConfig) -> Result<(), OrchestratorError> {
        self.add_agent_configs(vec![config]).await
    }

    pub async fn add_agent_configs(
        &self,
        configs: Vec<AgentConfig>,
    ) -> Result<(), OrchestratorError> {
        self.request(|reply| OrchestratorCmd::AddAgentConfigs { configs, reply })
            .await?
    }

    pub async fn spawn_agent(&self, agent_type: &str) -> Result<Agent, OrchestratorError> {
        self.spawn_agent_with(agent_type, SpawnOverrides::default())
            .await
    }

    pub async fn spawn_agent_with(
        &self,
        agent_type: &str,
        overrides: SpawnOverrides,
    ) -> Result<Agent, OrchestratorError> {
        let agent_type = agent_type.to_string();
        self.request(|reply| OrchestratorCmd::SpawnAgent {
            agent_type,
            parent: None,
            overrides,
            reply,
        })
        .await?
    }

    /// Spawns a child of `parent`, carrying over every slice the parent
    /// marks as transferable.
    pub async fn spawn_sub_agent(
        &self,
        parent: &Agent,
        agent_type: &str,
        overrides: SpawnOverrides,
    ) -> Result<Agent, OrchestratorError> {
        let agent_type = agent_type.to_string();
        let parent = Some(parent.clone());
        self.request(|reply| OrchestratorCmd::SpawnAgent {
            agent_type,
            parent,
            overrides,
            reply,
        })
        .await?
    }

    pub async fn spawn_agent_from_checkpoint(
        &self,
        agent_type: &str,
        checkpoint: Checkpoint,
    ) -> Result<Agent, OrchestratorError> {
        let agent = self.spawn_agent(agent_type).await?;
        agent.wait_until_idle().await;
        if let Err(e) = agent.restore_checkpoint(checkpoint) {
            self.delete_agent(agent.id(), "Checkpoint restore failed")
                .await?;
            return Err(e.into());
        }
        Ok(agent)
    }

    pub async fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>, OrchestratorError> {
        self.request(|reply| OrchestratorCmd::GetAgent { agent_id, reply })
            .await
    }

    pub async fn agent(&self, agent_id: AgentId) -> Result<Agent, OrchestratorError> {
        self.get_agent(agent_id)
            .await?
            .ok_or_else(|| OrchestratorError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    pub async fn agents(&self) -> Result<Vec<Agent>, OrchestratorError> {
        self.request(|reply| OrchestratorCmd::ListAgents { reply })
            .await
    }

    pub async fn agent_types(&self) -> Result<Vec<Arc<AgentConfig>>, OrchestratorError> {
        self.request(|reply| OrchestratorCmd::ListAgentTypes { reply })
            .await
    }

    /// Stops and deregisters the agent. Returns `false` when it was already
    /// gone; deleting twice is not an error.
    pub async fn delete_agent(
        &self,
        agent_id: AgentId,
        reason: impl Into<String>,
    ) -> Result<bool, OrchestratorError> {
        let reason = reason.into();
        self.request(|reply| OrchestratorCmd::DeleteAgent {
            agent_id,
            reason,
            reply,
        })
        .await
    }

    /// Asks the orchestrator to stop. Takes effect even when the command
    /// channel is full.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

pub struct OrchestratorBuilder {
    dispatcher: Arc<dyn CommandDispatcher>,
    config: OrchestratorConfig,
    catalog: SliceCatalog,
    agent_configs: Vec<AgentConfig>,
}

impl OrchestratorBuilder {
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_slice_factory(mut self, name: impl Into<String>, factory: SliceFactory) -> Self {
        self.catalog.register(name, factory);
        self
    }

    pub fn with_agent_configs(mut self, configs: impl IntoIterator<Item = AgentConfig>) -> Self {
        self.agent_configs.extend(configs);
        self
    }

    /// Starts the orchestrator task. Blueprints given to the builder are
    /// validated before anything is spawned.
    pub fn spawn(self) -> Result<OrchestratorService, OrchestratorError> {
        let (tx, rx) = mpsc::channel(self.config.command_buffer.max(1));
        let stop = CancellationToken::new();

        let mut orchestrator = Orchestrator {
            configs: HashMap::new(),
            agents: HashMap::new(),
            catalog: self.catalog,
            dispatcher: self.dispatcher,
            tracker: TaskTracker::new(),
            config: self.config,
            tx: tx.downgrade(),
            stop: stop.clone(),
            shutting_down: false,
        };
        orchestrator.add_agent_configs(self.agent_configs)?;

        let task = tokio::spawn(orchestrator.run(rx));
        Ok(OrchestratorService {
            handle: OrchestratorHandle { tx, stop },
            task,
        })
    }
}

pub struct OrchestratorService {
    pub handle: OrchestratorHandle,
    task: JoinHandle<()>,
}

impl OrchestratorService {
    pub fn builder(dispatcher: Arc<dyn CommandDispatcher>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            dispatcher,
            config: OrchestratorConfig::default(),
            catalog: SliceCatalog::new(),
            agent_configs: Vec::new(),
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    /// Stops every agent and waits, up to the configured grace period, for
    /// their command loops to finish.
    pub async fn shutdown(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}
