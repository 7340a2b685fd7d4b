use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::duration_secs;

/// Root structure of a blueprint file.
#[derive(Debug, Deserialize, Serialize)]
pub struct BlueprintsFile {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Immutable template an agent is instantiated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Registry key the orchestrator spawns by.
    #[serde(rename = "type")]
    pub agent_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Headless agents have no interactive surface and cannot ask a human.
    #[serde(default)]
    pub headless: bool,
    #[serde(default, with = "duration_secs::option")]
    pub idle_timeout: Option<Duration>,
    #[serde(default, with = "duration_secs::option")]
    pub max_run_time: Option<Duration>,
    #[serde(default)]
    pub sub_agents: SubAgentPolicy,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    /// Extra slices built from the orchestrator's slice catalog.
    #[serde(default)]
    pub slices: Vec<String>,
}

impl AgentConfig {
    pub fn new(agent_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            name: name.into(),
            description: String::new(),
            headless: false,
            idle_timeout: None,
            max_run_time: None,
            sub_agents: SubAgentPolicy::default(),
            enabled_tools: Vec::new(),
            slices: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_max_run_time(mut self, max: Duration) -> Self {
        self.max_run_time = Some(max);
        self
    }

    pub fn with_sub_agents(mut self, policy: SubAgentPolicy) -> Self {
        self.sub_agents = policy;
        self
    }

    pub fn with_enabled_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_slices<I, S>(mut self, slices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slices = slices.into_iter().map(Into::into).collect();
        self
    }
}

/// Which children an agent may spawn and how their output is relayed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubAgentPolicy {
    /// Agent types this agent may spawn; `"*"` allows any registered type.
    #[serde(default)]
    pub allowed_types: Vec<String>,
    #[serde(default)]
    pub options: SubAgentOptions,
}

impl SubAgentPolicy {
    pub fn allowing<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_types: types.into_iter().map(Into::into).collect(),
            options: SubAgentOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SubAgentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn allows(&self, agent_type: &str) -> bool {
        self.allowed_types
            .iter()
            .any(|allowed| allowed == "*" || allowed == agent_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubAgentOptions {
    pub forward_chat_output: bool,
    pub forward_reasoning: bool,
    /// Info and warning output. Error output is always relayed.
    pub forward_system_output: bool,
    pub forward_human_requests: bool,
    pub forward_artifacts: bool,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_response_length: usize,
    pub min_context_length: usize,
}

pub const DEFAULT_SUB_AGENT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_RESPONSE_LENGTH: usize = 10_000;
pub const DEFAULT_MIN_CONTEXT_LENGTH: usize = 1_000;

impl Default for SubAgentOptions {
    fn default() -> Self {
        Self {
            forward_chat_output: true,
            forward_reasoning: false,
            forward_system_output: true,
            forward_human_requests: true,
            forward_artifacts: false,
            timeout: DEFAULT_SUB_AGENT_TIMEOUT,
            max_response_length: DEFAULT_MAX_RESPONSE_LENGTH,
            min_context_length: DEFAULT_MIN_CONTEXT_LENGTH,
        }
    }
}

/// Per-run overrides layered over an agent's [`SubAgentOptions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubAgentOverrides {
    pub forward_chat_output: Option<bool>,
    pub forward_reasoning: Option<bool>,
    pub forward_system_output: Option<bool>,
    pub forward_human_requests: Option<bool>,
    pub forward_artifacts: Option<bool>,
    pub timeout: Option<Duration>,
    pub max_response_length: Option<usize>,
    pub min_context_length: Option<usize>,
}

impl SubAgentOverrides {
    pub fn apply(&self, base: &SubAgentOptions) -> SubAgentOptions {
        SubAgentOptions {
            forward_chat_output: self.forward_chat_output.unwrap_or(base.forward_chat_output),
            forward_reasoning: self.forward_reasoning.unwrap_or(base.forward_reasoning),
            forward_system_output: self
                .forward_system_output
                .unwrap_or(base.forward_system_output),
            forward_human_requests: self
                .forward_human_requests
                .unwrap_or(base.forward_human_requests),
            forward_artifacts: self.forward_artifacts.unwrap_or(base.forward_artifacts),
            timeout: self.timeout.unwrap_or(base.timeout),
            max_response_length: self.max_response_length.unwrap_or(base.max_response_length),
            min_context_length: self.min_context_length.unwrap_or(base.min_context_length),
        }
    }
}

/// Adjustments applied to a blueprint when spawning one specific agent.
/// The registered blueprint itself is never modified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnOverrides {
    pub headless: Option<bool>,
    pub idle_timeout: Option<Duration>,
    pub max_run_time: Option<Duration>,
}

impl SpawnOverrides {
    pub fn apply(&self, blueprint: &AgentConfig) -> AgentConfig {
        let mut config = blueprint.clone();
        if let Some(headless) = self.headless {
            config.headless = headless;
        }
        if let Some(idle_timeout) = self.idle_timeout {
            config.idle_timeout = Some(idle_timeout);
        }
        if let Some(max_run_time) = self.max_run_time {
            config.max_run_time = Some(max_run_time);
        }
        config
    }
}
