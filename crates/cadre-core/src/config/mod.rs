use std::fs;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

pub mod blueprint;

pub use blueprint::{
    AgentConfig, BlueprintsFile, SpawnOverrides, SubAgentOptions, SubAgentOverrides,
    SubAgentPolicy,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Unsupported blueprint file format: {path}")]
    UnsupportedFormat { path: String },

    #[error("Invalid blueprint: {message}")]
    Invalid { message: String },
}

/// Runtime knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often idle and over-time agents are swept.
    pub sweep_interval: Duration,

    /// Upper bound on how long shutdown waits for in-flight commands.
    pub shutdown_grace: Duration,

    /// Command channel depth of the orchestrator supervisor.
    pub command_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(5),
            command_buffer: 64,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Loads agent blueprints from a `.toml` or `.json` file.
pub fn load_blueprints(path: &Path) -> Result<Vec<AgentConfig>, ConfigError> {
    let display = path.display().to_string();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;

    let file: BlueprintsFile = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: display.clone(),
            message: e.to_string(),
        })?,
        Some("json") => serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: display.clone(),
            message: e.to_string(),
        })?,
        _ => return Err(ConfigError::UnsupportedFormat { path: display }),
    };

    validate_blueprints(&file.agents)?;
    Ok(file.agents)
}

pub fn validate_blueprints(configs: &[AgentConfig]) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for config in configs {
        if config.agent_type.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: format!("agent '{}' has an empty type", config.name),
            });
        }
        if !seen.insert(config.agent_type.as_str()) {
            return Err(ConfigError::Invalid {
                message: format!("duplicate agent type '{}'", config.agent_type),
            });
        }
    }
    Ok(())
}

/// Durations written as (possibly fractional) seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(deserializer)?
                .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
                .transpose()
        }
    }
}
