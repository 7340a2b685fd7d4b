//! Slices every agent carries, plus the catalog external slices plug into.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::app::domain::slice::{SliceError, SliceRegistry, StateSlice};
use crate::config::AgentConfig;

pub mod sub_agent;
pub mod tools;
pub mod transcript;

pub use sub_agent::SubAgentSettings;
pub use tools::EnabledTools;
pub use transcript::{Transcript, TranscriptEntry};

/// Set of names where enabling twice or disabling something absent is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamedCollection {
    items: BTreeSet<String>,
}

impl NamedCollection {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns whether the name was newly added.
    pub fn enable(&mut self, name: impl Into<String>) -> bool {
        self.items.insert(name.into())
    }

    /// Returns whether the name was present.
    pub fn disable(&mut self, name: &str) -> bool {
        self.items.remove(name)
    }

    pub fn set<I, S>(&mut self, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.items = items.into_iter().map(Into::into).collect();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Builds one slice for a freshly spawned agent.
pub type SliceFactory = Arc<dyn Fn(&AgentConfig) -> Box<dyn StateSlice> + Send + Sync>;

/// Slice factories a blueprint can name in its `slices` list.
#[derive(Clone, Default)]
pub struct SliceCatalog {
    factories: BTreeMap<String, SliceFactory>,
}

impl std::fmt::Debug for SliceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceCatalog")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SliceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: SliceFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds the registry for an agent: the built-in slices seeded from
    /// `config`, then every catalog slice the blueprint names.
    pub fn build_registry(&self, config: &AgentConfig) -> Result<SliceRegistry, SliceError> {
        let mut registry = SliceRegistry::new();
        registry.initialize_state::<EnabledTools>(config.enabled_tools.clone());
        registry.initialize_state::<SubAgentSettings>(config.sub_agents.options.clone());
        registry.initialize_state::<Transcript>(());

        for name in &config.slices {
            let factory = self
                .factories
                .get(name)
                .ok_or_else(|| SliceError::not_found(name.clone()))?;
            registry.insert(factory(config));
        }
        Ok(registry)
    }
}
