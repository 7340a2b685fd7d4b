use std::any::Any;

use crate::app::domain::event::ResetScope;
use crate::app::domain::slice::{SliceError, SliceKind, StateSlice};
use crate::app::runtime::Agent;

use super::NamedCollection;

/// Tools the agent's command handlers are allowed to call.
#[derive(Debug, Clone, Default)]
pub struct EnabledTools {
    initial: NamedCollection,
    pub tools: NamedCollection,
}

impl EnabledTools {
    pub fn is_enabled(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }
}

impl StateSlice for EnabledTools {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn reset(&mut self, scopes: &[ResetScope]) {
        if scopes.contains(&ResetScope::Settings) {
            self.tools = self.initial.clone();
        }
    }

    fn serialize(&self) -> Result<serde_json::Value, SliceError> {
        serde_json::to_value(&self.tools).map_err(|e| SliceError::serialize(Self::NAME, e))
    }

    fn deserialize(&mut self, data: serde_json::Value) -> Result<(), SliceError> {
        self.tools = serde_json::from_value(data).map_err(|e| SliceError::deserialize(Self::NAME, e))?;
        Ok(())
    }

    fn show(&self) -> Option<Vec<String>> {
        if self.tools.is_empty() {
            return Some(vec!["No tools enabled".to_string()]);
        }
        Some(self.tools.iter().map(|tool| format!("- {tool}")).collect())
    }

    fn transfers_to_sub_agents(&self) -> bool {
        true
    }

    fn transfer_from_parent(&mut self, parent: &Agent) -> Result<(), SliceError> {
        self.tools = parent.get_state::<EnabledTools, _>(|parent_tools| parent_tools.tools.clone())?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl SliceKind for EnabledTools {
    const NAME: &'static str = "enabled_tools";
    type Init = Vec<String>;

    fn initialize(init: Vec<String>) -> Self {
        let tools = NamedCollection::new(init);
        Self {
            initial: tools.clone(),
            tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_reset_restores_initial_tools() {
        let mut slice = EnabledTools::initialize(vec!["search".to_string()]);
        slice.tools.enable("shell");
        slice.tools.disable("search");

        slice.reset(&[ResetScope::Chat]);
        assert!(slice.is_enabled("shell"));

        slice.reset(&[ResetScope::Settings]);
        assert!(slice.is_enabled("search"));
        assert!(!slice.is_enabled("shell"));
    }

    #[test]
    fn serializes_as_sorted_list() {
        let slice = EnabledTools::initialize(vec!["fetch".to_string(), "search".to_string()]);
        assert_eq!(slice.serialize().unwrap(), json!(["fetch", "search"]));

        let mut restored = EnabledTools::initialize(Vec::new());
        restored.deserialize(json!(["grep"])).unwrap();
        assert!(restored.is_enabled("grep"));
        assert!(restored.deserialize(json!({"oops": 1})).is_err());
    }
}
