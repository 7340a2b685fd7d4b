use std::any::Any;

use crate::app::domain::event::ResetScope;
use crate::app::domain::slice::{SliceError, SliceKind, StateSlice};
use crate::config::SubAgentOptions;

/// Forwarding and timeout defaults for sub-agents this agent spawns.
#[derive(Debug, Clone, Default)]
pub struct SubAgentSettings {
    defaults: SubAgentOptions,
    pub current: SubAgentOptions,
}

impl SubAgentSettings {
    pub fn defaults(&self) -> &SubAgentOptions {
        &self.defaults
    }
}

impl StateSlice for SubAgentSettings {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn reset(&mut self, scopes: &[ResetScope]) {
        if scopes.contains(&ResetScope::Settings) {
            self.current = self.defaults.clone();
        }
    }

    fn serialize(&self) -> Result<serde_json::Value, SliceError> {
        serde_json::to_value(&self.current).map_err(|e| SliceError::serialize(Self::NAME, e))
    }

    fn deserialize(&mut self, data: serde_json::Value) -> Result<(), SliceError> {
        self.current =
            serde_json::from_value(data).map_err(|e| SliceError::deserialize(Self::NAME, e))?;
        Ok(())
    }

    fn show(&self) -> Option<Vec<String>> {
        let o = &self.current;
        Some(vec![
            format!("forward chat output: {}", o.forward_chat_output),
            format!("forward reasoning: {}", o.forward_reasoning),
            format!("forward system output: {}", o.forward_system_output),
            format!("forward human requests: {}", o.forward_human_requests),
            format!("forward artifacts: {}", o.forward_artifacts),
            format!("timeout: {}s", o.timeout.as_secs_f64()),
            format!("max response length: {}", o.max_response_length),
        ])
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl SliceKind for SubAgentSettings {
    const NAME: &'static str = "sub_agent_settings";
    type Init = SubAgentOptions;

    fn initialize(init: SubAgentOptions) -> Self {
        Self {
            defaults: init.clone(),
            current: init,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn settings_reset_restores_blueprint_defaults() {
        let mut slice = SubAgentSettings::initialize(SubAgentOptions::default());
        slice.current.forward_reasoning = true;
        slice.current.timeout = Duration::from_secs(1);

        slice.reset(&[ResetScope::Memory]);
        assert!(slice.current.forward_reasoning);

        slice.reset(&[ResetScope::Settings]);
        assert_eq!(&slice.current, slice.defaults());
    }

    #[test]
    fn round_trips_through_json() {
        let mut slice = SubAgentSettings::initialize(SubAgentOptions::default());
        slice.current.max_response_length = 42;
        let data = slice.serialize().unwrap();

        let mut restored = SubAgentSettings::initialize(SubAgentOptions::default());
        restored.deserialize(data).unwrap();
        assert_eq!(restored.current.max_response_length, 42);
    }
}
