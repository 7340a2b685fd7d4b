use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::app::domain::event::ResetScope;
use crate::app::domain::slice::{SliceError, SliceKind, StateSlice};
use crate::app::domain::types::{Timestamp, current_timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
    pub timestamp: Timestamp,
}

/// Conversation turns recorded by command handlers.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.entries.push(TranscriptEntry {
            role: role.into(),
            content: content.into(),
            timestamp: current_timestamp(),
        });
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateSlice for Transcript {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn reset(&mut self, scopes: &[ResetScope]) {
        if scopes.contains(&ResetScope::Chat) {
            self.entries.clear();
        }
    }

    fn serialize(&self) -> Result<serde_json::Value, SliceError> {
        serde_json::to_value(&self.entries).map_err(|e| SliceError::serialize(Self::NAME, e))
    }

    fn deserialize(&mut self, data: serde_json::Value) -> Result<(), SliceError> {
        self.entries =
            serde_json::from_value(data).map_err(|e| SliceError::deserialize(Self::NAME, e))?;
        Ok(())
    }

    fn show(&self) -> Option<Vec<String>> {
        Some(
            self.entries
                .iter()
                .map(|entry| format!("{}: {}", entry.role, entry.content))
                .collect(),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl SliceKind for Transcript {
    const NAME: &'static str = "transcript";
    type Init = ();

    fn initialize((): ()) -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_reset_clears_entries() {
        let mut transcript = Transcript::initialize(());
        transcript.push("user", "hi");
        transcript.push("assistant", "hello");
        assert_eq!(
            transcript.show().unwrap(),
            vec!["user: hi".to_string(), "assistant: hello".to_string()]
        );

        transcript.reset(&[ResetScope::Settings, ResetScope::Costs]);
        assert_eq!(transcript.len(), 2);

        transcript.reset(&[ResetScope::Chat]);
        assert!(transcript.is_empty());
    }
}
