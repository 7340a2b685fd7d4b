//! Named, independently resettable and serializable pieces of agent state.

use std::any::Any;
use std::collections::BTreeMap;

use thiserror::Error;

use crate::app::domain::event::ResetScope;
use crate::app::runtime::Agent;

/// Serialized form of every slice of one agent, keyed by slice name.
pub type SliceData = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum SliceError {
    #[error("State slice not found: {name}")]
    NotFound { name: String },

    #[error("State slice '{name}' is registered with a different type")]
    TypeMismatch { name: String },

    #[error("Failed to serialize state slice '{name}': {message}")]
    Serialize { name: String, message: String },

    #[error("Failed to deserialize state slice '{name}': {message}")]
    Deserialize { name: String, message: String },

    #[error("Failed to transfer state slice '{name}' from parent: {message}")]
    Transfer { name: String, message: String },
}

impl SliceError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn serialize(name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Serialize {
            name: name.into(),
            message: err.to_string(),
        }
    }

    pub fn deserialize(name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Deserialize {
            name: name.into(),
            message: err.to_string(),
        }
    }
}

pub trait StateSlice: Any + Send + Sync {
    fn name(&self) -> &'static str;

    /// Clears whatever part of the slice is bound to one of `scopes`.
    fn reset(&mut self, scopes: &[ResetScope]);

    fn serialize(&self) -> Result<serde_json::Value, SliceError>;

    fn deserialize(&mut self, data: serde_json::Value) -> Result<(), SliceError>;

    fn show(&self) -> Option<Vec<String>> {
        None
    }

    /// Whether a freshly spawned sub-agent should inherit this slice.
    fn transfers_to_sub_agents(&self) -> bool {
        false
    }

    /// Called on the child's copy of the slice while a sub-agent is spawned.
    fn transfer_from_parent(&mut self, _parent: &Agent) -> Result<(), SliceError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A slice type that can be constructed and looked up by its stable name.
pub trait SliceKind: StateSlice + Sized {
    const NAME: &'static str;

    type Init;

    fn initialize(init: Self::Init) -> Self;
}

#[derive(Default)]
pub struct SliceRegistry {
    slices: BTreeMap<&'static str, Box<dyn StateSlice>>,
}

impl std::fmt::Debug for SliceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceRegistry")
            .field("slices", &self.slices.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SliceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs `S` from `init`, replacing any existing instance.
    pub fn initialize_state<S: SliceKind>(&mut self, init: S::Init) {
        self.slices.insert(S::NAME, Box::new(S::initialize(init)));
    }

    pub fn insert(&mut self, slice: Box<dyn StateSlice>) {
        self.slices.insert(slice.name(), slice);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slices.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.slices.keys().copied().collect()
    }

    /// Runs `f` with exclusive access to slice `S`.
    ///
    /// Not reentrant: `f` must not reach back into the registry that owns it.
    pub fn mutate_state<S: SliceKind, R>(
        &mut self,
        f: impl FnOnce(&mut S) -> R,
    ) -> Result<R, SliceError> {
        let slice = self
            .slices
            .get_mut(S::NAME)
            .ok_or_else(|| SliceError::not_found(S::NAME))?;
        let slice = slice
            .as_any_mut()
            .downcast_mut::<S>()
            .ok_or_else(|| SliceError::TypeMismatch {
                name: S::NAME.to_string(),
            })?;
        Ok(f(slice))
    }

    pub fn get_state<S: SliceKind, R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, SliceError> {
        let slice = self
            .slices
            .get(S::NAME)
            .ok_or_else(|| SliceError::not_found(S::NAME))?;
        let slice = slice
            .as_any()
            .downcast_ref::<S>()
            .ok_or_else(|| SliceError::TypeMismatch {
                name: S::NAME.to_string(),
            })?;
        Ok(f(slice))
    }

    pub fn serialize(&self) -> Result<SliceData, SliceError> {
        self.slices
            .iter()
            .map(|(name, slice)| Ok(((*name).to_string(), slice.serialize()?)))
            .collect()
    }

    /// Applies `data` to every matching slice. Keys without a registered slice
    /// are reported through `on_missing_slice` instead of failing, so that
    /// checkpoints survive slices being added or removed between versions.
    ///
    /// All or nothing: if any slice rejects its payload, every slice is put
    /// back to the state it had before the call.
    pub fn deserialize(
        &mut self,
        data: SliceData,
        mut on_missing_slice: impl FnMut(&str),
    ) -> Result<(), SliceError> {
        let previous = self.serialize()?;
        for (name, value) in data {
            let Some(slice) = self.slices.get_mut(name.as_str()) else {
                on_missing_slice(&name);
                continue;
            };
            if let Err(e) = slice.deserialize(value) {
                self.roll_back(previous);
                return Err(e);
            }
        }
        Ok(())
    }

    fn roll_back(&mut self, previous: SliceData) {
        for (name, value) in previous {
            if let Some(slice) = self.slices.get_mut(name.as_str())
                && let Err(e) = slice.deserialize(value)
            {
                tracing::error!(slice = %name, error = %e, "Failed to roll back state slice");
            }
        }
    }

    pub fn reset(&mut self, scopes: &[ResetScope]) {
        for slice in self.slices.values_mut() {
            slice.reset(scopes);
        }
    }

    pub fn show(&self) -> Vec<(&'static str, Vec<String>)> {
        self.slices
            .iter()
            .filter_map(|(name, slice)| slice.show().map(|lines| (*name, lines)))
            .collect()
    }

    pub fn transferable_names(&self) -> Vec<&'static str> {
        self.slices
            .iter()
            .filter(|(_, slice)| slice.transfers_to_sub_agents())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Lets each named slice present in this registry pull its state from
    /// `parent`. Names the child does not carry are skipped.
    pub fn transfer_from_parent(
        &mut self,
        parent: &Agent,
        names: &[&'static str],
    ) -> Result<(), SliceError> {
        for name in names {
            if let Some(slice) = self.slices.get_mut(name) {
                slice.transfer_from_parent(parent)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Counter {
        value: u64,
    }

    impl StateSlice for Counter {
        fn name(&self) -> &'static str {
            Self::NAME
        }

        fn reset(&mut self, scopes: &[ResetScope]) {
            if scopes.contains(&ResetScope::Costs) {
                self.value = 0;
            }
        }

        fn serialize(&self) -> Result<serde_json::Value, SliceError> {
            Ok(json!({ "value": self.value }))
        }

        fn deserialize(&mut self, data: serde_json::Value) -> Result<(), SliceError> {
            self.value = data
                .get("value")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| SliceError::deserialize(Self::NAME, "missing value"))?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl SliceKind for Counter {
        const NAME: &'static str = "counter";
        type Init = u64;

        fn initialize(init: u64) -> Self {
            Self { value: init }
        }
    }

    #[test]
    fn mutate_and_read_by_name() {
        let mut registry = SliceRegistry::new();
        registry.initialize_state::<Counter>(3);

        let after = registry
            .mutate_state::<Counter, _>(|c| {
                c.value += 2;
                c.value
            })
            .unwrap();
        assert_eq!(after, 5);
        assert_eq!(registry.get_state::<Counter, _>(|c| c.value).unwrap(), 5);
    }

    #[test]
    fn uninitialized_slice_is_not_found() {
        let mut registry = SliceRegistry::new();
        let err = registry
            .mutate_state::<Counter, _>(|c| c.value)
            .unwrap_err();
        assert!(matches!(err, SliceError::NotFound { name } if name == "counter"));
    }

    #[test]
    fn reinitializing_overwrites() {
        let mut registry = SliceRegistry::new();
        registry.initialize_state::<Counter>(3);
        registry.initialize_state::<Counter>(9);
        assert_eq!(registry.get_state::<Counter, _>(|c| c.value).unwrap(), 9);
        assert_eq!(registry.names(), vec!["counter"]);
    }

    #[test]
    fn deserialize_reports_unknown_keys() {
        let mut registry = SliceRegistry::new();
        registry.initialize_state::<Counter>(0);

        let mut data = SliceData::new();
        data.insert("counter".to_string(), json!({ "value": 11 }));
        data.insert("retired".to_string(), json!({}));

        let mut missing = Vec::new();
        registry
            .deserialize(data, |name| missing.push(name.to_string()))
            .unwrap();

        assert_eq!(missing, vec!["retired".to_string()]);
        assert_eq!(registry.get_state::<Counter, _>(|c| c.value).unwrap(), 11);
    }

    #[derive(Debug, Default)]
    struct Label {
        text: String,
    }

    impl StateSlice for Label {
        fn name(&self) -> &'static str {
            Self::NAME
        }

        fn reset(&mut self, _scopes: &[ResetScope]) {}

        fn serialize(&self) -> Result<serde_json::Value, SliceError> {
            Ok(json!(self.text))
        }

        fn deserialize(&mut self, data: serde_json::Value) -> Result<(), SliceError> {
            self.text = serde_json::from_value(data)
                .map_err(|e| SliceError::deserialize(Self::NAME, e))?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl SliceKind for Label {
        const NAME: &'static str = "label";
        type Init = String;

        fn initialize(init: String) -> Self {
            Self { text: init }
        }
    }

    #[test]
    fn failed_deserialize_leaves_every_slice_untouched() {
        let mut registry = SliceRegistry::new();
        registry.initialize_state::<Counter>(3);
        registry.initialize_state::<Label>("draft".to_string());

        let mut data = SliceData::new();
        data.insert("counter".to_string(), json!({ "value": 11 }));
        data.insert("label".to_string(), json!(42));

        let err = registry.deserialize(data, |_| {}).unwrap_err();
        assert!(matches!(err, SliceError::Deserialize { name, .. } if name == "label"));
        assert_eq!(registry.get_state::<Counter, _>(|c| c.value).unwrap(), 3);
        assert_eq!(
            registry.get_state::<Label, _>(|l| l.text.clone()).unwrap(),
            "draft"
        );
    }

    #[test]
    fn serialize_round_trips() {
        let mut registry = SliceRegistry::new();
        registry.initialize_state::<Counter>(42);
        let data = registry.serialize().unwrap();

        let mut restored = SliceRegistry::new();
        restored.initialize_state::<Counter>(0);
        restored.deserialize(data, |_| {}).unwrap();
        assert_eq!(restored.get_state::<Counter, _>(|c| c.value).unwrap(), 42);
    }

    #[test]
    fn reset_only_touches_bound_scopes() {
        let mut registry = SliceRegistry::new();
        registry.initialize_state::<Counter>(7);

        registry.reset(&[ResetScope::Chat]);
        assert_eq!(registry.get_state::<Counter, _>(|c| c.value).unwrap(), 7);

        registry.reset(&[ResetScope::Chat, ResetScope::Costs]);
        assert_eq!(registry.get_state::<Counter, _>(|c| c.value).unwrap(), 0);
    }
}
