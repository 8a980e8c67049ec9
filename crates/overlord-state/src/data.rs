use crate::StateError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Keyed bag of opaque JSON values attached to the document, a change or a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBag(BTreeMap<String, Value>);

impl DataBag {
    /// Decode the value stored under `key`.
    ///
    /// Returns [`StateError::NoState`] when the key is absent, which callers
    /// routinely treat as "use the default".
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| StateError::NoState(key.to_owned()))?;
        T::deserialize(value).map_err(StateError::Serialization)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        let value = serde_json::to_value(value)?;
        self.0.insert(key.to_owned(), value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.0.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}
