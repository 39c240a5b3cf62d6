//! Entity Values
//!
//! An `EntityObservation` is what extractors hand to the engine: a value plus
//! whatever extra attributes the extractor produced. An `EntityValue` is one
//! observation pinned into a conversation's context, stamped with the logical
//! message counter and wall-clock time at which it arrived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A raw entity observation produced by an extractor or carried in a payload.
///
/// All downstream consumers share this one contract; extractors no longer
/// hand over arbitrary dict shapes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityObservation {
    /// The extracted value. Observations without a value are dropped.
    pub value: Option<serde_json::Value>,

    /// Extra attributes from the extractor (confidence, grain, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,

    /// Role of a compound observation; stored under `name__role`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl EntityObservation {
    /// Observation holding a plain string value
    pub fn text(value: &str) -> Self {
        Self {
            value: Some(serde_json::Value::String(value.to_string())),
            attributes: HashMap::new(),
            role: None,
        }
    }

    /// Observation holding an arbitrary JSON value
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            value: Some(value),
            attributes: HashMap::new(),
            role: None,
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }
}

/// One entity value in context. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityValue {
    pub name: String,
    pub value: serde_json::Value,

    /// Raw attributes as returned by the extractor
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Logical message counter at which the value was observed
    pub counter: u64,

    /// Wall-clock time of the observation
    pub timestamp: DateTime<Utc>,

    /// Name of the state that was current when the value was set
    #[serde(default)]
    pub state_set: String,
}

impl EntityValue {
    pub(crate) fn from_observation(
        name: &str,
        obs: &EntityObservation,
        counter: u64,
        state_set: &str,
    ) -> Option<Self> {
        let value = obs.value.clone()?;
        Some(Self {
            name: name.to_string(),
            value,
            attributes: obs.attributes.clone(),
            role: obs.role.clone(),
            counter,
            timestamp: Utc::now(),
            state_set: state_set.to_string(),
        })
    }

    /// Value as a string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Raw attribute accessor
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_without_value_is_dropped() {
        let obs = EntityObservation {
            value: None,
            attributes: HashMap::new(),
            role: None,
        };
        assert!(EntityValue::from_observation("datetime", &obs, 1, "").is_none());
    }

    #[test]
    fn test_observation_to_value() {
        let obs = EntityObservation::text("tomorrow")
            .with_attribute("grain", serde_json::json!("day"));
        let value = EntityValue::from_observation("datetime", &obs, 7, "default.root").unwrap();
        assert_eq!(value.name, "datetime");
        assert_eq!(value.as_str(), Some("tomorrow"));
        assert_eq!(value.counter, 7);
        assert_eq!(value.attribute("grain"), Some(&serde_json::json!("day")));
        assert_eq!(value.state_set, "default.root");
    }
}
