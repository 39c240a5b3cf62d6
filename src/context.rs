//! Conversation Context
//!
//! Per-conversation rolling log of entity observations plus a monotonic
//! message counter and a bounded state-visit history. The counter is the
//! conversation's logical clock: it advances by exactly one per inbound
//! event, and every entity value is stamped with the counter at which it
//! arrived, so "how many messages ago" queries stay cheap.
//!
//! The context is owned by its conversation and only mutated by the resolver
//! while the conversation's lock is held.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entity::{EntityObservation, EntityValue};
use crate::query::EntityQuery;

/// Default per-entity depth cap (oldest values truncated)
pub const DEFAULT_MAX_DEPTH: usize = 30;

/// Default state-visit history cap
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// One entry in the state-visit history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateVisit {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-conversation entity context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    /// Monotonic logical clock, incremented once per inbound event
    counter: u64,

    /// Entity name -> values, newest first
    entities: HashMap<String, Vec<EntityValue>>,

    /// Bounded state-visit history, oldest first
    history: Vec<StateVisit>,

    /// State that was current when the last observation was recorded
    #[serde(default)]
    current_state: String,

    #[serde(skip, default = "default_max_depth")]
    max_depth: usize,

    #[serde(skip, default = "default_history_limit")]
    history_limit: usize,

    /// In-memory identity, used to refuse cross-context query algebra.
    /// Regenerated on load; queries are only combined within one instance.
    #[serde(skip, default = "Uuid::new_v4")]
    context_id: Uuid,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            counter: 0,
            entities: HashMap::new(),
            history: Vec::new(),
            current_state: String::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            history_limit: DEFAULT_HISTORY_LIMIT,
            context_id: Uuid::new_v4(),
        }
    }

    pub fn with_limits(max_depth: usize, history_limit: usize) -> Self {
        let mut ctx = Self::new();
        ctx.set_limits(max_depth, history_limit);
        ctx
    }

    /// Limits are not part of the serialized blob; a restored context must
    /// have them re-applied from configuration.
    pub fn set_limits(&mut self, max_depth: usize, history_limit: usize) {
        self.max_depth = max_depth.max(1);
        self.history_limit = history_limit;
    }

    /// Deserialize a context blob. A blob from an older schema falls back to
    /// an empty context rather than erroring.
    pub fn from_blob(blob: &str) -> Self {
        match serde_json::from_str(blob) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("Failed to load context blob, starting fresh: {}", e);
                Self::new()
            }
        }
    }

    /// Serialize this context for the snapshot store.
    pub fn to_blob(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// State stamped onto newly observed values
    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    pub fn set_current_state(&mut self, state_name: &str) {
        self.current_state = state_name.to_string();
    }

    /// Record one inbound event's entities. Increments the counter by exactly
    /// one, then prepends every observation carrying a value, newest first.
    /// Compound observations with a role are stored under `name__role`.
    pub fn add_observation(&mut self, entities: &HashMap<String, Vec<EntityObservation>>) {
        self.counter += 1;
        for (name, observations) in entities {
            for obs in observations {
                let key = match &obs.role {
                    Some(role) => format!("{}__{}", name, role),
                    None => name.clone(),
                };
                match EntityValue::from_observation(&key, obs, self.counter, &self.current_state) {
                    Some(value) => self.prepend(key, value),
                    None => debug!("Dropping observation of '{}' without a value", name),
                }
            }
        }
    }

    /// Store a derived value at the current counter (does not advance it).
    /// Used by actions to remember computed facts.
    pub fn set_value(&mut self, name: &str, value: serde_json::Value) {
        let entity = EntityValue {
            name: name.to_string(),
            value,
            attributes: HashMap::new(),
            role: None,
            counter: self.counter,
            timestamp: Utc::now(),
            state_set: self.current_state.clone(),
        };
        self.prepend(name.to_string(), entity);
    }

    fn prepend(&mut self, name: String, value: EntityValue) {
        let list = self.entities.entry(name).or_default();
        list.insert(0, value);
        list.truncate(self.max_depth);
    }

    /// Lazily filterable view over an entity's values, newest first.
    pub fn query(&self, name: &str) -> EntityQuery {
        let items = self.entities.get(name).cloned().unwrap_or_default();
        EntityQuery::new(self.context_id, self.counter, name, items)
    }

    /// True iff the entity has at least one value in context.
    pub fn contains(&self, name: &str) -> bool {
        self.entities.get(name).map_or(false, |v| !v.is_empty())
    }

    /// Newest value of an entity, if any.
    pub fn get(&self, name: &str) -> Option<&EntityValue> {
        self.entities.get(name).and_then(|v| v.first())
    }

    /// Newest value of an entity as JSON, if any.
    pub fn get_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.get(name).map(|e| &e.value)
    }

    /// Drop all values of the given entities.
    pub fn clear(&mut self, names: &[&str]) {
        for name in names {
            self.entities.remove(*name);
        }
    }

    /// Append a state visit, evicting the oldest entries beyond the cap.
    pub fn add_state_visit(&mut self, state_name: &str) {
        self.history.push(StateVisit {
            name: state_name.to_string(),
            timestamp: Utc::now(),
        });
        if self.history.len() > self.history_limit {
            let excess = self.history.len() - self.history_limit;
            self.history.drain(..excess);
        }
    }

    pub fn history(&self) -> &[StateVisit] {
        &self.history
    }

    /// State visited `steps_back` messages ago (1 = the previous visit).
    pub fn history_state(&self, steps_back: usize) -> Option<&StateVisit> {
        if steps_back == 0 || steps_back > self.history.len() {
            return None;
        }
        self.history.get(self.history.len() - steps_back)
    }

    /// Entity names present in this context
    pub fn entity_names(&self) -> impl Iterator<Item = &String> {
        self.entities.keys()
    }

    /// Compact context dump for error reports
    pub fn debug_dump(&self, max_age: u64) -> String {
        let mut lines = vec![format!("counter={}", self.counter)];
        for (name, values) in &self.entities {
            if let Some(newest) = values.first() {
                let age = self.counter.saturating_sub(newest.counter);
                if age <= max_age {
                    lines.push(format!("{} (age {}): {}", name, age, newest.value));
                }
            }
        }
        lines.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obs_map(pairs: &[(&str, &str)]) -> HashMap<String, Vec<EntityObservation>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), vec![EntityObservation::text(v)]))
            .collect()
    }

    #[test]
    fn test_counter_monotonicity() {
        let mut ctx = Context::new();
        assert_eq!(ctx.counter(), 0);
        for i in 1..=5 {
            ctx.add_observation(&obs_map(&[("greeting", "hi")]));
            assert_eq!(ctx.counter(), i);
        }
    }

    #[test]
    fn test_newest_first() {
        let mut ctx = Context::new();
        ctx.add_observation(&obs_map(&[("city", "Prague")]));
        ctx.add_observation(&obs_map(&[("city", "Brno")]));
        ctx.add_observation(&obs_map(&[("city", "Ostrava")]));

        let query = ctx.query("city");
        let counters: Vec<u64> = query.iter().map(|v| v.counter).collect();
        assert_eq!(counters, vec![3, 2, 1]);
        assert_eq!(ctx.get("city").unwrap().as_str(), Some("Ostrava"));
    }

    #[test]
    fn test_valueless_observation_dropped() {
        let mut ctx = Context::new();
        let mut entities = HashMap::new();
        entities.insert(
            "datetime".to_string(),
            vec![EntityObservation {
                value: None,
                attributes: HashMap::new(),
                role: None,
            }],
        );
        ctx.add_observation(&entities);
        assert_eq!(ctx.counter(), 1);
        assert!(!ctx.contains("datetime"));
    }

    #[test]
    fn test_role_stored_under_compound_name() {
        let mut ctx = Context::new();
        let mut entities = HashMap::new();
        entities.insert(
            "datetime".to_string(),
            vec![EntityObservation::text("friday").with_role("departure")],
        );
        ctx.add_observation(&entities);
        assert!(ctx.contains("datetime__departure"));
        assert!(!ctx.contains("datetime"));
    }

    #[test]
    fn test_max_depth_truncation() {
        let mut ctx = Context::with_limits(3, 20);
        for i in 0..5 {
            ctx.add_observation(&obs_map(&[("n", &i.to_string())]));
        }
        assert_eq!(ctx.query("n").count(), 3);
        // newest survives
        assert_eq!(ctx.get("n").unwrap().as_str(), Some("4"));
    }

    #[test]
    fn test_history_eviction() {
        let mut ctx = Context::with_limits(30, 3);
        for name in ["a", "b", "c", "d", "e"] {
            ctx.add_state_visit(name);
        }
        let names: Vec<&str> = ctx.history().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["c", "d", "e"]);
        assert_eq!(ctx.history_state(1).unwrap().name, "e");
        assert_eq!(ctx.history_state(3).unwrap().name, "c");
        assert!(ctx.history_state(4).is_none());
    }

    #[test]
    fn test_blob_roundtrip() {
        let mut ctx = Context::new();
        ctx.set_current_state("default.root");
        ctx.add_observation(&obs_map(&[("city", "Prague")]));
        ctx.add_state_visit("booking.root");
        ctx.set_value("total", json!(42));

        let blob = ctx.to_blob();
        let restored = Context::from_blob(&blob);
        assert_eq!(restored.counter(), 1);
        assert_eq!(restored.get("city").unwrap().as_str(), Some("Prague"));
        assert_eq!(restored.get_value("total"), Some(&json!(42)));
        assert_eq!(restored.history().len(), 1);
    }

    #[test]
    fn test_bad_blob_falls_back_to_empty() {
        let ctx = Context::from_blob("not json at all");
        assert_eq!(ctx.counter(), 0);
    }

    #[test]
    fn test_set_value_does_not_advance_counter() {
        let mut ctx = Context::new();
        ctx.add_observation(&obs_map(&[("city", "Prague")]));
        ctx.set_value("derived", json!("x"));
        assert_eq!(ctx.counter(), 1);
        assert_eq!(ctx.get("derived").unwrap().counter, 1);
    }
}
