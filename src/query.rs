//! Entity Queries
//!
//! A lazily filterable, newest-first view over one entity's values in a
//! context. Age filters accept exactly one criterion - logical message
//! distance, wall-clock delta, or absolute time - and reject ambiguous
//! combinations. Set algebra is only allowed between queries of the same
//! context instance.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::entity::EntityValue;
use crate::error::QueryError;

/// Age criterion for query filters. Exactly one field may be set.
#[derive(Debug, Clone, Default)]
pub struct Window {
    /// Logical distance in messages
    pub messages: Option<u64>,
    /// Wall-clock distance from now
    pub delta: Option<Duration>,
    /// Absolute instant
    pub at: Option<DateTime<Utc>>,
}

enum Criterion {
    Messages(u64),
    Instant(DateTime<Utc>),
}

impl Window {
    pub fn messages(n: u64) -> Self {
        Self {
            messages: Some(n),
            ..Default::default()
        }
    }

    pub fn within(delta: Duration) -> Self {
        Self {
            delta: Some(delta),
            ..Default::default()
        }
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        Self {
            at: Some(instant),
            ..Default::default()
        }
    }

    fn criterion(&self) -> Result<Criterion, QueryError> {
        let set = self.messages.is_some() as u8 + self.delta.is_some() as u8 + self.at.is_some() as u8;
        if set > 1 {
            return Err(QueryError::AmbiguousFilter);
        }
        if let Some(n) = self.messages {
            Ok(Criterion::Messages(n))
        } else if let Some(delta) = self.delta {
            Ok(Criterion::Instant(Utc::now() - delta))
        } else if let Some(at) = self.at {
            Ok(Criterion::Instant(at))
        } else {
            Err(QueryError::EmptyFilter)
        }
    }
}

/// Filterable view over an entity's values, newest first.
#[derive(Debug, Clone)]
pub struct EntityQuery {
    context_id: Uuid,
    context_counter: u64,
    name: String,
    items: Vec<EntityValue>,
}

impl EntityQuery {
    pub(crate) fn new(
        context_id: Uuid,
        context_counter: u64,
        name: &str,
        items: Vec<EntityValue>,
    ) -> Self {
        Self {
            context_id,
            context_counter,
            name: name.to_string(),
            items,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keep values newer than the given age.
    pub fn newer_than(mut self, window: Window) -> Result<Self, QueryError> {
        match window.criterion()? {
            Criterion::Messages(n) => {
                let now = self.context_counter;
                self.items.retain(|v| now - v.counter < n);
            }
            Criterion::Instant(t) => self.items.retain(|v| v.timestamp > t),
        }
        Ok(self)
    }

    /// Keep values older than the given age.
    pub fn older_than(mut self, window: Window) -> Result<Self, QueryError> {
        match window.criterion()? {
            Criterion::Messages(n) => {
                let now = self.context_counter;
                self.items.retain(|v| now - v.counter > n);
            }
            Criterion::Instant(t) => self.items.retain(|v| v.timestamp < t),
        }
        Ok(self)
    }

    /// Keep values at exactly the given age. Wall-clock comparisons use a
    /// one second tolerance.
    pub fn exactly(mut self, window: Window) -> Result<Self, QueryError> {
        match window.criterion()? {
            Criterion::Messages(n) => {
                let now = self.context_counter;
                self.items.retain(|v| now - v.counter == n);
            }
            Criterion::Instant(t) => {
                self.items
                    .retain(|v| (v.timestamp - t).num_milliseconds().abs() < 1000);
            }
        }
        Ok(self)
    }

    /// The most recent value. With `this_msg_only`, returns `None` unless
    /// that value arrived with the current message.
    pub fn first(&self, this_msg_only: bool) -> Option<&EntityValue> {
        let item = self.items.first()?;
        if this_msg_only && item.counter != self.context_counter {
            return None;
        }
        Some(item)
    }

    /// Value of the most recent entity, see [`first`](Self::first).
    pub fn first_value(&self, this_msg_only: bool) -> Option<&serde_json::Value> {
        self.first(this_msg_only).map(|v| &v.value)
    }

    /// Age of the newest value in messages, or -1 when empty.
    pub fn age(&self) -> i64 {
        match self.items.iter().max_by_key(|v| v.counter) {
            Some(newest) => (self.context_counter - newest.counter) as i64,
            None => -1,
        }
    }

    /// All values sharing the newest age, duplicates removed, oldest first.
    pub fn all_newest(&self) -> Vec<&EntityValue> {
        let mut found_counter = None;
        let mut seen = Vec::new();
        let mut values = Vec::new();
        for item in &self.items {
            match found_counter {
                Some(c) if item.counter != c => break,
                _ => found_counter = Some(item.counter),
            }
            if seen.contains(&&item.value) {
                continue;
            }
            seen.push(&item.value);
            values.push(item);
        }
        values.reverse();
        values
    }

    /// Values of all present entities, newest first.
    pub fn values(&self) -> Vec<&serde_json::Value> {
        self.items.iter().map(|v| &v.value).collect()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityValue> {
        self.items.iter()
    }

    /// Union with another query of the same context.
    pub fn union(self, other: EntityQuery) -> Result<Self, QueryError> {
        if self.context_id != other.context_id {
            return Err(QueryError::ContextMismatch);
        }
        let name = format!("{}|{}", self.name, other.name);
        let mut items = self.items;
        for item in other.items {
            if !items.contains(&item) {
                items.push(item);
            }
        }
        items.sort_by(|a, b| b.counter.cmp(&a.counter));
        Ok(Self {
            context_id: self.context_id,
            context_counter: self.context_counter,
            name,
            items,
        })
    }

    /// Intersection with another query of the same context.
    pub fn intersect(self, other: EntityQuery) -> Result<Self, QueryError> {
        if self.context_id != other.context_id {
            return Err(QueryError::ContextMismatch);
        }
        let mut items = self.items;
        items.retain(|v| other.items.contains(v));
        Ok(Self {
            context_id: self.context_id,
            context_counter: self.context_counter,
            name: self.name,
            items,
        })
    }
}
