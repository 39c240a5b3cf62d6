//! Action Registry
//!
//! Actions are plain functions of the accumulated dialog, registered under a
//! symbolic name and resolved when the flow graph is built, so a bad
//! reference fails at load time instead of mid-conversation.
//!
//! An action may send messages and create schedules through the [`Dialog`]
//! handle (side effects, buffered), and returns where the conversation should
//! go next - or nowhere.

use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::channel::Response;
use crate::context::Context;
use crate::dialog::Dialog;

/// What an action tells the resolver to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Stay in the current state
    Stay,
    /// Move to a destination written as `flow.state`, `state`, with an
    /// optional trailing `:` to also execute the destination's action
    Move(String),
    /// Return to the state visited n steps back in history
    Back(u32),
}

/// A registered action function.
pub type ActionFn = Arc<dyn Fn(&mut Dialog) -> Result<ActionOutcome> + Send + Sync>;

/// A registered condition predicate, used by condition requirements.
pub type ConditionFn = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// A named, callable action.
#[derive(Clone)]
pub struct Action {
    name: String,
    func: ActionFn,
}

impl Action {
    pub fn new(name: &str, func: ActionFn) -> Self {
        Self {
            name: name.to_string(),
            func,
        }
    }

    /// An action that sends a fixed text reply and optionally moves on.
    /// This is what inline `{ text = "...", next = "..." }` definitions
    /// compile to.
    pub fn reply(text: &str, next: Option<&str>) -> Self {
        let text = text.to_string();
        let next = next.map(str::to_string);
        let label = format!("reply({})", text);
        Self::new(
            &label,
            Arc::new(move |dialog: &mut Dialog| {
                dialog.send(Response::text(&text));
                Ok(match &next {
                    Some(dest) => ActionOutcome::Move(dest.clone()),
                    None => ActionOutcome::Stay,
                })
            }),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self, dialog: &mut Dialog) -> Result<ActionOutcome> {
        (self.func)(dialog)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({})", self.name)
    }
}

/// Compile-time registry mapping symbolic action and condition names to
/// functions.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Action>,
    conditions: HashMap<String, ConditionFn>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its symbolic name. Re-registering a name
    /// replaces the previous function.
    pub fn register<F>(&mut self, name: &str, func: F) -> &mut Self
    where
        F: Fn(&mut Dialog) -> Result<ActionOutcome> + Send + Sync + 'static,
    {
        self.actions
            .insert(name.to_string(), Action::new(name, Arc::new(func)));
        self
    }

    /// Register a condition predicate for use in `require` blocks.
    pub fn register_condition<F>(&mut self, name: &str, predicate: F) -> &mut Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.conditions.insert(name.to_string(), Arc::new(predicate));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn get_condition(&self, name: &str) -> Option<&ConditionFn> {
        self.conditions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
