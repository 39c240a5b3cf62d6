//! Flow Graph
//!
//! A flow is a named group of states sharing a topic; a state is a node with
//! an action, optional requirements gating that action, and a set of entities
//! it can handle without transitioning. The graph is built once from
//! declarative TOML definitions, validated eagerly (duplicate flows, missing
//! `default.root`, unknown action names, bad intent patterns), and shared
//! read-only behind an `Arc`. Hot reload is a full rebuild plus pointer swap,
//! never partial mutation.

use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::info;

use crate::action::{Action, ActionRegistry, ConditionFn};
use crate::context::Context;
use crate::error::FlowError;

/// Name of the mandatory entry flow
pub const DEFAULT_FLOW: &str = "default";

/// Name of the mandatory entry state, `default.root`
pub const ROOT_STATE: &str = "default.root";

// ============ Definition schema (TOML) ============

/// One flow as written in a definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowDefinition {
    /// Accepted intents regex; defaults to the flow name
    pub intent: Option<String>,

    /// Entity names that pull the conversation into this flow
    #[serde(default)]
    pub accepts: Vec<String>,

    pub states: Vec<StateDefinition>,

    /// Flow-level handler for messages no state could handle
    pub unsupported: Option<ActionDef>,
}

/// One state as written in a definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    pub action: Option<ActionDef>,
    pub intent: Option<String>,
    #[serde(default)]
    pub require: Vec<RequirementDef>,
    #[serde(default)]
    pub supports: Vec<SupportDef>,
    pub unsupported: Option<ActionDef>,
    #[serde(default)]
    pub temporary: bool,
}

/// An action reference: either a registered name or an inline reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ActionDef {
    Named(String),
    Message {
        text: String,
        next: Option<String>,
    },
}

/// A `supports` entry: a bare entity name, or specific values per entity.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SupportDef {
    Name(String),
    Values(BTreeMap<String, ValueOrList>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ValueOrList {
    One(String),
    Many(Vec<String>),
}

/// A requirement gating a state's action: an entity (with optional exact
/// value filter) or a named condition predicate, plus the action asking for
/// the missing piece.
#[derive(Debug, Clone, Deserialize)]
pub struct RequirementDef {
    pub slot: Option<String>,
    pub entity: Option<String>,
    pub filter: Option<String>,
    pub condition: Option<String>,
    pub action: ActionDef,
}

// ============ Runtime structures ============

/// A key in a state's `supported` set: an entity name, or a specific
/// (entity, value) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SupportKey {
    Name(String),
    Value(String, String),
}

/// A precondition with its fallback action.
pub enum Requirement {
    Entity {
        slot: Option<String>,
        entity: String,
        value_filter: Option<String>,
        action: Action,
    },
    Condition {
        name: String,
        predicate: ConditionFn,
        action: Action,
    },
}

impl Requirement {
    /// Whether the requirement is met by the accumulated context.
    pub fn matches(&self, context: &Context) -> bool {
        match self {
            Requirement::Entity {
                entity,
                value_filter,
                ..
            } => match value_filter {
                None => context.contains(entity),
                Some(expected) => context
                    .query(entity)
                    .iter()
                    .any(|v| v.as_str() == Some(expected.as_str())),
            },
            Requirement::Condition { predicate, .. } => predicate(context),
        }
    }

    /// The action to run instead of the state's own while unmet.
    pub fn action(&self) -> &Action {
        match self {
            Requirement::Entity { action, .. } => action,
            Requirement::Condition { action, .. } => action,
        }
    }
}

impl std::fmt::Debug for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requirement::Entity { entity, .. } => write!(f, "Requirement::Entity({})", entity),
            Requirement::Condition { name, .. } => write!(f, "Requirement::Condition({})", name),
        }
    }
}

/// A conversation state.
#[derive(Debug)]
pub struct State {
    pub name: String,
    pub action: Option<Action>,
    pub intent: Option<Regex>,
    pub requirements: Vec<Requirement>,
    /// A temporary state fires its action once; unrecognized messages fall
    /// back to `default.root` instead of lingering here.
    pub is_temporary: bool,
    pub supported: HashSet<SupportKey>,
    pub unsupported: Option<Action>,
}

impl State {
    /// Whether this state can handle a message carrying the given keys.
    pub fn is_supported(&self, keys: &HashSet<SupportKey>) -> bool {
        !self.supported.is_disjoint(keys)
    }

    /// Whether all requirements are met.
    pub fn check_requirements(&self, context: &Context) -> bool {
        self.requirements.iter().all(|r| r.matches(context))
    }

    /// The first requirement that is not met, declaration order.
    pub fn first_unmet_requirement(&self, context: &Context) -> Option<&Requirement> {
        self.requirements.iter().find(|r| !r.matches(context))
    }
}

/// A named group of states.
#[derive(Debug)]
pub struct Flow {
    pub name: String,
    pub intent: Regex,
    pub states: HashMap<String, State>,
    /// Definition order; intent searches must be deterministic
    state_order: Vec<String>,
    pub accepted: HashSet<String>,
    pub unsupported: Option<Action>,
}

impl Flow {
    pub fn get_state(&self, state_name: &str) -> Option<&State> {
        self.states.get(state_name)
    }

    /// Iterate states in definition order.
    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.state_order.iter().filter_map(move |n| self.states.get(n))
    }

    /// Qualified name of the first state whose intent pattern matches,
    /// in definition order.
    pub fn state_for_intent(&self, intent: &str) -> Option<String> {
        self.states()
            .find(|s| s.intent.as_ref().is_some_and(|p| p.is_match(intent)))
            .map(|s| format!("{}.{}", self.name, s.name))
    }

    /// Whether this flow accepts the intent at its top level.
    pub fn matches_intent(&self, intent: &str) -> bool {
        self.intent.is_match(intent)
    }

    /// Whether any of the given entity names pulls into this flow.
    pub fn accepts_any<'a>(&self, entity_names: impl Iterator<Item = &'a String>) -> bool {
        let mut names = entity_names;
        names.any(|n| self.accepted.contains(n))
    }
}

/// The full, immutable flow graph.
#[derive(Debug, Default)]
pub struct FlowGraph {
    flows: HashMap<String, Flow>,
    /// Definition order; flow searches must be deterministic
    order: Vec<String>,
}

impl FlowGraph {
    /// Build a graph from named definitions, resolving action references
    /// against the registry. The same flow name appearing twice (e.g. in two
    /// merged files) is an error, as is a graph without `default.root`.
    pub fn build(
        definitions: impl IntoIterator<Item = (String, FlowDefinition)>,
        registry: &ActionRegistry,
    ) -> Result<Self, FlowError> {
        let mut flows = HashMap::new();
        let mut order = Vec::new();
        for (name, definition) in definitions {
            if flows.contains_key(&name) {
                return Err(FlowError::DuplicateFlow(name));
            }
            let flow = Self::build_flow(&name, definition, registry)?;
            order.push(name.clone());
            flows.insert(name, flow);
        }

        let graph = Self { flows, order };
        if graph.get_state(DEFAULT_FLOW, "root").is_none() {
            return Err(FlowError::MissingRootState);
        }

        let mut names: Vec<&String> = graph.flows.keys().collect();
        names.sort();
        info!("Initialized {} flows: {:?}", names.len(), names);
        Ok(graph)
    }

    /// Build a graph from one TOML document.
    pub fn from_toml_str(document: &str, registry: &ActionRegistry) -> Result<Self, FlowError> {
        let definitions: BTreeMap<String, FlowDefinition> =
            toml::from_str(document).map_err(|e| FlowError::BadDefinition {
                path: "<inline>".to_string(),
                reason: e.to_string(),
            })?;
        Self::build(definitions, registry)
    }

    /// Build a graph by merging several TOML files.
    pub fn from_toml_files<P: AsRef<Path>>(
        paths: &[P],
        registry: &ActionRegistry,
    ) -> Result<Self, FlowError> {
        let mut merged: Vec<(String, FlowDefinition)> = Vec::new();
        for path in paths {
            let path_str = path.as_ref().display().to_string();
            let document =
                std::fs::read_to_string(path.as_ref()).map_err(|e| FlowError::BadDefinition {
                    path: path_str.clone(),
                    reason: e.to_string(),
                })?;
            let definitions: BTreeMap<String, FlowDefinition> = toml::from_str(&document)
                .map_err(|e| FlowError::BadDefinition {
                    path: path_str.clone(),
                    reason: e.to_string(),
                })?;
            merged.extend(definitions);
        }
        Self::build(merged, registry)
    }

    pub fn get_flow(&self, name: &str) -> Option<&Flow> {
        self.flows.get(name)
    }

    pub fn get_state(&self, flow_name: &str, state_name: &str) -> Option<&State> {
        self.flows.get(flow_name).and_then(|f| f.get_state(state_name))
    }

    /// Look up a state by its qualified `flow.state` name.
    pub fn get_state_qualified(&self, qualified: &str) -> Option<&State> {
        let (flow, state) = qualified.split_once('.')?;
        self.get_state(flow, state)
    }

    /// Iterate flows in definition order.
    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.order.iter().filter_map(move |name| self.flows.get(name))
    }

    fn build_flow(
        name: &str,
        definition: FlowDefinition,
        registry: &ActionRegistry,
    ) -> Result<Flow, FlowError> {
        let intent_pattern = definition.intent.unwrap_or_else(|| name.to_string());
        let intent = compile_anchored(&intent_pattern, &format!("flow {}", name))?;

        let mut states = HashMap::new();
        let mut state_order = Vec::new();
        for state_def in definition.states {
            let state = Self::build_state(name, state_def, registry)?;
            state_order.push(state.name.clone());
            states.insert(state.name.clone(), state);
        }

        let unsupported = definition
            .unsupported
            .map(|def| resolve_action(&def, registry, &format!("flow {}", name)))
            .transpose()?;

        Ok(Flow {
            name: name.to_string(),
            intent,
            states,
            state_order,
            accepted: definition.accepts.into_iter().collect(),
            unsupported,
        })
    }

    fn build_state(
        flow_name: &str,
        definition: StateDefinition,
        registry: &ActionRegistry,
    ) -> Result<State, FlowError> {
        let location = format!("state {}.{}", flow_name, definition.name);

        let action = definition
            .action
            .map(|def| resolve_action(&def, registry, &location))
            .transpose()?;

        let intent = definition
            .intent
            .map(|pattern| compile_anchored(&pattern, &location))
            .transpose()?;

        let mut requirements = Vec::new();
        for req in definition.require {
            requirements.push(build_requirement(req, registry, &location)?);
        }

        let mut supported = HashSet::new();
        for entry in definition.supports {
            match entry {
                SupportDef::Name(entity) => {
                    supported.insert(SupportKey::Name(entity));
                }
                SupportDef::Values(map) => {
                    for (entity, values) in map {
                        match values {
                            ValueOrList::One(value) => {
                                supported.insert(SupportKey::Value(entity.clone(), value));
                            }
                            ValueOrList::Many(list) => {
                                for value in list {
                                    supported.insert(SupportKey::Value(entity.clone(), value));
                                }
                            }
                        }
                    }
                }
            }
        }
        // a state implicitly supports every entity its requirements collect
        for requirement in &requirements {
            if let Requirement::Entity { entity, .. } = requirement {
                supported.insert(SupportKey::Name(entity.clone()));
            }
        }

        let unsupported = definition
            .unsupported
            .map(|def| resolve_action(&def, registry, &location))
            .transpose()?;

        Ok(State {
            name: definition.name,
            action,
            intent,
            requirements,
            is_temporary: definition.temporary,
            supported,
            unsupported,
        })
    }
}

fn compile_anchored(pattern: &str, location: &str) -> Result<Regex, FlowError> {
    // match from the start of the intent, like the original re.match semantics
    Regex::new(&format!("^(?:{})", pattern)).map_err(|source| FlowError::InvalidIntentPattern {
        pattern: pattern.to_string(),
        location: location.to_string(),
        source,
    })
}

fn resolve_action(
    definition: &ActionDef,
    registry: &ActionRegistry,
    location: &str,
) -> Result<Action, FlowError> {
    match definition {
        ActionDef::Named(name) => registry
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::UnknownAction {
                action: name.clone(),
                location: location.to_string(),
            }),
        ActionDef::Message { text, next } => Ok(Action::reply(text, next.as_deref())),
    }
}

fn build_requirement(
    definition: RequirementDef,
    registry: &ActionRegistry,
    location: &str,
) -> Result<Requirement, FlowError> {
    let action = resolve_action(&definition.action, registry, location)?;
    match (definition.entity, definition.condition) {
        (Some(_), Some(_)) => Err(FlowError::AmbiguousRequirement {
            state: location.to_string(),
        }),
        (Some(entity), None) => Ok(Requirement::Entity {
            slot: definition.slot,
            entity,
            value_filter: definition.filter,
            action,
        }),
        (None, Some(condition)) => {
            let predicate =
                registry
                    .get_condition(&condition)
                    .cloned()
                    .ok_or_else(|| FlowError::UnknownAction {
                        action: condition.clone(),
                        location: location.to_string(),
                    })?;
            Ok(Requirement::Condition {
                name: condition,
                predicate,
                action,
            })
        }
        (None, None) => Err(FlowError::RequirementWithoutAction {
            state: location.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionOutcome;

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register("greet", |_| Ok(ActionOutcome::Stay));
        registry.register("ask_city", |_| Ok(ActionOutcome::Stay));
        registry.register_condition("has_city", |ctx| ctx.contains("city"));
        registry
    }

    const FLOWS_TOML: &str = r#"
[default]
intent = "(default|greeting)"
unsupported = { text = "Sorry, I did not get that." }

[[default.states]]
name = "root"
action = "greet"
supports = ["greeting"]

[booking]
intent = "book.*"
accepts = ["city", "datetime"]
unsupported = { text = "Let's get back to your booking." }

[[booking.states]]
name = "root"
action = { text = "Where to?", next = "destination" }

[[booking.states]]
name = "destination"
action = "greet"

[[booking.states.require]]
slot = "CITY"
entity = "city"
action = "ask_city"
"#;

    #[test]
    fn test_build_from_toml() {
        let graph = FlowGraph::from_toml_str(FLOWS_TOML, &registry()).unwrap();
        assert!(graph.get_state("default", "root").is_some());
        assert!(graph.get_state_qualified("booking.destination").is_some());
        assert!(graph.get_state_qualified("booking.missing").is_none());
        assert!(graph.get_flow("nope").is_none());

        let booking = graph.get_flow("booking").unwrap();
        assert!(booking.matches_intent("book_flight"));
        assert!(!booking.matches_intent("greeting"));
        assert!(booking.accepts_any(["city".to_string()].iter()));
        assert!(!booking.accepts_any(["weather".to_string()].iter()));
    }

    #[test]
    fn test_requirement_entities_are_supported() {
        let graph = FlowGraph::from_toml_str(FLOWS_TOML, &registry()).unwrap();
        let state = graph.get_state("booking", "destination").unwrap();
        let mut keys = HashSet::new();
        keys.insert(SupportKey::Name("city".to_string()));
        assert!(state.is_supported(&keys));
    }

    #[test]
    fn test_missing_root_state() {
        let toml = r#"
[help]
[[help.states]]
name = "root"
"#;
        let err = FlowGraph::from_toml_str(toml, &registry()).unwrap_err();
        assert!(matches!(err, FlowError::MissingRootState));
    }

    #[test]
    fn test_duplicate_flow() {
        let mut registry = registry();
        registry.register("noop", |_| Ok(ActionOutcome::Stay));
        let def = || FlowDefinition {
            intent: None,
            accepts: Vec::new(),
            states: vec![StateDefinition {
                name: "root".into(),
                action: Some(ActionDef::Named("noop".into())),
                intent: None,
                require: Vec::new(),
                supports: Vec::new(),
                unsupported: None,
                temporary: false,
            }],
            unsupported: None,
        };
        let err = FlowGraph::build(
            vec![("default".to_string(), def()), ("default".to_string(), def())],
            &registry,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::DuplicateFlow(_)));
    }

    #[test]
    fn test_unknown_action_fails_fast() {
        let toml = r#"
[default]
[[default.states]]
name = "root"
action = "does_not_exist"
"#;
        let err = FlowGraph::from_toml_str(toml, &registry()).unwrap_err();
        assert!(matches!(err, FlowError::UnknownAction { .. }));
    }

    #[test]
    fn test_condition_requirement() {
        let toml = r#"
[default]
[[default.states]]
name = "root"
action = "greet"

[[default.states]]
name = "confirm"
action = "greet"
[[default.states.require]]
condition = "has_city"
action = "ask_city"
"#;
        let graph = FlowGraph::from_toml_str(toml, &registry()).unwrap();
        let state = graph.get_state("default", "confirm").unwrap();

        let ctx = Context::new();
        assert!(!state.check_requirements(&ctx));
        assert!(state.first_unmet_requirement(&ctx).is_some());
    }

    #[test]
    fn test_supported_value_pairs() {
        let toml = r#"
[default]
[[default.states]]
name = "root"
action = "greet"
supports = [{ answer = ["yes", "no"] }]
"#;
        let graph = FlowGraph::from_toml_str(toml, &registry()).unwrap();
        let state = graph.get_state("default", "root").unwrap();

        let mut keys = HashSet::new();
        keys.insert(SupportKey::Value("answer".into(), "yes".into()));
        assert!(state.is_supported(&keys));

        let mut keys = HashSet::new();
        keys.insert(SupportKey::Value("answer".into(), "maybe".into()));
        assert!(!state.is_supported(&keys));
    }

    #[test]
    fn test_intent_pattern_anchored() {
        let graph = FlowGraph::from_toml_str(FLOWS_TOML, &registry()).unwrap();
        let default = graph.get_flow("default").unwrap();
        // must match from the start, "a_greeting" is not a greeting intent
        assert!(default.matches_intent("greeting"));
        assert!(!default.matches_intent("a_greeting"));
    }
}
