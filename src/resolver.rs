//! Transition Resolver
//!
//! One inbound event goes through a fixed policy chain:
//! 1. reserved diagnostic commands
//! 2. explicit `_state` transition requested by the event itself
//! 3. intent transition (skipped when the current state handles the intent
//!    in place)
//! 4. entity transition into a flow that accepts one of the received entities
//! 5. accept in place when the current state supports the message
//! 6. unsupported fallback (state handler, then flow handler, then
//!    `default.root`)
//!
//! The resolver is synchronous and side-effect free: every response and
//! schedule request is buffered on the [`Dialog`] and returned in the
//! [`Resolution`], and the caller decides whether to persist the mutated
//! session. An action failure aborts the chain; the caller is expected to
//! discard the session so the conversation replays from its last good
//! snapshot.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::channel::{ConversationRef, Response};
use crate::config::Config;
use crate::context::Context;
use crate::dialog::{Dialog, ScheduleRequest};
use crate::entity::EntityObservation;
use crate::error::ResolveError;
use crate::action::{Action, ActionOutcome};
use crate::event::{Event, EventKind, INTENT_ENTITY, MESSAGE_TEXT_ENTITY, STATE_ENTITY, UNSUPPORTED_ENTITY};
use crate::flow::{FlowGraph, State, SupportKey, DEFAULT_FLOW, ROOT_STATE};
use crate::telemetry::TelemetryService;

/// Fixed diagnostic command answered without running the policy chain
const VERSION_COMMAND: &str = "/flowbot_version";

/// Prefix forcing a recognized intent, for manual testing
const INTENT_COMMAND_PREFIX: &str = "/intent/";

/// Entity ages included in the context dump logged on action failure
const ERROR_DUMP_MAX_AGE: u64 = 5;

// ============ Session & Resolution ============

/// The mutable per-conversation state threaded through one resolution.
#[derive(Debug)]
pub struct Session {
    pub conversation: ConversationRef,
    /// Qualified `flow.state` name
    pub state_name: String,
    pub context: Context,
}

impl Session {
    /// A fresh session parked at `default.root`.
    pub fn new(conversation: ConversationRef) -> Self {
        Self {
            conversation,
            state_name: ROOT_STATE.to_string(),
            context: Context::new(),
        }
    }

    /// Rebuild a session from a persisted snapshot. A stored name may carry
    /// a trailing action marker from an interrupted move; it is stripped.
    pub fn restore(conversation: ConversationRef, state_name: &str, context: Context) -> Self {
        let name = state_name.trim_end_matches(':');
        Self {
            conversation,
            state_name: if name.is_empty() {
                ROOT_STATE.to_string()
            } else {
                name.to_string()
            },
            context,
        }
    }
}

/// Everything one resolution produced.
#[derive(Debug, Default)]
pub struct Resolution {
    pub responses: Vec<Response>,
    pub schedule_requests: Vec<ScheduleRequest>,
    /// Set when an action failed; the session must not be persisted
    pub error: Option<ResolveError>,
}

impl Resolution {
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

// ============ Resolver ============

/// Resolves inbound events against a flow graph. Cheap to clone; the graph
/// is shared and a hot reload swaps in a new resolver wholesale.
#[derive(Clone)]
pub struct Resolver {
    graph: Arc<FlowGraph>,
    error_message_text: Option<String>,
    harness_mode: bool,
    context_max_depth: usize,
    history_limit: usize,
    telemetry: TelemetryService,
}

/// Working set for one resolution. The dialog owns the context until the
/// session takes it back.
struct Turn<'a> {
    dialog: Dialog,
    state_name: String,
    event: &'a Event,
}

impl Resolver {
    pub fn new(graph: Arc<FlowGraph>, config: &Config) -> Self {
        Self {
            graph,
            error_message_text: config.error_message_text.clone(),
            harness_mode: config.harness_mode,
            context_max_depth: config.context_max_depth,
            history_limit: config.history_limit,
            telemetry: TelemetryService::default(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryService) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn graph(&self) -> &Arc<FlowGraph> {
        &self.graph
    }

    /// Same resolver over a rebuilt graph, for hot reload.
    pub fn with_graph(&self, graph: Arc<FlowGraph>) -> Self {
        Self {
            graph,
            ..self.clone()
        }
    }

    /// Run one event through the policy chain. The session is updated in
    /// place; on error the caller must discard it instead of persisting.
    pub fn resolve(&self, session: &mut Session, event: &Event) -> Resolution {
        if event.kind == EventKind::Other {
            debug!(
                "ignoring {:?} event for conversation {}",
                event.kind, session.conversation.conversation_id
            );
            return Resolution::default();
        }

        let mut state_name = session.state_name.clone();
        if self.graph.get_state_qualified(&state_name).is_none() {
            warn!(
                "conversation {} points at unknown state {:?}, resetting to {}",
                session.conversation.conversation_id, state_name, ROOT_STATE
            );
            state_name = ROOT_STATE.to_string();
        }
        self.telemetry
            .message_start(&session.conversation, event, &state_name);

        let mut context = std::mem::take(&mut session.context);
        // limits are not serialized; re-apply them on every restore
        context.set_limits(self.context_max_depth, self.history_limit);
        context.set_current_state(&state_name);
        context.add_observation(&event.entities);

        let mut turn = Turn {
            dialog: Dialog::new(session.conversation.clone(), context),
            state_name,
            event,
        };

        let error = match self.process(&mut turn) {
            Ok(()) => None,
            Err(e) => {
                error!(
                    "resolution failed for conversation {} in {}: {}",
                    session.conversation.conversation_id, turn.state_name, e
                );
                debug!(
                    "context at failure: {}",
                    turn.dialog.context().debug_dump(ERROR_DUMP_MAX_AGE)
                );
                self.telemetry
                    .error(&session.conversation, &turn.state_name, &e.to_string());
                if !self.harness_mode {
                    if let Some(text) = &self.error_message_text {
                        turn.dialog.send_text(text);
                    }
                }
                Some(e)
            }
        };

        for response in &turn.dialog.responses {
            self.telemetry
                .bot_response(&session.conversation, response, &turn.state_name);
        }
        self.telemetry
            .message_end(&session.conversation, &turn.state_name);

        session.state_name = turn.state_name;
        session.context = turn.dialog.context;
        Resolution {
            responses: turn.dialog.responses,
            schedule_requests: turn.dialog.schedule_requests,
            error,
        }
    }

    // ============ Policy chain ============

    fn process(&self, turn: &mut Turn) -> Result<(), ResolveError> {
        if let Some(text) = turn.event.text.as_deref() {
            if text == VERSION_COMMAND {
                turn.dialog.send_text(&format!(
                    "Flowbot dialog engine, version {}",
                    env!("CARGO_PKG_VERSION")
                ));
                return Ok(());
            }
            if let Some(intent) = text.strip_prefix(INTENT_COMMAND_PREFIX) {
                debug!("forcing intent {:?}", intent);
                turn.dialog
                    .context_mut()
                    .set_value(INTENT_ENTITY, Value::String(intent.to_string()));
            }
        }

        if self.try_state_transition(turn)? {
            return Ok(());
        }
        if self.try_intent_transition(turn)? {
            return Ok(());
        }
        if self.try_entity_transition(turn)? {
            return Ok(());
        }

        let keys = support_keys(&turn.event.entities, None);
        let supported = self
            .state_node(&turn.state_name)
            .map(|s| s.is_supported(&keys))
            .unwrap_or(false);
        if supported {
            debug!("message accepted in place at {}", turn.state_name);
            self.run_accept(turn)
        } else {
            self.run_unsupported(turn)
        }
    }

    /// Honor an explicit `_state` entity received on this very message.
    fn try_state_transition(&self, turn: &mut Turn) -> Result<bool, ResolveError> {
        let requested = match turn.dialog.context().query(STATE_ENTITY).first_value(true) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Ok(false),
        };
        debug!("explicit state transition to {:?}", requested);
        self.move_to(turn, &requested)
    }

    /// Move by recognized intent unless the current state handles it in
    /// place. States of the current flow are searched first, then flow-level
    /// intent patterns across the graph.
    fn try_intent_transition(&self, turn: &mut Turn) -> Result<bool, ResolveError> {
        let intent = match turn.dialog.context().query(INTENT_ENTITY).first_value(true) {
            Some(Value::String(s)) => s.clone(),
            _ => return Ok(false),
        };

        let mut keys =
            support_keys(&turn.event.entities, Some(&[INTENT_ENTITY, MESSAGE_TEXT_ENTITY]));
        keys.insert(SupportKey::Name(INTENT_ENTITY.to_string()));
        keys.insert(SupportKey::Value(INTENT_ENTITY.to_string(), intent.clone()));
        if let Some(state) = self.state_node(&turn.state_name) {
            if state.is_supported(&keys) {
                debug!("intent {:?} handled in place at {}", intent, turn.state_name);
                return Ok(false);
            }
        }

        let current_flow = flow_of(&turn.state_name).to_string();
        if let Some(flow) = self.graph.get_flow(&current_flow) {
            if let Some(destination) = flow.state_for_intent(&intent) {
                debug!("intent {:?} matches state {}", intent, destination);
                return self.move_to(turn, &format!("{}:", destination));
            }
        }
        for flow in self.graph.flows() {
            if flow.matches_intent(&intent) {
                debug!("intent {:?} matches flow {}", intent, flow.name);
                return self.move_to(turn, &format!("{}.root:", flow.name));
            }
        }

        warn!("no flow matches intent {:?}", intent);
        Ok(false)
    }

    /// Move into a flow that accepts one of the received entities, unless
    /// the current state already supports the message.
    fn try_entity_transition(&self, turn: &mut Turn) -> Result<bool, ResolveError> {
        if turn.event.entities.is_empty() {
            return Ok(false);
        }
        let keys = support_keys(&turn.event.entities, None);
        if let Some(state) = self.state_node(&turn.state_name) {
            if state.is_supported(&keys) {
                return Ok(false);
            }
        }
        for flow in self.graph.flows() {
            if flow.accepts_any(turn.event.entities.keys()) {
                debug!("flow {} accepts an entity of this message", flow.name);
                return self.move_to(turn, &format!("{}.root:", flow.name));
            }
        }
        Ok(false)
    }

    /// No rule claimed the message. Record the fact and fall back: state
    /// handler, temporary escape, flow handler, then `default.root`.
    fn run_unsupported(&self, turn: &mut Turn) -> Result<(), ResolveError> {
        debug!("message unsupported at {}", turn.state_name);
        turn.dialog
            .context_mut()
            .set_value(UNSUPPORTED_ENTITY, Value::Bool(true));

        let flow_name = flow_of(&turn.state_name).to_string();
        let (state_handler, is_temporary) = match self.state_node(&turn.state_name) {
            Some(state) => (state.unsupported.clone(), state.is_temporary),
            None => (None, false),
        };

        if let Some(action) = state_handler {
            return self.run_action(turn, &action);
        }
        if is_temporary {
            self.move_to(turn, &format!("{}:", ROOT_STATE))?;
            return Ok(());
        }
        let flow_handler = self
            .graph
            .get_flow(&flow_name)
            .and_then(|f| f.unsupported.clone());
        if let Some(action) = flow_handler {
            return self.run_action(turn, &action);
        }
        if flow_name == DEFAULT_FLOW {
            self.move_to(turn, &format!("{}:", ROOT_STATE))?;
            return Ok(());
        }
        Err(ResolveError::MissingUnsupportedHandler { flow: flow_name })
    }

    // ============ Movement & actions ============

    /// Move to a destination. Grammar: a trailing `:` runs the target's
    /// accept logic, a bare state name defaults to the current flow, and a
    /// number N revisits the state N messages back. Unknown destinations are
    /// logged and ignored.
    fn move_to(&self, turn: &mut Turn, destination: &str) -> Result<bool, ResolveError> {
        let (name, run_accept) = match destination.strip_suffix(':') {
            Some(stripped) => (stripped, true),
            None => (destination, false),
        };

        if let Ok(steps_back) = name.parse::<usize>() {
            let target = match turn.dialog.context().history_state(steps_back) {
                Some(visit) => visit.name.clone(),
                None => {
                    warn!("no state {} messages back in history", steps_back);
                    return Ok(false);
                }
            };
            let destination = if run_accept {
                format!("{}:", target)
            } else {
                target
            };
            return self.move_to(turn, &destination);
        }

        let qualified = if name.contains('.') {
            name.to_string()
        } else {
            format!("{}.{}", flow_of(&turn.state_name), name)
        };
        if self.graph.get_state_qualified(&qualified).is_none() {
            warn!("ignoring move to unknown state {:?}", qualified);
            return Ok(false);
        }

        if qualified != turn.state_name {
            debug!("moving {} -> {}", turn.state_name, qualified);
            let departed = turn.state_name.clone();
            turn.dialog.context_mut().add_state_visit(&departed);
            turn.state_name = qualified.clone();
            turn.dialog.context_mut().set_current_state(&qualified);
            self.telemetry
                .state_change(turn.dialog.conversation(), &qualified);
        }

        if run_accept {
            self.run_accept(turn)?;
        }
        Ok(true)
    }

    /// Run the current state's accept logic: the first unmet requirement's
    /// action, or the state's own action. `default.root` never gates on
    /// requirements.
    fn run_accept(&self, turn: &mut Turn) -> Result<(), ResolveError> {
        let state = match self.state_node(&turn.state_name) {
            Some(state) => state,
            None => return Ok(()),
        };

        if turn.state_name != ROOT_STATE {
            if let Some(requirement) = state.first_unmet_requirement(turn.dialog.context()) {
                debug!("unmet {:?} in {}", requirement, turn.state_name);
                let action = requirement.action().clone();
                return self.run_action(turn, &action);
            }
        }

        match state.action.clone() {
            Some(action) => self.run_action(turn, &action),
            None => {
                debug!("state {} has no action", turn.state_name);
                Ok(())
            }
        }
    }

    fn run_action(&self, turn: &mut Turn, action: &Action) -> Result<(), ResolveError> {
        debug!("running action {} in {}", action.name(), turn.state_name);
        let outcome =
            action
                .run(&mut turn.dialog)
                .map_err(|source| ResolveError::ActionFailed {
                    action: action.name().to_string(),
                    state: turn.state_name.clone(),
                    source,
                })?;
        match outcome {
            ActionOutcome::Stay => Ok(()),
            ActionOutcome::Move(destination) => {
                self.move_to(turn, &destination)?;
                Ok(())
            }
            ActionOutcome::Back(steps) => {
                self.move_to(turn, &format!("{}:", steps))?;
                Ok(())
            }
        }
    }

    fn state_node<'g>(&'g self, qualified: &str) -> Option<&'g State> {
        let state = self.graph.get_state_qualified(qualified);
        if state.is_none() {
            warn!("unknown state {:?}", qualified);
        }
        state
    }
}

/// Flow part of a qualified `flow.state` name.
fn flow_of(state_name: &str) -> &str {
    state_name.split('.').next().unwrap_or(DEFAULT_FLOW)
}

/// Support keys carried by a message: every entity name plus every
/// (entity, value) pair with a string value. `only` restricts to a subset
/// of entity names.
fn support_keys(
    entities: &HashMap<String, Vec<EntityObservation>>,
    only: Option<&[&str]>,
) -> HashSet<SupportKey> {
    let mut keys = HashSet::new();
    for (name, observations) in entities {
        if let Some(allowed) = only {
            if !allowed.contains(&name.as_str()) {
                continue;
            }
        }
        keys.insert(SupportKey::Name(name.clone()));
        for observation in observations {
            if let Some(Value::String(value)) = &observation.value {
                keys.insert(SupportKey::Value(name.clone(), value.clone()));
            }
        }
    }
    keys
}
