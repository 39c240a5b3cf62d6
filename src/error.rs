//! Error Taxonomy
//!
//! Four error classes with different blast radii:
//! - `FlowError`: configuration problems, fatal at graph build time
//! - `QueryError`: misuse of the entity query API, returned to the caller
//! - `ResolveError`: raised during one resolution; the conversation snapshot
//!   is not persisted and the conversation resumes from its last checkpoint
//! - `ScheduleError`: rejected synchronously when a schedule is created
//!
//! Expected "no match" outcomes (unknown destination state, intent with no
//! matching flow) are warnings, not errors - resolution falls through to the
//! next policy.

use thiserror::Error;

/// Errors raised while building a [`FlowGraph`](crate::flow::FlowGraph).
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Duplicate flow: {0}")]
    DuplicateFlow(String),

    #[error("Required state default.root was not found. Add this state; it is used as the first state when starting a conversation")]
    MissingRootState,

    #[error("Unknown action '{action}' referenced by {location}")]
    UnknownAction { action: String, location: String },

    #[error("Invalid intent pattern '{pattern}' in {location}: {source}")]
    InvalidIntentPattern {
        pattern: String,
        location: String,
        source: regex::Error,
    },

    #[error("Requirement in state {state} must use either an entity or a condition, not both")]
    AmbiguousRequirement { state: String },

    #[error("Requirement in state {state} has no action")]
    RequirementWithoutAction { state: String },

    #[error("Unable to read flow definition {path}: {reason}")]
    BadDefinition { path: String, reason: String },
}

/// Errors raised by [`EntityQuery`](crate::query::EntityQuery) filters.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Use either message count, wall-clock delta or absolute time, not several")]
    AmbiguousFilter,

    #[error("Age filter has no criterion set")]
    EmptyFilter,

    #[error("Refusing set operation, other query belongs to a different context")]
    ContextMismatch,
}

/// Errors raised while resolving one inbound event.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Neither the state nor its (non-default) flow declares an `unsupported`
    /// handler. A configuration error, surfaced at resolution time.
    #[error("Missing required 'unsupported' action in flow {flow}")]
    MissingUnsupportedHandler { flow: String },

    /// An action failed. The conversation snapshot is rolled back.
    #[error("Action '{action}' failed in state {state}: {source}")]
    ActionFailed {
        action: String,
        state: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised when creating or firing schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid schedule specification: {0}")]
    InvalidTimeSpec(String),

    #[error("Timestamp must be timezone-aware (RFC 3339 with offset): {0}")]
    NaiveTimestamp(String),

    #[error("Invalid schedule id: {0}")]
    InvalidScheduleId(String),

    #[error("Invalid conversation selector: {0}")]
    InvalidSelector(String),

    #[error("Schedule store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Schedule encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
