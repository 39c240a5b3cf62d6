//! Flowbot Dialog Engine
//!
//! A conversational-bot engine built around a declarative flow/state graph.
//!
//! # Features
//!
//! - **Flow Graph**: flows and states defined in TOML, validated eagerly,
//!   shared read-only and hot-swappable
//! - **Entity Context**: per-conversation rolling entity store with logical
//!   message-counter aging and windowed queries
//! - **Transition Resolver**: one policy chain with strict precedence
//!   (explicit state, intent, entity, supported in place, unsupported)
//! - **Scheduler**: one-shot and recurring schedules over arbitrary
//!   conversation sets, fired by an idempotent heartbeat
//! - **Chat Manager**: per-conversation serialization, snapshot persistence,
//!   channel delivery
//!
//! # Architecture
//!
//! ```text
//! channel payload ──► Event ──► ChatManager ──► Resolver ──► FlowGraph
//!                                  │   (lock)      │
//!                                  │               ├── Context (entities)
//!                                  │               └── Actions (Dialog)
//!                                  ├── SnapshotStore (SQLite)
//!                                  ├── Scheduler (heartbeat + claims)
//!                                  └── ChannelRegistry (responses)
//! ```

pub mod action;
pub mod channel;
pub mod config;
pub mod context;
pub mod dedup;
pub mod dialog;
pub mod entity;
pub mod error;
pub mod event;
pub mod extract;
pub mod flow;
pub mod manager;
pub mod query;
pub mod resolver;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;

pub use action::{Action, ActionOutcome, ActionRegistry};
pub use channel::{
    ChannelAdapter, ChannelError, ChannelRegistry, ConversationRef, MemoryChannel, Response,
};
pub use config::Config;
pub use context::Context;
pub use dedup::DedupStore;
pub use dialog::{Dialog, SchedulePayload, ScheduleRequest};
pub use entity::{EntityObservation, EntityValue};
pub use error::{FlowError, QueryError, ResolveError, ScheduleError};
pub use event::{Event, EventKind};
pub use extract::{EntityExtractor, ExtractorPipeline, KeywordExtractor, RegexExtractor};
pub use flow::{Flow, FlowGraph, State};
pub use manager::ChatManager;
pub use query::{EntityQuery, Window};
pub use resolver::{Resolution, Resolver, Session};
pub use scheduler::{
    ConversationSelector, Dispatcher, ScheduleAction, ScheduleStore, ScheduledAction, Scheduler,
    TimeSpec,
};
pub use snapshot::{MemorySnapshotStore, Snapshot, SnapshotStore, SqliteSnapshotStore};
pub use telemetry::{DialogLogger, TelemetryService, TracingLogger};
