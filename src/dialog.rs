//! Dialog Handle
//!
//! The object handed to actions. It owns the conversation's context for the
//! duration of one resolution and buffers every side effect - outbound
//! responses and schedule requests - so the resolver stays synchronous and
//! the manager can flush buffers after the snapshot is persisted.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::info;

use crate::channel::{ConversationRef, Response};
use crate::context::Context;
use crate::entity::EntityObservation;

/// Structured payload of a scheduled synthetic event.
pub type SchedulePayload = HashMap<String, Vec<EntityObservation>>;

/// A schedule created by an action, applied by the manager after the
/// resolution completes.
#[derive(Debug, Clone)]
pub enum ScheduleRequest {
    /// Deliver the payload back into this conversation at an absolute time.
    At {
        payload: SchedulePayload,
        at: DateTime<Utc>,
    },
    /// Deliver the payload only if the user stays inactive; the captured
    /// counter is compared on delivery and the callback is dropped if the
    /// conversation has advanced.
    Inactivity {
        payload: SchedulePayload,
        seconds: i64,
        counter: u64,
    },
}

/// Per-resolution handle passed to actions.
pub struct Dialog {
    conversation: ConversationRef,
    pub(crate) context: Context,
    pub(crate) responses: Vec<Response>,
    pub(crate) schedule_requests: Vec<ScheduleRequest>,
}

impl Dialog {
    pub fn new(conversation: ConversationRef, context: Context) -> Self {
        Self {
            conversation,
            context,
            responses: Vec::new(),
            schedule_requests: Vec::new(),
        }
    }

    pub fn conversation(&self) -> &ConversationRef {
        &self.conversation
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Queue one message for the user.
    pub fn send(&mut self, response: Response) {
        self.responses.push(response);
    }

    /// Queue a plain text message for the user.
    pub fn send_text(&mut self, text: &str) {
        self.responses.push(Response::text(text));
    }

    /// Schedule a payload for this conversation at an absolute time.
    /// The timestamp type is timezone-aware by construction.
    pub fn schedule_at(&mut self, payload: SchedulePayload, at: DateTime<Utc>) {
        info!("Scheduling payload at {}", at);
        self.schedule_requests.push(ScheduleRequest::At { payload, at });
    }

    /// Schedule a payload `seconds` from now.
    pub fn schedule_in(&mut self, payload: SchedulePayload, seconds: i64) -> Result<()> {
        if seconds <= 0 {
            bail!("Specify a positive 'seconds' parameter");
        }
        let at = Utc::now() + Duration::seconds(seconds);
        self.schedule_at(payload, at);
        Ok(())
    }

    /// Schedule a callback to run only if the user does nothing first.
    /// Captures the current counter; delivery is a no-op if it has advanced.
    pub fn inactive(&mut self, payload: SchedulePayload, seconds: i64) -> Result<()> {
        if seconds <= 0 {
            bail!("Specify a positive 'seconds' parameter");
        }
        info!("Setting inactivity callback after {} seconds", seconds);
        self.schedule_requests.push(ScheduleRequest::Inactivity {
            payload,
            seconds,
            counter: self.context.counter(),
        });
        Ok(())
    }
}
