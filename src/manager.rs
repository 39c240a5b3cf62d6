//! Chat Manager
//!
//! The locked entry point every event goes through, live or scheduled. The
//! manager serializes all work per conversation: it takes that
//! conversation's lock, loads the last snapshot, runs the resolver, persists
//! the new snapshot, applies buffered schedule requests, and flushes the
//! responses to the channel adapter. Events for different conversations run
//! fully in parallel.
//!
//! A failed resolution persists nothing; the conversation replays from its
//! last good snapshot on the next event.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::channel::{ChannelRegistry, ConversationRef, Response};
use crate::dialog::{SchedulePayload, ScheduleRequest};
use crate::event::Event;
use crate::extract::ExtractorPipeline;
use crate::flow::FlowGraph;
use crate::resolver::{Resolution, Resolver, Session};
use crate::scheduler::{ConversationSelector, Dispatcher, ScheduleAction, Scheduler};
use crate::snapshot::{Snapshot, SnapshotStore};

pub struct ChatManager {
    resolver: RwLock<Resolver>,
    snapshots: Arc<dyn SnapshotStore>,
    channels: ChannelRegistry,
    scheduler: Arc<Scheduler>,
    pipeline: ExtractorPipeline,
    /// Per-conversation serialization locks
    locks: RwLock<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatManager {
    pub fn new(
        resolver: Resolver,
        snapshots: Arc<dyn SnapshotStore>,
        channels: ChannelRegistry,
        scheduler: Arc<Scheduler>,
        pipeline: ExtractorPipeline,
    ) -> Self {
        Self {
            resolver: RwLock::new(resolver),
            snapshots,
            channels,
            scheduler,
            pipeline,
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Accept a live user event.
    pub async fn accept(
        &self,
        conversation: ConversationRef,
        mut event: Event,
    ) -> anyhow::Result<Resolution> {
        self.pipeline.enrich(&mut event);
        self.accept_internal(conversation, event, None).await
    }

    /// Accept a synthetic scheduler event. With `only_if_counter` set this
    /// is an inactivity callback: it is dropped when the conversation's
    /// logical counter has advanced past the captured value.
    pub async fn accept_scheduled(
        &self,
        conversation_id: i64,
        payload: SchedulePayload,
        only_if_counter: Option<u64>,
    ) -> anyhow::Result<Resolution> {
        let channel = self
            .snapshots
            .load(conversation_id)?
            .map(|s| s.channel)
            .unwrap_or_default();
        let conversation = ConversationRef {
            conversation_id,
            channel,
        };
        self.accept_internal(conversation, Event::schedule(payload), only_if_counter)
            .await
    }

    /// Swap in a rebuilt flow graph. In-flight resolutions finish on the old
    /// graph; everything after sees the new one.
    pub async fn swap_graph(&self, graph: Arc<FlowGraph>) {
        let mut resolver = self.resolver.write().await;
        *resolver = resolver.with_graph(graph);
        info!("Flow graph swapped");
    }

    /// Start the scheduler heartbeat, dispatching back through this manager.
    pub fn start_heartbeat(
        self: &Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let dispatcher: Arc<dyn Dispatcher> = Arc::clone(self) as Arc<dyn Dispatcher>;
        self.scheduler.spawn_heartbeat(dispatcher, interval)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    async fn accept_internal(
        &self,
        conversation: ConversationRef,
        event: Event,
        only_if_counter: Option<u64>,
    ) -> anyhow::Result<Resolution> {
        let lock = self.conversation_lock(conversation.conversation_id).await;
        let _guard = lock.lock().await;

        let mut session = match self.snapshots.load(conversation.conversation_id)? {
            Some(snapshot) => Session::restore(
                conversation.clone(),
                &snapshot.state_name,
                crate::context::Context::from_blob(&snapshot.context_blob),
            ),
            None => Session::new(conversation.clone()),
        };

        if let Some(expected) = only_if_counter {
            if session.context.counter() != expected {
                debug!(
                    "conversation {} advanced past counter {}, dropping inactivity callback",
                    conversation.conversation_id, expected
                );
                return Ok(Resolution::default());
            }
        }

        let resolver = self.resolver.read().await.clone();
        let resolution = resolver.resolve(&mut session, &event);

        if resolution.error.is_none() {
            self.snapshots.save(&Snapshot {
                conversation_id: conversation.conversation_id,
                channel: conversation.channel.clone(),
                state_name: session.state_name.clone(),
                context_blob: session.context.to_blob(),
                updated_at: 0,
            })?;
            self.apply_schedule_requests(&conversation, &resolution);
        }

        self.flush(&conversation, &resolution.responses).await;
        Ok(resolution)
    }

    fn apply_schedule_requests(&self, conversation: &ConversationRef, resolution: &Resolution) {
        for request in &resolution.schedule_requests {
            let selector = ConversationSelector::one(conversation.conversation_id);
            let result = match request {
                ScheduleRequest::At { payload, at } => self.scheduler.add_schedule(
                    ScheduleAction::payload(payload.clone()),
                    selector,
                    *at,
                    None,
                ),
                ScheduleRequest::Inactivity {
                    payload,
                    seconds,
                    counter,
                } => self.scheduler.add_schedule(
                    ScheduleAction::inactivity(payload.clone(), *counter),
                    selector,
                    Utc::now() + ChronoDuration::seconds(*seconds),
                    None,
                ),
            };
            if let Err(e) = result {
                warn!(
                    "cannot apply schedule request for conversation {}: {}",
                    conversation.conversation_id, e
                );
            }
        }
    }

    async fn flush(&self, conversation: &ConversationRef, responses: &[Response]) {
        if responses.is_empty() {
            return;
        }
        match self.channels.get(&conversation.channel) {
            Some(adapter) => {
                if let Err(e) = adapter.send_responses(conversation, responses).await {
                    warn!(
                        "cannot deliver to conversation {} on {}: {}",
                        conversation.conversation_id, conversation.channel, e
                    );
                }
            }
            None => warn!("no channel adapter named {:?}", conversation.channel),
        }
    }

    async fn conversation_lock(&self, conversation_id: i64) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(&conversation_id) {
                return Arc::clone(lock);
            }
        }
        let mut locks = self.locks.write().await;
        Arc::clone(
            locks
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[async_trait]
impl Dispatcher for ChatManager {
    async fn deliver_payload(
        &self,
        conversation_id: i64,
        payload: &SchedulePayload,
        only_if_counter: Option<u64>,
    ) -> anyhow::Result<()> {
        self.accept_scheduled(conversation_id, payload.clone(), only_if_counter)
            .await
            .map(|_| ())
    }

    async fn broadcast(
        &self,
        conversation: &ConversationRef,
        response: &Response,
    ) -> anyhow::Result<()> {
        let adapter = self
            .channels
            .get(&conversation.channel)
            .ok_or_else(|| anyhow::anyhow!("no channel adapter named {:?}", conversation.channel))?;
        adapter
            .send_responses(conversation, std::slice::from_ref(response))
            .await?;
        Ok(())
    }
}
