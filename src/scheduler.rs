//! Scheduler
//!
//! Turns time-based triggers into synthetic inbound events. Schedules live
//! in a SQLite table and a periodic heartbeat fires the due ones:
//! - one-shot schedules are claimed with a conditional update, so two
//!   concurrent heartbeats can never double-fire the same row
//! - recurring schedules are advanced to their next matching instant and
//!   persist until `until` passes
//! - schedules overdue beyond a fixed timeout are cleaned up without firing,
//!   so the engine does not replay a storm after downtime
//!
//! The heartbeat never holds a conversation lock itself; dispatch re-enters
//! the engine through the same locked entry point as live user messages.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::channel::{ConversationRef, Response};
use crate::context::Context;
use crate::dedup::DedupStore;
use crate::dialog::SchedulePayload;
use crate::error::ScheduleError;
use crate::snapshot::SnapshotStore;

/// Schedule ids handed to callers are prefixed row ids
pub const SCHEDULE_ID_PREFIX: &str = "flowbot_schedule_";

/// Schedules overdue by more than this are cleaned up without firing
const TASK_TIMEOUT_HOURS: i64 = 1;

// ============ Time specification ============

/// Sparse cron-like recurrence, in UTC. `weekday` is 0 = Monday.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub second: Option<u32>,
    pub minute: Option<u32>,
    pub hour: Option<u32>,
    /// 0 = Monday .. 6 = Sunday; mutually exclusive with `day`
    pub weekday: Option<u32>,
    /// Day of month, 1..=31
    pub day: Option<u32>,
    pub month: Option<u32>,
}

impl TimeSpec {
    /// Check internal consistency: a coarser field cannot be set without
    /// all finer fields present, `day` and `weekday` are mutually
    /// exclusive, and every field must be in range.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.day.is_some() && self.weekday.is_some() {
            return Err(ScheduleError::InvalidTimeSpec(
                "at most one of day, weekday may be set".to_string(),
            ));
        }

        let levels = [
            ("minute", self.minute.is_some()),
            ("hour", self.hour.is_some()),
            ("day", self.day.is_some() || self.weekday.is_some()),
            ("month", self.month.is_some()),
        ];
        let mut was_present = true;
        let mut finer = "second";
        for (name, present) in levels {
            if present && !was_present {
                return Err(ScheduleError::InvalidTimeSpec(format!(
                    "{} requires {} to be present",
                    name, finer
                )));
            }
            was_present = present;
            finer = name;
        }

        let ranges = [
            ("second", self.second, 0u32, 59u32),
            ("minute", self.minute, 0, 59),
            ("hour", self.hour, 0, 23),
            ("weekday", self.weekday, 0, 6),
            ("day", self.day, 1, 31),
            ("month", self.month, 1, 12),
        ];
        for (name, value, lo, hi) in ranges {
            if let Some(v) = value {
                if v < lo || v > hi {
                    return Err(ScheduleError::InvalidTimeSpec(format!(
                        "{} must be in range ({}, {})",
                        name, lo, hi
                    )));
                }
            }
        }

        let any = self.second.is_some()
            || self.minute.is_some()
            || self.hour.is_some()
            || self.weekday.is_some()
            || self.day.is_some()
            || self.month.is_some();
        if !any {
            return Err(ScheduleError::InvalidTimeSpec(
                "at least one time field must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// First instant strictly after `now` matching this spec.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let second = self.second.unwrap_or(0);

        let Some(minute) = self.minute else {
            let mut dt = now.with_second(second)?.with_nanosecond(0)?;
            if dt <= now {
                dt += ChronoDuration::minutes(1);
            }
            return Some(dt);
        };
        let Some(hour) = self.hour else {
            let mut dt = now
                .with_minute(minute)?
                .with_second(second)?
                .with_nanosecond(0)?;
            if dt <= now {
                dt += ChronoDuration::hours(1);
            }
            return Some(dt);
        };

        let today_at = now
            .with_hour(hour)?
            .with_minute(minute)?
            .with_second(second)?
            .with_nanosecond(0)?;

        if self.weekday.is_none() && self.day.is_none() {
            let mut dt = today_at;
            if dt <= now {
                dt += ChronoDuration::days(1);
            }
            return Some(dt);
        }
        if let Some(weekday) = self.weekday {
            let delta = weekday as i64 - now.weekday().num_days_from_monday() as i64;
            let mut dt = today_at + ChronoDuration::days(delta);
            if dt <= now {
                dt += ChronoDuration::days(7);
            }
            return Some(dt);
        }

        let day = self.day?;
        match self.month {
            None => {
                // next month where the day exists
                let mut year = now.year();
                let mut month = now.month();
                for _ in 0..48 {
                    if let Some(dt) = Utc
                        .with_ymd_and_hms(year, month, day, hour, minute, second)
                        .single()
                    {
                        if dt > now {
                            return Some(dt);
                        }
                    }
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                }
                None
            }
            Some(month) => {
                for offset in 0..8 {
                    if let Some(dt) = Utc
                        .with_ymd_and_hms(now.year() + offset, month, day, hour, minute, second)
                        .single()
                    {
                        if dt > now {
                            return Some(dt);
                        }
                    }
                }
                None
            }
        }
    }
}

// ============ Selectors & actions ============

/// Which conversations a schedule applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationSelector {
    /// Explicit conversation ids
    List { ids: Vec<i64> },
    /// Every known conversation
    All,
    /// Conversations whose context holds the entity, optionally with a
    /// specific value and a maximum logical age
    EntityValue {
        entity: String,
        value: Option<serde_json::Value>,
        #[serde(default)]
        max_age: Option<u64>,
    },
}

impl ConversationSelector {
    pub fn one(conversation_id: i64) -> Self {
        Self::List {
            ids: vec![conversation_id],
        }
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::List { ids } if ids.is_empty() => Err(ScheduleError::InvalidSelector(
                "conversation list is empty".to_string(),
            )),
            Self::EntityValue { entity, .. } if entity.is_empty() => Err(
                ScheduleError::InvalidSelector("entity name is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Concrete conversation ids matching this selector.
    pub fn resolve(&self, snapshots: &dyn SnapshotStore) -> anyhow::Result<Vec<i64>> {
        match self {
            Self::List { ids } => Ok(ids.clone()),
            Self::All => Ok(snapshots
                .list_conversations()?
                .into_iter()
                .map(|r| r.conversation_id)
                .collect()),
            Self::EntityValue {
                entity,
                value,
                max_age,
            } => {
                let mut matching = Vec::new();
                for conversation in snapshots.list_conversations()? {
                    let Some(snapshot) = snapshots.load(conversation.conversation_id)? else {
                        continue;
                    };
                    let context = Context::from_blob(&snapshot.context_blob);
                    let Some(newest) = context.get(entity) else {
                        continue;
                    };
                    if let Some(max_age) = max_age {
                        if context.counter().saturating_sub(newest.counter) > *max_age {
                            continue;
                        }
                    }
                    match value {
                        None => matching.push(conversation.conversation_id),
                        Some(expected) if newest.value == *expected => {
                            matching.push(conversation.conversation_id)
                        }
                        Some(_) => {}
                    }
                }
                Ok(matching)
            }
        }
    }
}

/// What a schedule does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleAction {
    /// Structured payload re-entering the resolver as a synthetic event,
    /// resolved separately per conversation
    Payload {
        entities: SchedulePayload,
        /// Inactivity guard: deliver only while the conversation's logical
        /// counter still equals this value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        only_if_counter: Option<u64>,
    },
    /// Pre-rendered message sent as-is to every selected conversation
    Broadcast { response: Response },
}

impl ScheduleAction {
    pub fn payload(entities: SchedulePayload) -> Self {
        Self::Payload {
            entities,
            only_if_counter: None,
        }
    }

    /// A payload that fires only if the conversation has not advanced past
    /// the captured counter.
    pub fn inactivity(entities: SchedulePayload, counter: u64) -> Self {
        Self::Payload {
            entities,
            only_if_counter: Some(counter),
        }
    }

    pub fn broadcast(response: Response) -> Self {
        Self::Broadcast { response }
    }
}

/// One schedule row.
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub id: i64,
    pub at: DateTime<Utc>,
    pub recurrence: Option<TimeSpec>,
    pub until: Option<DateTime<Utc>>,
    pub action: ScheduleAction,
    pub selector: ConversationSelector,
    pub description: Option<String>,
    pub is_done: bool,
}

impl ScheduledAction {
    pub fn task_id(&self) -> String {
        format!("{}{}", SCHEDULE_ID_PREFIX, self.id)
    }
}

// ============ Store ============

/// Schedule store with SQLite backend
pub struct ScheduleStore {
    conn: Mutex<Connection>,
}

impl ScheduleStore {
    /// Open or create the schedule database
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Schedule store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database, for tests and the console demo
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("schedule store poisoned");
        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at INTEGER NOT NULL,
                recurrence TEXT,
                until INTEGER,
                action TEXT NOT NULL,
                selector TEXT NOT NULL,
                description TEXT,
                is_done INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_schedules_at
                ON schedules(at, is_done);
            "#,
        )?;

        Ok(())
    }

    fn insert(
        &self,
        at: DateTime<Utc>,
        recurrence: Option<&TimeSpec>,
        until: Option<DateTime<Utc>>,
        action: &ScheduleAction,
        selector: &ConversationSelector,
        description: Option<&str>,
    ) -> Result<i64, ScheduleError> {
        let recurrence = recurrence.map(serde_json::to_string).transpose()?;
        let action = serde_json::to_string(action)?;
        let selector = serde_json::to_string(selector)?;

        let conn = self.conn.lock().expect("schedule store poisoned");
        conn.execute(
            "INSERT INTO schedules (at, recurrence, until, action, selector, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                at.timestamp_millis(),
                recurrence,
                until.map(|u| u.timestamp_millis()),
                action,
                selector,
                description
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn delete(&self, id: i64) -> Result<bool, ScheduleError> {
        let conn = self.conn.lock().expect("schedule store poisoned");
        let changed = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    }

    fn get(&self, id: i64) -> Result<Option<ScheduledAction>, ScheduleError> {
        let conn = self.conn.lock().expect("schedule store poisoned");
        let schedule = conn
            .query_row(
                "SELECT id, at, recurrence, until, action, selector, description, is_done
                 FROM schedules WHERE id = ?1",
                params![id],
                row_to_schedule,
            )
            .optional()?;
        Ok(schedule)
    }

    fn list(&self) -> Result<Vec<ScheduledAction>, ScheduleError> {
        let conn = self.conn.lock().expect("schedule store poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, at, recurrence, until, action, selector, description, is_done
             FROM schedules ORDER BY at",
        )?;
        let schedules = stmt
            .query_map([], row_to_schedule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(schedules)
    }

    /// Delete schedules whose `until` has passed. Returns how many.
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, ScheduleError> {
        let conn = self.conn.lock().expect("schedule store poisoned");
        let deleted = conn.execute(
            "DELETE FROM schedules WHERE until IS NOT NULL AND until < ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    /// Every due, unfired schedule.
    fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledAction>, ScheduleError> {
        let conn = self.conn.lock().expect("schedule store poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, at, recurrence, until, action, selector, description, is_done
             FROM schedules WHERE at <= ?1 AND is_done = 0 ORDER BY at",
        )?;
        let schedules = stmt
            .query_map(params![now.timestamp_millis()], row_to_schedule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(schedules)
    }

    /// Claim a one-shot row. The conditional update makes the claim
    /// exclusive: exactly one caller sees true.
    fn claim_one_shot(&self, id: i64) -> Result<bool, ScheduleError> {
        let conn = self.conn.lock().expect("schedule store poisoned");
        let changed = conn.execute(
            "UPDATE schedules SET is_done = 1 WHERE id = ?1 AND is_done = 0",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Advance a recurring row from `from_at` to `next_at`. Claims the
    /// firing the same way: only the caller that observed `from_at` wins.
    fn advance_recurring(
        &self,
        id: i64,
        from_at: DateTime<Utc>,
        next_at: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let conn = self.conn.lock().expect("schedule store poisoned");
        let changed = conn.execute(
            "UPDATE schedules SET at = ?1 WHERE id = ?2 AND at = ?3 AND is_done = 0",
            params![
                next_at.timestamp_millis(),
                id,
                from_at.timestamp_millis()
            ],
        )?;
        Ok(changed == 1)
    }
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledAction> {
    let at_millis: i64 = row.get(1)?;
    let until_millis: Option<i64> = row.get(3)?;
    let recurrence: Option<String> = row.get(2)?;
    let action: String = row.get(4)?;
    let selector: String = row.get(5)?;

    Ok(ScheduledAction {
        id: row.get(0)?,
        at: millis_to_datetime(1, at_millis)?,
        recurrence: recurrence
            .map(|r| serde_json::from_str(&r).map_err(|e| bad_column(2, e)))
            .transpose()?,
        until: until_millis.map(|u| millis_to_datetime(3, u)).transpose()?,
        action: serde_json::from_str(&action).map_err(|e| bad_column(4, e))?,
        selector: serde_json::from_str(&selector).map_err(|e| bad_column(5, e))?,
        description: row.get(6)?,
        is_done: row.get(7)?,
    })
}

fn millis_to_datetime(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}

fn bad_column(column: usize, e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

// ============ Scheduler ============

/// Delivery seam between the heartbeat and the conversation manager.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Re-enter the resolver with a synthetic schedule event. With
    /// `only_if_counter` set the delivery is dropped when the conversation
    /// has advanced past that counter.
    async fn deliver_payload(
        &self,
        conversation_id: i64,
        payload: &SchedulePayload,
        only_if_counter: Option<u64>,
    ) -> anyhow::Result<()>;

    /// Send a pre-rendered message straight to the conversation's channel.
    async fn broadcast(
        &self,
        conversation: &ConversationRef,
        response: &Response,
    ) -> anyhow::Result<()>;
}

pub struct Scheduler {
    store: Arc<ScheduleStore>,
    snapshots: Arc<dyn SnapshotStore>,
    dedup: DedupStore,
}

impl Scheduler {
    pub fn new(store: Arc<ScheduleStore>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            snapshots,
            dedup: DedupStore::new(),
        }
    }

    /// Schedule a one-shot action. Returns the schedule id.
    pub fn add_schedule(
        &self,
        action: ScheduleAction,
        selector: ConversationSelector,
        at: DateTime<Utc>,
        description: Option<&str>,
    ) -> Result<String, ScheduleError> {
        selector.validate()?;
        let id = self
            .store
            .insert(at, None, None, &action, &selector, description)?;
        debug!("Scheduled {}{} at {}", SCHEDULE_ID_PREFIX, id, at);
        Ok(format!("{}{}", SCHEDULE_ID_PREFIX, id))
    }

    /// Schedule a one-shot action from an RFC 3339 timestamp string. A
    /// timestamp without an explicit offset is rejected, never guessed at.
    pub fn add_schedule_rfc3339(
        &self,
        action: ScheduleAction,
        selector: ConversationSelector,
        at: &str,
        description: Option<&str>,
    ) -> Result<String, ScheduleError> {
        let at = DateTime::parse_from_rfc3339(at)
            .map_err(|_| ScheduleError::NaiveTimestamp(at.to_string()))?
            .with_timezone(&Utc);
        self.add_schedule(action, selector, at, description)
    }

    /// Schedule a recurring action. The spec is validated before the row is
    /// created and the first firing instant is computed eagerly.
    pub fn add_recurrent_schedule(
        &self,
        action: ScheduleAction,
        selector: ConversationSelector,
        spec: TimeSpec,
        until: Option<DateTime<Utc>>,
        description: Option<&str>,
    ) -> Result<String, ScheduleError> {
        selector.validate()?;
        spec.validate()?;
        let at = spec.next_occurrence(Utc::now()).ok_or_else(|| {
            ScheduleError::InvalidTimeSpec("no matching future instant".to_string())
        })?;
        let id = self
            .store
            .insert(at, Some(&spec), until, &action, &selector, description)?;
        debug!("Scheduled recurring {}{}, first at {}", SCHEDULE_ID_PREFIX, id, at);
        Ok(format!("{}{}", SCHEDULE_ID_PREFIX, id))
    }

    pub fn remove_schedule(&self, schedule_id: &str) -> Result<(), ScheduleError> {
        let id = schedule_id
            .strip_prefix(SCHEDULE_ID_PREFIX)
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or_else(|| ScheduleError::InvalidScheduleId(schedule_id.to_string()))?;
        if !self.store.delete(id)? {
            return Err(ScheduleError::InvalidScheduleId(schedule_id.to_string()));
        }
        Ok(())
    }

    pub fn list_schedules(&self) -> Result<Vec<ScheduledAction>, ScheduleError> {
        self.store.list()
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduledAction>, ScheduleError> {
        let id = schedule_id
            .strip_prefix(SCHEDULE_ID_PREFIX)
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or_else(|| ScheduleError::InvalidScheduleId(schedule_id.to_string()))?;
        self.store.get(id)
    }

    /// One polling cycle: expire, claim, dispatch.
    pub async fn heartbeat(&self, dispatcher: &dyn Dispatcher) -> Result<(), ScheduleError> {
        let now = Utc::now();

        let expired = self.store.delete_expired(now)?;
        if expired > 0 {
            debug!("Deleted {} expired schedules", expired);
        }

        for schedule in self.store.due(now)? {
            let fresh = schedule.at >= now - ChronoDuration::hours(TASK_TIMEOUT_HOURS);

            // claim the row before any dispatch so a concurrent heartbeat
            // can never fire the same instant twice
            let claimed = match &schedule.recurrence {
                Some(spec) => match spec.next_occurrence(now) {
                    Some(next) => self.store.advance_recurring(schedule.id, schedule.at, next)?,
                    None => {
                        warn!("recurring {} has no next instant, retiring it", schedule.task_id());
                        self.store.claim_one_shot(schedule.id)?
                    }
                },
                None => {
                    let claimed = self.store.claim_one_shot(schedule.id)?;
                    // anonymous one-shots leave no audit trail
                    if claimed && schedule.description.is_none() {
                        self.store.delete(schedule.id)?;
                    }
                    claimed
                }
            };
            if !claimed {
                continue;
            }
            if !fresh {
                warn!(
                    "skipping stale schedule {} due at {}",
                    schedule.task_id(),
                    schedule.at
                );
                continue;
            }

            let dispatch_id = format!("{}@{}", schedule.task_id(), schedule.at.timestamp_millis());
            if !self.dedup.claim(&dispatch_id) {
                continue;
            }
            self.dispatch(&schedule, dispatcher).await;
        }
        Ok(())
    }

    async fn dispatch(&self, schedule: &ScheduledAction, dispatcher: &dyn Dispatcher) {
        let ids = match schedule.selector.resolve(self.snapshots.as_ref()) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("cannot resolve selector of {}: {:#}", schedule.task_id(), e);
                return;
            }
        };
        debug!(
            "Dispatching {} to {} conversations",
            schedule.task_id(),
            ids.len()
        );

        match &schedule.action {
            ScheduleAction::Payload {
                entities,
                only_if_counter,
            } => {
                for conversation_id in ids {
                    if let Err(e) = dispatcher
                        .deliver_payload(conversation_id, entities, *only_if_counter)
                        .await
                    {
                        warn!(
                            "scheduled payload for conversation {} failed: {:#}",
                            conversation_id, e
                        );
                    }
                }
            }
            ScheduleAction::Broadcast { response } => {
                for conversation_id in ids {
                    let conversation = match self.snapshots.load(conversation_id) {
                        Ok(Some(snapshot)) => ConversationRef {
                            conversation_id,
                            channel: snapshot.channel,
                        },
                        _ => {
                            warn!("no snapshot for conversation {}, skipping", conversation_id);
                            continue;
                        }
                    };
                    if let Err(e) = dispatcher.broadcast(&conversation, response).await {
                        warn!(
                            "scheduled broadcast to conversation {} failed: {:#}",
                            conversation_id, e
                        );
                    }
                }
            }
        }
    }

    /// Spawn the periodic heartbeat loop.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        dispatcher: Arc<dyn Dispatcher>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Scheduler heartbeat running every {:?}", interval);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.heartbeat(dispatcher.as_ref()).await {
                    warn!("heartbeat failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityObservation;
    use crate::snapshot::{MemorySnapshotStore, Snapshot};
    use std::collections::HashMap;

    fn minute_spec(minute: u32) -> TimeSpec {
        TimeSpec {
            minute: Some(minute),
            ..TimeSpec::default()
        }
    }

    fn payload_action() -> ScheduleAction {
        let mut entities = HashMap::new();
        entities.insert(
            "_state".to_string(),
            vec![EntityObservation::text("default.root:")],
        );
        ScheduleAction::payload(entities)
    }

    fn scheduler() -> Scheduler {
        let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        snapshots
            .save(&Snapshot {
                conversation_id: 1,
                channel: "test".to_string(),
                state_name: "default.root".to_string(),
                context_blob: Context::new().to_blob(),
                updated_at: 0,
            })
            .unwrap();
        Scheduler::new(store, snapshots)
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        payloads: Mutex<Vec<i64>>,
        broadcasts: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn deliver_payload(
            &self,
            conversation_id: i64,
            _payload: &SchedulePayload,
            _only_if_counter: Option<u64>,
        ) -> anyhow::Result<()> {
            self.payloads.lock().unwrap().push(conversation_id);
            Ok(())
        }

        async fn broadcast(
            &self,
            conversation: &ConversationRef,
            _response: &Response,
        ) -> anyhow::Result<()> {
            self.broadcasts
                .lock()
                .unwrap()
                .push(conversation.conversation_id);
            Ok(())
        }
    }

    #[test]
    fn test_timespec_coarser_requires_finer() {
        assert!(minute_spec(30).validate().is_ok());

        let spec = TimeSpec {
            hour: Some(9),
            ..TimeSpec::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(ScheduleError::InvalidTimeSpec(_))
        ));

        let spec = TimeSpec {
            hour: Some(9),
            minute: Some(0),
            ..TimeSpec::default()
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_timespec_day_weekday_exclusive_and_ranges() {
        let spec = TimeSpec {
            minute: Some(0),
            hour: Some(9),
            day: Some(1),
            weekday: Some(0),
            ..TimeSpec::default()
        };
        assert!(spec.validate().is_err());

        let spec = TimeSpec {
            minute: Some(75),
            ..TimeSpec::default()
        };
        assert!(spec.validate().is_err());

        assert!(TimeSpec::default().validate().is_err());
    }

    #[test]
    fn test_next_occurrence_minute_and_hour() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 10, 30, 0).unwrap();

        assert_eq!(
            minute_spec(45).next_occurrence(now).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 30, 10, 45, 0).unwrap()
        );
        // an already-passed minute rolls into the next hour
        assert_eq!(
            minute_spec(15).next_occurrence(now).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 30, 11, 15, 0).unwrap()
        );

        let daily = TimeSpec {
            hour: Some(9),
            minute: Some(0),
            ..TimeSpec::default()
        };
        assert_eq!(
            daily.next_occurrence(now).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 31, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_occurrence_weekday() {
        // 2026-08-30 is a Sunday; Monday is weekday 0
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();
        let spec = TimeSpec {
            weekday: Some(0),
            hour: Some(9),
            minute: Some(0),
            ..TimeSpec::default()
        };
        assert_eq!(
            spec.next_occurrence(now).unwrap(),
            Utc.with_ymd_and_hms(2026, 8, 31, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_occurrence_skips_missing_day_of_month() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let spec = TimeSpec {
            day: Some(31),
            hour: Some(12),
            minute: Some(0),
            ..TimeSpec::default()
        };
        // February has no 31st, the next match is March 31
        assert_eq!(
            spec.next_occurrence(now).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_one_shot_fires_exactly_once() {
        let scheduler = scheduler();
        let dispatcher = RecordingDispatcher::default();

        let id = scheduler
            .add_schedule(
                payload_action(),
                ConversationSelector::one(1),
                Utc::now() - ChronoDuration::seconds(1),
                Some("reminder"),
            )
            .unwrap();

        scheduler.heartbeat(&dispatcher).await.unwrap();
        scheduler.heartbeat(&dispatcher).await.unwrap();

        assert_eq!(*dispatcher.payloads.lock().unwrap(), vec![1]);
        // described one-shots are kept for audit, marked done
        let row = scheduler.get_schedule(&id).unwrap().unwrap();
        assert!(row.is_done);
    }

    #[tokio::test]
    async fn test_anonymous_one_shot_is_deleted() {
        let scheduler = scheduler();
        let dispatcher = RecordingDispatcher::default();

        let id = scheduler
            .add_schedule(
                payload_action(),
                ConversationSelector::one(1),
                Utc::now() - ChronoDuration::seconds(1),
                None,
            )
            .unwrap();

        scheduler.heartbeat(&dispatcher).await.unwrap();
        assert_eq!(*dispatcher.payloads.lock().unwrap(), vec![1]);
        assert!(scheduler.get_schedule(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_one_shot_is_cleaned_up_without_firing() {
        let scheduler = scheduler();
        let dispatcher = RecordingDispatcher::default();

        scheduler
            .add_schedule(
                payload_action(),
                ConversationSelector::one(1),
                Utc::now() - ChronoDuration::hours(2),
                None,
            )
            .unwrap();

        scheduler.heartbeat(&dispatcher).await.unwrap();
        assert!(dispatcher.payloads.lock().unwrap().is_empty());
        assert!(scheduler.list_schedules().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recurring_advances_and_until_expires() {
        let scheduler = scheduler();
        let dispatcher = RecordingDispatcher::default();

        // insert directly so the first firing is already due
        let id = scheduler
            .store
            .insert(
                Utc::now() - ChronoDuration::seconds(1),
                Some(&minute_spec(0)),
                Some(Utc::now() + ChronoDuration::hours(1)),
                &payload_action(),
                &ConversationSelector::one(1),
                None,
            )
            .unwrap();

        scheduler.heartbeat(&dispatcher).await.unwrap();
        assert_eq!(*dispatcher.payloads.lock().unwrap(), vec![1]);

        let row = scheduler.store.get(id).unwrap().unwrap();
        assert!(row.at > Utc::now());
        assert!(!row.is_done);

        // an expired `until` removes the row before anything else runs
        scheduler
            .store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE schedules SET until = ?1 WHERE id = ?2",
                params![(Utc::now() - ChronoDuration::seconds(1)).timestamp_millis(), id],
            )
            .unwrap();
        scheduler.heartbeat(&dispatcher).await.unwrap();
        assert!(scheduler.store.get(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_goes_to_channel() {
        let scheduler = scheduler();
        let dispatcher = RecordingDispatcher::default();

        scheduler
            .add_schedule(
                ScheduleAction::Broadcast {
                    response: Response::text("maintenance tonight"),
                },
                ConversationSelector::All,
                Utc::now() - ChronoDuration::seconds(1),
                None,
            )
            .unwrap();

        scheduler.heartbeat(&dispatcher).await.unwrap();
        assert_eq!(*dispatcher.broadcasts.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_rfc3339_without_offset_is_rejected() {
        let scheduler = scheduler();
        let result = scheduler.add_schedule_rfc3339(
            payload_action(),
            ConversationSelector::one(1),
            "2026-09-01T10:00:00",
            None,
        );
        assert!(matches!(result, Err(ScheduleError::NaiveTimestamp(_))));

        scheduler
            .add_schedule_rfc3339(
                payload_action(),
                ConversationSelector::one(1),
                "2026-09-01T10:00:00+02:00",
                None,
            )
            .unwrap();
        assert_eq!(scheduler.list_schedules().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_schedule_validates_id() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.remove_schedule("bogus_17"),
            Err(ScheduleError::InvalidScheduleId(_))
        ));

        let id = scheduler
            .add_schedule(
                payload_action(),
                ConversationSelector::one(1),
                Utc::now() + ChronoDuration::hours(1),
                None,
            )
            .unwrap();
        scheduler.remove_schedule(&id).unwrap();
        assert!(scheduler.list_schedules().unwrap().is_empty());
    }

    #[test]
    fn test_entity_value_selector_matches_contexts() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        for (conversation_id, value) in [(1, "gold"), (2, "basic")] {
            let mut context = Context::new();
            let mut entities = HashMap::new();
            entities.insert(
                "tier".to_string(),
                vec![EntityObservation::text(value)],
            );
            context.add_observation(&entities);
            snapshots
                .save(&Snapshot {
                    conversation_id,
                    channel: "test".to_string(),
                    state_name: "default.root".to_string(),
                    context_blob: context.to_blob(),
                    updated_at: 0,
                })
                .unwrap();
        }

        let selector = ConversationSelector::EntityValue {
            entity: "tier".to_string(),
            value: Some(serde_json::json!("gold")),
            max_age: None,
        };
        assert_eq!(selector.resolve(snapshots.as_ref()).unwrap(), vec![1]);

        let selector = ConversationSelector::EntityValue {
            entity: "tier".to_string(),
            value: None,
            max_age: Some(0),
        };
        assert_eq!(
            selector.resolve(snapshots.as_ref()).unwrap(),
            vec![1, 2]
        );
    }
}
