//! Conversation Snapshots
//!
//! The durable per-conversation record: current state name plus the
//! serialized entity context. The store is the unit the manager loads before
//! a resolution and writes back after one, so a crashed or failed resolution
//! simply replays from the last good snapshot.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::channel::ConversationRef;

/// One persisted conversation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub conversation_id: i64,
    pub channel: String,
    /// Qualified `flow.state` name
    pub state_name: String,
    /// Serialized context, see [`crate::context::Context::to_blob`]
    pub context_blob: String,
    pub updated_at: i64,
}

/// Storage for conversation snapshots.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, conversation_id: i64) -> Result<Option<Snapshot>>;

    fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Every known conversation, for broadcast selectors.
    fn list_conversations(&self) -> Result<Vec<ConversationRef>>;
}

// ============ SQLite ============

/// Snapshot store with SQLite backend
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open or create the snapshot database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Snapshot store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database, for tests and the console demo
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("snapshot store poisoned");
        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS snapshots (
                conversation_id INTEGER PRIMARY KEY,
                channel TEXT NOT NULL,
                state_name TEXT NOT NULL,
                context TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_updated_at
                ON snapshots(updated_at DESC);
            "#,
        )?;

        Ok(())
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self, conversation_id: i64) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock().expect("snapshot store poisoned");
        let snapshot = conn
            .query_row(
                "SELECT conversation_id, channel, state_name, context, updated_at
                 FROM snapshots WHERE conversation_id = ?1",
                params![conversation_id],
                |row| {
                    Ok(Snapshot {
                        conversation_id: row.get(0)?,
                        channel: row.get(1)?,
                        state_name: row.get(2)?,
                        context_blob: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp_millis();

        let conn = self.conn.lock().expect("snapshot store poisoned");
        conn.execute(
            "INSERT INTO snapshots (conversation_id, channel, state_name, context, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(conversation_id) DO UPDATE SET
                 channel = excluded.channel,
                 state_name = excluded.state_name,
                 context = excluded.context,
                 updated_at = excluded.updated_at",
            params![
                snapshot.conversation_id,
                snapshot.channel,
                snapshot.state_name,
                snapshot.context_blob,
                timestamp
            ],
        )?;

        debug!(
            "Saved snapshot for conversation {} at {}",
            snapshot.conversation_id, snapshot.state_name
        );
        Ok(())
    }

    fn list_conversations(&self) -> Result<Vec<ConversationRef>> {
        let conn = self.conn.lock().expect("snapshot store poisoned");
        let mut stmt =
            conn.prepare("SELECT conversation_id, channel FROM snapshots ORDER BY conversation_id")?;
        let refs = stmt
            .query_map([], |row| {
                Ok(ConversationRef {
                    conversation_id: row.get(0)?,
                    channel: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(refs)
    }
}

// ============ In-memory ============

/// Volatile store, for unit tests.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<i64, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, conversation_id: i64) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots.lock().expect("snapshot store poisoned");
        Ok(snapshots.get(&conversation_id).cloned())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.lock().expect("snapshot store poisoned");
        let mut snapshot = snapshot.clone();
        snapshot.updated_at = chrono::Utc::now().timestamp_millis();
        snapshots.insert(snapshot.conversation_id, snapshot);
        Ok(())
    }

    fn list_conversations(&self) -> Result<Vec<ConversationRef>> {
        let snapshots = self.snapshots.lock().expect("snapshot store poisoned");
        let mut refs: Vec<ConversationRef> = snapshots
            .values()
            .map(|s| ConversationRef {
                conversation_id: s.conversation_id,
                channel: s.channel.clone(),
            })
            .collect();
        refs.sort_by_key(|r| r.conversation_id);
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(conversation_id: i64, state_name: &str) -> Snapshot {
        Snapshot {
            conversation_id,
            channel: "test".to_string(),
            state_name: state_name.to_string(),
            context_blob: "{}".to_string(),
            updated_at: 0,
        }
    }

    #[test]
    fn test_sqlite_save_and_load_roundtrip() {
        let store = SqliteSnapshotStore::open_in_memory().unwrap();
        assert!(store.load(1).unwrap().is_none());

        store.save(&snapshot(1, "default.root")).unwrap();
        let loaded = store.load(1).unwrap().unwrap();
        assert_eq!(loaded.state_name, "default.root");
        assert_eq!(loaded.channel, "test");
        assert!(loaded.updated_at > 0);
    }

    #[test]
    fn test_sqlite_save_overwrites_existing() {
        let store = SqliteSnapshotStore::open_in_memory().unwrap();
        store.save(&snapshot(1, "default.root")).unwrap();
        store.save(&snapshot(1, "order.checkout")).unwrap();

        let loaded = store.load(1).unwrap().unwrap();
        assert_eq!(loaded.state_name, "order.checkout");
        assert_eq!(store.list_conversations().unwrap().len(), 1);
    }

    #[test]
    fn test_list_conversations_is_ordered() {
        let store = MemorySnapshotStore::new();
        store.save(&snapshot(3, "default.root")).unwrap();
        store.save(&snapshot(1, "default.root")).unwrap();

        let refs = store.list_conversations().unwrap();
        let ids: Vec<i64> = refs.iter().map(|r| r.conversation_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
