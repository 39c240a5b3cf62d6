//! Dispatch Deduplication
//!
//! TTL-bounded idempotency store keyed by dispatch identifier. The scheduler
//! already claims rows transactionally; this is the second line of defense
//! against redundant delivery when a dispatch is retried or two engine
//! instances share a store.

use moka::sync::Cache;
use std::time::Duration;
use tracing::debug;

/// How long a dispatch id stays claimed
const DEFAULT_WINDOW: Duration = Duration::from_secs(10 * 60);

const MAX_TRACKED: u64 = 100_000;

#[derive(Clone)]
pub struct DedupStore {
    seen: Cache<String, ()>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        let seen = Cache::builder()
            .time_to_live(window)
            .max_capacity(MAX_TRACKED)
            .build();
        Self { seen }
    }

    /// Claim a dispatch id. Returns true exactly once per id within the
    /// window; a false return means the dispatch must be suppressed.
    pub fn claim(&self, dispatch_id: &str) -> bool {
        let entry = self.seen.entry(dispatch_id.to_string()).or_insert(());
        let fresh = entry.is_fresh();
        if !fresh {
            debug!("suppressing duplicate dispatch {}", dispatch_id);
        }
        fresh
    }
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new()
    }
}
