//! Configuration management

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path for snapshots and schedules
    pub db_path: PathBuf,

    /// Flow definition files (TOML), comma-separated in the env var
    pub flow_paths: Vec<PathBuf>,

    /// Generic message sent to the user when an action fails (optional;
    /// when unset the failure stays silent and the conversation simply
    /// resumes from its last checkpoint)
    pub error_message_text: Option<String>,

    /// Propagate action errors instead of swallowing them (test harness mode)
    pub harness_mode: bool,

    /// Scheduler heartbeat interval
    pub heartbeat_interval: Duration,

    /// Per-entity context depth cap
    pub context_max_depth: usize,

    /// State-visit history cap
    pub history_limit: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("FLOWBOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("flowbot.db"));

        let flow_paths = std::env::var("FLOWBOT_FLOWS")
            .map(|v| v.split(',').map(|p| PathBuf::from(p.trim())).collect())
            .unwrap_or_default();

        let error_message_text = std::env::var("FLOWBOT_ERROR_MESSAGE").ok();

        let harness_mode = std::env::var("FLOWBOT_HARNESS_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let heartbeat_interval = std::env::var("FLOWBOT_HEARTBEAT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let context_max_depth = std::env::var("FLOWBOT_CONTEXT_DEPTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let history_limit = std::env::var("FLOWBOT_HISTORY_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        Ok(Self {
            db_path,
            flow_paths,
            error_message_text,
            harness_mode,
            heartbeat_interval,
            context_max_depth,
            history_limit,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("flowbot.db"),
            flow_paths: Vec::new(),
            error_message_text: None,
            harness_mode: false,
            heartbeat_interval: Duration::from_secs(5),
            context_max_depth: 30,
            history_limit: 20,
        }
    }
}
