//! Engine configuration.
//!
//! Every knob has the built-in default from the scheduler design; a TOML
//! file can override them for diagnostics and tests.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use colloquy_types::{
    BACKOFF_DELAYS_MS, DELAY_AFTER_ONLINE_MS, FIRST_IDLE_CHECK_MS, IDLE_CHECK_PERIOD_MS,
    IDLE_TIMEOUT_BACKGROUND_MS, IDLE_TIMEOUT_FOREGROUND_MS, MAX_ACTIVE_CONNECTIONS_BACKGROUND,
    MAX_ACTIVE_CONNECTIONS_FOREGROUND, OPERATION_STAGGER_MS, PEER_PENDING_GRACE_MS,
};

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Connection limits and idle policy.
    #[serde(default)]
    pub connections: ConnectionConfig,
    /// Scheduling cadence.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Directory holding file blobs. Empty = use the transport's.
    #[serde(default)]
    pub files_dir: String,
}

/// Connection limits and idle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Active-connection limit while foreground.
    #[serde(default = "default_max_foreground")]
    pub max_foreground: usize,
    /// Active-connection limit while background.
    #[serde(default = "default_max_background")]
    pub max_background: usize,
    /// Idle threshold before closing a link, foreground (ms).
    #[serde(default = "default_idle_foreground_ms")]
    pub idle_foreground_ms: i64,
    /// Idle threshold before closing a link, background (ms).
    #[serde(default = "default_idle_background_ms")]
    pub idle_background_ms: i64,
    /// Cadence of the idle sweep while any link is open (ms).
    #[serde(default = "default_idle_check_period_ms")]
    pub idle_check_period_ms: i64,
    /// Delay before the first idle sweep after the first link opens (ms).
    #[serde(default = "default_first_idle_check_ms")]
    pub first_idle_check_ms: i64,
    /// Extra idle allowance when the peer signals pending operations (ms).
    #[serde(default = "default_peer_pending_grace_ms")]
    pub peer_pending_grace_ms: i64,
}

/// Scheduling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Stagger between per-conversation dispatches in one pass (ms).
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: i64,
    /// Deferral of the first pass after coming online, background (ms).
    #[serde(default = "default_delay_after_online_ms")]
    pub delay_after_online_ms: i64,
    /// Reconnection backoff table (ms per slot).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<i64>,
}

fn default_max_foreground() -> usize {
    MAX_ACTIVE_CONNECTIONS_FOREGROUND
}

fn default_max_background() -> usize {
    MAX_ACTIVE_CONNECTIONS_BACKGROUND
}

fn default_idle_foreground_ms() -> i64 {
    IDLE_TIMEOUT_FOREGROUND_MS
}

fn default_idle_background_ms() -> i64 {
    IDLE_TIMEOUT_BACKGROUND_MS
}

fn default_idle_check_period_ms() -> i64 {
    IDLE_CHECK_PERIOD_MS
}

fn default_first_idle_check_ms() -> i64 {
    FIRST_IDLE_CHECK_MS
}

fn default_peer_pending_grace_ms() -> i64 {
    PEER_PENDING_GRACE_MS
}

fn default_stagger_ms() -> i64 {
    OPERATION_STAGGER_MS
}

fn default_delay_after_online_ms() -> i64 {
    DELAY_AFTER_ONLINE_MS
}

fn default_backoff_ms() -> Vec<i64> {
    BACKOFF_DELAYS_MS.to_vec()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_foreground: default_max_foreground(),
            max_background: default_max_background(),
            idle_foreground_ms: default_idle_foreground_ms(),
            idle_background_ms: default_idle_background_ms(),
            idle_check_period_ms: default_idle_check_period_ms(),
            first_idle_check_ms: default_first_idle_check_ms(),
            peer_pending_grace_ms: default_peer_pending_grace_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stagger_ms: default_stagger_ms(),
            delay_after_online_ms: default_delay_after_online_ms(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connections: ConnectionConfig::default(),
            scheduler: SchedulerConfig::default(),
            files_dir: String::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file; defaults if absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: EngineConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Files directory override, when configured.
    pub fn files_dir(&self) -> Option<PathBuf> {
        if self.files_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.files_dir))
        }
    }
}
