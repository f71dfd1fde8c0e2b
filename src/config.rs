// SPDX-License-Identifier: MIT
//! Daemon configuration.
//!
//! Loaded from `steward.toml` when present, otherwise defaults. Every section
//! is `#[serde(default)]` so a partial file only overrides what it names.
//! CLI flags and `STEWARD_*` env vars (parsed in `main.rs`) override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const DEFAULT_PORT: u16 = 4720;
const DEFAULT_TICK_INTERVAL_SECS: u64 = 120;
const DEFAULT_TICK_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_CONCURRENT: usize = 3;
const DEFAULT_DISPATCH_COOLDOWN_MS: u64 = 60_000;
const DEFAULT_DISPATCH_TIMEOUT_MINUTES: i64 = 60;
const DEFAULT_STALE_THRESHOLD_HOURS: i64 = 24;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_OPEN_DURATION_MS: u64 = 30 * 60 * 1000;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_AUTO_EXECUTE_CONFIDENCE: f64 = 0.8;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── TickConfig ──────────────────────────────────────────────────────────────

/// Tick loop configuration (`[tick]` in steward.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TickConfig {
    /// Seconds between automatic ticks (default: 120).
    pub interval_secs: u64,
    /// How long a tick may hold the single-flight lock before another caller
    /// force-releases it (default: 60 000 ms).
    pub timeout_ms: u64,
    /// Minimum decision confidence for unattended execution (default: 0.8).
    pub auto_execute_confidence: f64,
    /// Hours a task may sit in_progress before it is flagged stale (default: 24).
    pub stale_threshold_hours: i64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            timeout_ms: DEFAULT_TICK_TIMEOUT_MS,
            auto_execute_confidence: DEFAULT_AUTO_EXECUTE_CONFIDENCE,
            stale_threshold_hours: DEFAULT_STALE_THRESHOLD_HOURS,
        }
    }
}

impl TickConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ─── DispatchConfig ──────────────────────────────────────────────────────────

/// Dispatcher guard configuration (`[dispatch]` in steward.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum tasks in_progress within a focus scope (default: 3).
    pub max_concurrent: usize,
    /// Milliseconds between consecutive dispatches (default: 60 000).
    pub cooldown_ms: u64,
    /// Minutes after which an in_progress task with no callback is
    /// auto-failed by the patrol (default: 60).
    pub timeout_minutes: i64,
    /// Circuit-breaker key scoping the execution agent (default: "steward-run").
    pub breaker_key: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            cooldown_ms: DEFAULT_DISPATCH_COOLDOWN_MS,
            timeout_minutes: DEFAULT_DISPATCH_TIMEOUT_MINUTES,
            breaker_key: "steward-run".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

// ─── BreakerConfig ───────────────────────────────────────────────────────────

/// Circuit-breaker configuration (`[breaker]` in steward.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before a key opens (default: 3).
    pub failure_threshold: u32,
    /// Milliseconds an open circuit waits before allowing a half-open probe
    /// (default: 1 800 000 — 30 minutes). Checked lazily on read, never by a
    /// background timer.
    pub open_duration_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_duration_ms: DEFAULT_OPEN_DURATION_MS,
        }
    }
}

impl BreakerConfig {
    pub fn open_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.open_duration_ms as i64)
    }
}

// ─── RetryConfig ─────────────────────────────────────────────────────────────

/// Retry budget (`[retry]` in steward.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum automatic retries per task lineage (default: 2).
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

// ─── AgentConfig ─────────────────────────────────────────────────────────────

/// Execution agent configuration (`[agent]` in steward.toml).
///
/// The agent is an opaque long-running subprocess. It is launched detached
/// with `<binary> <task_id> <run_id> <prompt_file>` and reports completion by
/// POSTing to `callback_url`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Path to the execution agent binary.
    pub binary: PathBuf,
    /// Working directory the agent runs in.
    pub work_dir: PathBuf,
    /// Directory for materialized prompt files.
    pub prompt_dir: PathBuf,
    /// Directory for per-task agent logs.
    pub log_dir: PathBuf,
    /// Completion callback endpoint handed to the agent via
    /// `STEWARD_CALLBACK_URL`.
    pub callback_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("steward-run"),
            work_dir: std::env::temp_dir().join("steward-workspace"),
            prompt_dir: std::env::temp_dir().join("steward-prompts"),
            log_dir: std::env::temp_dir().join("steward-logs"),
            callback_url: format!("http://127.0.0.1:{DEFAULT_PORT}/api/v1/callback"),
        }
    }
}

// ─── NotifyConfig ────────────────────────────────────────────────────────────

/// Notification sink (`[notify]` in steward.toml). Best-effort only.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook URL to POST notifications to. None = notifications disabled.
    pub webhook_url: Option<String>,
}

// ─── StewardConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StewardConfig {
    /// Bind address for the REST surface (default: 127.0.0.1).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub port: u16,
    pub tick: TickConfig,
    pub dispatch: DispatchConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub agent: AgentConfig,
    pub notify: NotifyConfig,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: DEFAULT_PORT,
            tick: TickConfig::default(),
            dispatch: DispatchConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            agent: AgentConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl StewardConfig {
    /// Load from a TOML file. A missing file yields the defaults; a malformed
    /// file is an error (silent fallback would hide operator typos).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
