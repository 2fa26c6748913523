//! Configuration structures and loading

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Root state directory (journal + per-container state)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Task queue capacity; enqueue blocks when full
    #[serde(default = "default_task_capacity")]
    pub task_capacity: usize,

    /// Per-subscriber event channel capacity
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// Process monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfiguration,

    /// OOM notifier configuration
    #[serde(default)]
    pub oom: OomConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            state_dir: default_state_dir(),
            task_capacity: default_task_capacity(),
            subscriber_capacity: default_subscriber_capacity(),
            monitor: MonitorConfiguration::default(),
            oom: OomConfiguration::default(),
        }
    }
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        config.ensure_directories()?;
        Ok(config)
    }

    /// Create the state directory if it does not exist yet
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).with_context(|| {
            format!("Failed to create state directory: {}", self.state_dir.display())
        })?;
        Ok(())
    }

    /// Path of the on-disk event journal
    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join("events.log")
    }
}

/// Process monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfiguration {
    /// Poll interval for process exit detection, in milliseconds
    #[serde(default = "default_monitor_poll_ms")]
    pub poll_interval_ms: u64,

    /// Capacity of the exits channel
    #[serde(default = "default_exit_capacity")]
    pub exit_capacity: usize,
}

impl Default for MonitorConfiguration {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_monitor_poll_ms(),
            exit_capacity: default_exit_capacity(),
        }
    }
}

impl MonitorConfiguration {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// OOM notifier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OomConfiguration {
    /// Whether OOM notification is enabled
    #[serde(default = "default_oom_enabled")]
    pub enabled: bool,

    /// Poll interval for OOM marker scanning, in milliseconds
    #[serde(default = "default_oom_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for OomConfiguration {
    fn default() -> Self {
        Self {
            enabled: default_oom_enabled(),
            poll_interval_ms: default_oom_poll_ms(),
        }
    }
}

impl OomConfiguration {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/vessel")
}

fn default_task_capacity() -> usize {
    2048
}

fn default_subscriber_capacity() -> usize {
    2048
}

fn default_monitor_poll_ms() -> u64 {
    100
}

fn default_exit_capacity() -> usize {
    1024
}

fn default_oom_enabled() -> bool {
    true
}

fn default_oom_poll_ms() -> u64 {
    500
}

/// Build a configuration rooted at the given state directory, with defaults
/// for everything else
pub fn for_state_dir(state_dir: &Path) -> Configuration {
    Configuration {
        state_dir: state_dir.to_path_buf(),
        ..Configuration::default()
    }
}
