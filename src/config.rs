use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub mitigation: MitigationConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Switch connection handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Address the OpenFlow channel listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Idle timeout for reactive forwarding rules (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u16,

    /// Hard timeout for reactive forwarding rules (seconds)
    #[serde(default = "default_hard_timeout")]
    pub hard_timeout_secs: u16,

    /// Outbound command queue depth per switch
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            idle_timeout_secs: default_idle_timeout(),
            hard_timeout_secs: default_hard_timeout(),
            command_queue: default_command_queue(),
        }
    }
}

/// Port blocking policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MitigationConfig {
    /// Start with mitigation enabled
    #[serde(default)]
    pub enabled: bool,

    /// Hard timeout of installed block rules (seconds)
    #[serde(default = "default_block_timeout")]
    pub block_hard_timeout_secs: u16,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            block_hard_timeout_secs: default_block_timeout(),
        }
    }
}

/// Flow statistics collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Seconds between flow-stats polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Consecutive polls a flow may be absent before its series is evicted
    #[serde(default = "default_retire_cycles")]
    pub retire_cycles: u32,

    /// Samples retained per flow series
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            retire_cycles: default_retire_cycles(),
            sample_window: default_sample_window(),
        }
    }
}

/// Feature dataset output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// CSV file feature records are appended to
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,

    /// Label stamped on every emitted row
    #[serde(default = "default_label")]
    pub label: String,

    /// Record channel depth between aggregation and the writer
    #[serde(default = "default_record_queue")]
    pub record_queue: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dataset_path: default_dataset_path(),
            label: default_label(),
            record_queue: default_record_queue(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:6653".to_string()
}

fn default_idle_timeout() -> u16 {
    20
}

fn default_hard_timeout() -> u16 {
    100
}

fn default_command_queue() -> usize {
    256
}

fn default_block_timeout() -> u16 {
    120
}

fn default_poll_interval() -> u64 {
    10
}

fn default_retire_cycles() -> u32 {
    2
}

fn default_sample_window() -> usize {
    32
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("dataset.csv")
}

fn default_label() -> String {
    "BENIGN".to_string()
}

fn default_record_queue() -> usize {
    1024
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowsentry/config.toml"),
            PathBuf::from("flowsentry.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}
