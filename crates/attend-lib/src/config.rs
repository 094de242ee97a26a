use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `gaze.address`.
pub const GAZE_ADDRESS_ENV: &str = "ATTEND_GAZE_ADDRESS";

/// Whole experiment configuration as read from TOML. Every table is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub recorder: RecorderConfig,
    pub eeg: EegConfig,
    pub gaze: GazeConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Root directory under which one directory per trial is created.
    pub save_dir: PathBuf,
    /// Nominal EEG rate in Hz, used for throughput logging only.
    pub sr_eeg: u32,
    /// Log EEG throughput every `print_every` seconds worth of samples.
    pub print_every: u32,
    pub verbose: bool,
    pub pull_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Consecutive pull timeouts after which a stream is treated as closed.
    pub max_consecutive_timeouts: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("recordings"),
            sr_eeg: 512,
            print_every: 1,
            verbose: true,
            pull_timeout_ms: 500,
            stop_timeout_ms: 2000,
            connect_timeout_ms: 10_000,
            max_consecutive_timeouts: 20,
        }
    }
}

impl RecorderConfig {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pull_timeout_ms == 0 {
            bail!("recorder.pull_timeout_ms must be positive");
        }
        if self.stop_timeout_ms < self.pull_timeout_ms {
            bail!(
                "recorder.stop_timeout_ms ({}) must be at least pull_timeout_ms ({})",
                self.stop_timeout_ms,
                self.pull_timeout_ms
            );
        }
        if self.connect_timeout_ms == 0 {
            bail!("recorder.connect_timeout_ms must be positive");
        }
        if self.max_consecutive_timeouts == 0 {
            bail!("recorder.max_consecutive_timeouts must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EegConfig {
    pub enabled: bool,
    /// Declared stream type to resolve, e.g. "EEG".
    pub stream_type: String,
    pub discovery_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for EegConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_type: "EEG".into(),
            discovery_timeout_ms: 5000,
            poll_interval_ms: 1,
        }
    }
}

impl EegConfig {
    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GazeConfig {
    pub enabled: bool,
    /// `host:port` of the eye-tracker gaze relay.
    pub address: String,
    pub connect_timeout_ms: u64,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for GazeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "tg03b-080202040971:8765".into(),
            connect_timeout_ms: 5000,
            retry_initial_backoff_ms: 1,
            retry_max_backoff_ms: 50,
        }
    }
}

impl GazeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms.max(self.retry_initial_backoff_ms).max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device indices addressed by the trial plan's `device` column.
    pub devices: Vec<usize>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            devices: vec![0, 1, 4],
        }
    }
}

pub fn parse_config(contents: &str) -> Result<ExperimentConfig> {
    let mut config: ExperimentConfig = toml::from_str(contents).context("parsing config")?;
    if let Ok(address) = std::env::var(GAZE_ADDRESS_ENV) {
        if !address.trim().is_empty() {
            config.gaze.address = address.trim().to_string();
        }
    }
    config.recorder.validate()?;
    Ok(config)
}

pub fn read_config(path: &Path) -> Result<ExperimentConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config {}", path.display()))
}
