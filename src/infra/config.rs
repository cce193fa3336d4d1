//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{Comparison, Mode, Threshold};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

/// Threshold used when none is configured or the configured one is invalid
pub const DEFAULT_THRESHOLD_MS: u64 = 126;

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_threshold")]
    pub threshold: i64,
    #[serde(default)]
    pub play_sound: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Minimum time between two real subordinate fetches
    #[serde(default = "default_subordinate_cache_ms")]
    pub subordinate_cache_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Number of recent hangs kept for display
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            threshold: default_threshold(),
            play_sound: false,
            poll_interval_ms: default_poll_interval_ms(),
            subordinate_cache_ms: default_subordinate_cache_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_mode() -> Mode {
    Mode::MainThreadHangs
}

fn default_threshold() -> i64 {
    DEFAULT_THRESHOLD_MS as i64
}

fn default_poll_interval_ms() -> u64 {
    400
}

fn default_subordinate_cache_ms() -> u64 {
    300
}

fn default_fetch_timeout_ms() -> u64 {
    2000
}

fn default_history_capacity() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// JSON snapshot of the main process histograms
    #[serde(default = "default_main_snapshot")]
    pub main_snapshot: String,
    /// Directory of per-process JSON bundles
    #[serde(default = "default_subordinate_dir")]
    pub subordinate_dir: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { main_snapshot: default_main_snapshot(), subordinate_dir: default_subordinate_dir() }
    }
}

fn default_main_snapshot() -> String {
    "telemetry/main.json".to_string()
}

fn default_subordinate_dir() -> String {
    "telemetry/subordinates".to_string()
}

/// Per-metric histogram name and comparison policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModeProfile {
    pub histogram: String,
    pub comparison: Comparison,
    /// Fixed threshold for this metric; `None` uses the user threshold
    #[serde(default)]
    pub threshold: Option<u64>,
}

impl ModeProfile {
    pub fn threshold(&self, user_threshold: u64) -> Threshold {
        Threshold { value: self.threshold.unwrap_or(user_threshold), comparison: self.comparison }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModesConfig {
    #[serde(default = "default_thread_hangs_profile")]
    pub thread_hangs: ModeProfile,
    #[serde(default = "default_event_loop_lag_profile")]
    pub event_loop_lag: ModeProfile,
    #[serde(default = "default_input_response_lag_profile")]
    pub input_response_lag: ModeProfile,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            thread_hangs: default_thread_hangs_profile(),
            event_loop_lag: default_event_loop_lag_profile(),
            input_response_lag: default_input_response_lag_profile(),
        }
    }
}

impl ModesConfig {
    /// Profile feeding the given mode; the three thread-hang modes share one
    pub fn profile(&self, mode: Mode) -> &ModeProfile {
        match mode {
            Mode::MainThreadHangs | Mode::SubordinateThreadHangs | Mode::AllThreadHangs => {
                &self.thread_hangs
            }
            Mode::EventLoopLag => &self.event_loop_lag,
            Mode::InputResponseLag => &self.input_response_lag,
        }
    }
}

fn default_thread_hangs_profile() -> ModeProfile {
    ModeProfile {
        histogram: "Gecko".to_string(),
        comparison: Comparison::Inclusive,
        threshold: None,
    }
}

fn default_event_loop_lag_profile() -> ModeProfile {
    ModeProfile {
        histogram: "EVENTLOOP_UI_ACTIVITY_EXP_MS".to_string(),
        comparison: Comparison::Exclusive,
        threshold: Some(50),
    }
}

fn default_input_response_lag_profile() -> ModeProfile {
    ModeProfile {
        histogram: "INPUT_EVENT_RESPONSE_MS".to_string(),
        comparison: Comparison::Exclusive,
        threshold: None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// HTTP control/status port (0 to disable)
    #[serde(default = "default_control_port")]
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { port: default_control_port() }
    }
}

fn default_control_port() -> u16 {
    8126
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub modes: ModesConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    mode: Mode,
    threshold: u64,
    play_sound: bool,
    poll_interval_ms: u64,
    subordinate_cache_ms: u64,
    fetch_timeout_ms: u64,
    history_capacity: usize,
    main_snapshot: String,
    subordinate_dir: String,
    modes: ModesConfig,
    control_port: u16,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    /// Determine config file path from the command line or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        Self::pick_config_path(cli_path, env::var("CONFIG_FILE").ok())
    }

    fn pick_config_path(cli_path: Option<&str>, env_path: Option<String>) -> String {
        cli_path
            .map(str::to_string)
            .or(env_path.filter(|path| !path.is_empty()))
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml_str(&content, path.display().to_string())
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, origin: String) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        Ok(Self::from_toml(toml_config, origin))
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let threshold = validate_threshold(toml_config.monitor.threshold);
        Self {
            mode: toml_config.monitor.mode,
            threshold,
            play_sound: toml_config.monitor.play_sound,
            poll_interval_ms: toml_config.monitor.poll_interval_ms.max(1),
            subordinate_cache_ms: toml_config.monitor.subordinate_cache_ms,
            fetch_timeout_ms: toml_config.monitor.fetch_timeout_ms.max(1),
            history_capacity: toml_config.monitor.history_capacity.max(1),
            main_snapshot: toml_config.source.main_snapshot,
            subordinate_dir: toml_config.source.subordinate_dir,
            modes: toml_config.modes,
            control_port: toml_config.control.port,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            config_file,
        }
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn play_sound(&self) -> bool {
        self.play_sound
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn subordinate_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.subordinate_cache_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    pub fn main_snapshot(&self) -> &str {
        &self.main_snapshot
    }

    pub fn subordinate_dir(&self) -> &str {
        &self.subordinate_dir
    }

    pub fn modes(&self) -> &ModesConfig {
        &self.modes
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Override the configured mode (command line takes precedence)
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the configured threshold; invalid values fall back to the default
    pub fn with_threshold(mut self, threshold: i64) -> Self {
        self.threshold = validate_threshold(threshold);
        self
    }

    pub fn with_play_sound(mut self, play_sound: bool) -> Self {
        self.play_sound = play_sound;
        self
    }

    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms.max(1);
        self
    }

    pub fn with_subordinate_cache_ms(mut self, cache_ms: u64) -> Self {
        self.subordinate_cache_ms = cache_ms;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }
}

/// Thresholds below 1 ms are meaningless; fall back to the default
pub fn validate_threshold(threshold: i64) -> u64 {
    if threshold < 1 {
        warn!(threshold = %threshold, default = %DEFAULT_THRESHOLD_MS, "invalid_threshold");
        DEFAULT_THRESHOLD_MS
    } else {
        threshold as u64
    }
}
