use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Host,
    Container,
}

impl RuntimeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Container => "container",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerLifecycle {
    PerAction,
    PerRun,
}

impl ContainerLifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerAction => "per_action",
            Self::PerRun => "per_run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeProfile {
    Auto,
    Base,
    Web,
    Data,
    Scraping,
    Ml,
    Qa,
}

impl RuntimeProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Base => "base",
            Self::Web => "web",
            Self::Data => "data",
            Self::Scraping => "scraping",
            Self::Ml => "ml",
            Self::Qa => "qa",
        }
    }
}

/// How the capability-failure streak reacts to an unrelated failure showing
/// up mid-streak: restart on any fingerprint change, or only when the
/// failure class itself changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStreakReset {
    OnAnyChange,
    OnClassChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerImages {
    #[serde(default = "default_image")]
    pub base: String,
    #[serde(default = "default_image")]
    pub web: String,
    #[serde(default = "default_image")]
    pub data: String,
    #[serde(default = "default_image")]
    pub scraping: String,
    #[serde(default = "default_image")]
    pub ml: String,
    #[serde(default = "default_image")]
    pub qa: String,
}

impl Default for ContainerImages {
    fn default() -> Self {
        Self {
            base: default_image(),
            web: default_image(),
            data: default_image(),
            scraping: default_image(),
            ml: default_image(),
            qa: default_image(),
        }
    }
}

impl ContainerImages {
    pub fn for_profile(&self, profile: RuntimeProfile) -> &str {
        match profile {
            RuntimeProfile::Auto | RuntimeProfile::Base => &self.base,
            RuntimeProfile::Web => &self.web,
            RuntimeProfile::Data => &self.data,
            RuntimeProfile::Scraping => &self.scraping,
            RuntimeProfile::Ml => &self.ml,
            RuntimeProfile::Qa => &self.qa,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLimits {
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory: default_memory(),
            pids_limit: default_pids_limit(),
            network: default_network(),
        }
    }
}

/// One immutable configuration value, constructed once and threaded through
/// every component call. The core never reads the process environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeMode,
    #[serde(default = "default_lifecycle")]
    pub container_lifecycle: ContainerLifecycle,
    #[serde(default = "default_profile")]
    pub image_profile: RuntimeProfile,
    #[serde(default)]
    pub images: ContainerImages,
    #[serde(default)]
    pub limits: ContainerLimits,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_true")]
    pub pip_cache_enabled: bool,
    #[serde(default = "default_true")]
    pub run_venv_enabled: bool,
    #[serde(default = "default_true")]
    pub auto_install_enabled: bool,
    #[serde(default = "default_auto_install_max_modules")]
    pub auto_install_max_modules: u32,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: usize,
    #[serde(default = "default_max_action_output_chars")]
    pub max_action_output_chars: usize,
    #[serde(default = "default_max_iters")]
    pub default_max_iters: u32,
    #[serde(default = "default_no_progress_repeat_threshold")]
    pub no_progress_repeat_threshold: u32,
    #[serde(default = "default_parse_error_streak_threshold")]
    pub planner_parse_error_streak_threshold: u32,
    #[serde(default = "default_capability_failure_streak_threshold")]
    pub capability_failure_streak_threshold: u32,
    #[serde(default = "default_streak_reset")]
    pub capability_streak_reset: CapabilityStreakReset,
    #[serde(default = "default_stagnation_threshold")]
    pub stagnation_replan_threshold: u32,
    #[serde(default = "default_run_max_wall_time_secs")]
    pub run_max_wall_time_secs: u64,
    #[serde(default = "default_planner_retry_max_attempts")]
    pub planner_retry_max_attempts: u32,
    #[serde(default = "default_safe_commands")]
    pub safe_commands: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            runtime: default_runtime(),
            container_lifecycle: default_lifecycle(),
            image_profile: default_profile(),
            images: ContainerImages::default(),
            limits: ContainerLimits::default(),
            cache_dir: default_cache_dir(),
            pip_cache_enabled: true,
            run_venv_enabled: true,
            auto_install_enabled: true,
            auto_install_max_modules: default_auto_install_max_modules(),
            docker_bin: default_docker_bin(),
            action_timeout_secs: default_action_timeout_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_fetch_bytes: default_max_fetch_bytes(),
            max_action_output_chars: default_max_action_output_chars(),
            default_max_iters: default_max_iters(),
            no_progress_repeat_threshold: default_no_progress_repeat_threshold(),
            planner_parse_error_streak_threshold: default_parse_error_streak_threshold(),
            capability_failure_streak_threshold: default_capability_failure_streak_threshold(),
            capability_streak_reset: default_streak_reset(),
            stagnation_replan_threshold: default_stagnation_threshold(),
            run_max_wall_time_secs: default_run_max_wall_time_secs(),
            planner_retry_max_attempts: default_planner_retry_max_attempts(),
            safe_commands: default_safe_commands(),
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.cpus <= 0.0 {
            return Err(ConfigError::Invalid(
                "limits.cpus must be positive".to_string(),
            ));
        }
        if self.limits.memory.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "limits.memory must be non-empty".to_string(),
            ));
        }
        if self.limits.network.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "limits.network must be non-empty".to_string(),
            ));
        }
        if self.auto_install_max_modules == 0 {
            return Err(ConfigError::Invalid(
                "auto_install_max_modules must be at least 1".to_string(),
            ));
        }
        if self.default_max_iters == 0 {
            return Err(ConfigError::Invalid(
                "default_max_iters must be at least 1".to_string(),
            ));
        }
        if self.docker_bin.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "docker_bin must be non-empty".to_string(),
            ));
        }
        if self.safe_commands.iter().any(|cmd| cmd.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "safe_commands entries must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Thresholds below 2 would stop a run on its first occurrence of a
    /// signal; clamp the way the monitor consumes them.
    pub fn repeat_threshold(&self) -> u32 {
        self.no_progress_repeat_threshold.max(2)
    }

    pub fn parse_error_threshold(&self) -> u32 {
        self.planner_parse_error_streak_threshold.max(2)
    }

    pub fn capability_threshold(&self) -> u32 {
        self.capability_failure_streak_threshold.max(2)
    }

    pub fn stagnation_threshold(&self) -> u32 {
        self.stagnation_replan_threshold.max(2)
    }
}

fn default_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from(".taskmill/runs")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".taskmill/container-cache")
}

fn default_runtime() -> RuntimeMode {
    RuntimeMode::Host
}

fn default_lifecycle() -> ContainerLifecycle {
    ContainerLifecycle::PerAction
}

fn default_profile() -> RuntimeProfile {
    RuntimeProfile::Auto
}

fn default_streak_reset() -> CapabilityStreakReset {
    CapabilityStreakReset::OnAnyChange
}

fn default_cpus() -> f64 {
    1.0
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_pids_limit() -> u32 {
    256
}

fn default_network() -> String {
    "none".to_string()
}

fn default_true() -> bool {
    true
}

fn default_auto_install_max_modules() -> u32 {
    6
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_action_timeout_secs() -> u64 {
    30
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_fetch_bytes() -> usize {
    262_144
}

fn default_max_action_output_chars() -> usize {
    12_000
}

fn default_max_iters() -> u32 {
    10
}

fn default_no_progress_repeat_threshold() -> u32 {
    3
}

fn default_parse_error_streak_threshold() -> u32 {
    3
}

fn default_capability_failure_streak_threshold() -> u32 {
    4
}

fn default_stagnation_threshold() -> u32 {
    3
}

fn default_run_max_wall_time_secs() -> u64 {
    900
}

fn default_planner_retry_max_attempts() -> u32 {
    2
}

fn default_safe_commands() -> Vec<String> {
    ["ls", "pwd", "cat", "echo", "python", "pytest", "rm"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().expect("default config validates");
        assert_eq!(config.runtime, RuntimeMode::Host);
        assert_eq!(config.container_lifecycle, ContainerLifecycle::PerAction);
        assert_eq!(config.images.base, "python:3.11-slim");
        assert!(config.safe_commands.iter().any(|cmd| cmd == "python"));
    }

    #[test]
    fn partial_yaml_fills_remaining_defaults() {
        let config: EngineConfig = serde_yaml::from_str(
            r"
runtime: container
container_lifecycle: per_run
images:
  data: python:3.11
limits:
  cpus: 2.0
",
        )
        .expect("parse");
        assert_eq!(config.runtime, RuntimeMode::Container);
        assert_eq!(config.container_lifecycle, ContainerLifecycle::PerRun);
        assert_eq!(config.images.data, "python:3.11");
        assert_eq!(config.images.base, "python:3.11-slim");
        assert_eq!(config.limits.cpus, 2.0);
        assert_eq!(config.limits.memory, "512m");
    }

    #[test]
    fn thresholds_clamp_to_safe_floor() {
        let config: EngineConfig =
            serde_yaml::from_str("no_progress_repeat_threshold: 1").expect("parse");
        assert_eq!(config.repeat_threshold(), 2);
    }
}
