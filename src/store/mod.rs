mod filesystem;

pub use filesystem::FilesystemRunStore;

use crate::engine::plan::{Action, ActionResult, Plan};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read run data {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse run data {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("run `{run_id}` not found")]
    UnknownRun { run_id: String },
    #[error("artifact path `{path}` rejected: {reason}")]
    ArtifactPath { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    MaxIters,
    NoProgress,
    Canceled,
    Error,
    Interrupted,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::MaxIters => "max_iters",
            Self::NoProgress => "no_progress",
            Self::Canceled => "canceled",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability metadata supplied by the skill subsystem. Success artifacts
/// seed the auto-inferred objective checks; names feed image auto-selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    #[serde(default)]
    pub success_artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub task: String,
    pub workspace: PathBuf,
    pub max_iters: u32,
    #[serde(default)]
    pub iteration: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_output: String,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub injected_context: String,
    #[serde(default)]
    pub skills: Vec<CapabilitySpec>,
}

impl Run {
    /// Invariant check: a run that left `running` must carry a stop reason.
    pub fn is_consistent(&self) -> bool {
        self.status.is_terminal() == self.stop_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub run_id: String,
    pub iteration: u32,
    pub timestamp: String,
    #[serde(default)]
    pub prompt: String,
    pub plan: Plan,
    #[serde(default)]
    pub raw_plan: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub action_results: Vec<ActionResult>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub offset: u64,
    pub timestamp: String,
    pub message: String,
}

/// Durable persistence consumed by the run controller. Each write must be
/// durable before the controller moves to the next iteration.
pub trait RunStore: Send + Sync {
    fn init_run(&self, run: &Run) -> Result<(), StoreError>;
    fn write_state(&self, run: &Run) -> Result<(), StoreError>;
    fn read_state(&self, run_id: &str) -> Result<Run, StoreError>;
    fn run_exists(&self, run_id: &str) -> bool;
    fn append_iteration(&self, record: &IterationRecord) -> Result<(), StoreError>;
    fn read_iterations(&self, run_id: &str) -> Result<Vec<IterationRecord>, StoreError>;
    fn append_event(&self, run_id: &str, message: &str) -> Result<(), StoreError>;
    fn read_events(&self, run_id: &str, from_offset: u64) -> Result<Vec<EventRecord>, StoreError>;
    fn write_artifact(&self, run_id: &str, rel_path: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn list_artifacts(&self, run_id: &str) -> Result<Vec<String>, StoreError>;
    fn request_cancel(&self, run_id: &str) -> Result<(), StoreError>;
}
