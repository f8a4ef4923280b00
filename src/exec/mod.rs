pub mod container;
pub mod host;
pub mod image;
pub mod install;
mod process;

pub use container::{sweep_orphan_containers, ContainerBackend, ContainerSession};
pub use host::HostBackend;
pub use image::{resolve_profile, resolve_runtime_image};
pub use install::{extract_missing_module, InstallGovernor};

use crate::config::{EngineConfig, RuntimeMode};
use crate::engine::plan::{
    Action, ActionError, ActionResult, FailureKind, ACTION_DELETE_FILE, ACTION_FETCH_URL,
    ACTION_LIST_DIR, ACTION_READ_FILE, ACTION_RUN_CODE, ACTION_RUN_COMMAND, ACTION_WRITE_FILE,
};
use crate::policy::{resolve_workspace_path, split_command};
use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Failing to reach the execution substrate is fatal for the run: it means
/// the engine is broken, not the task. Everything else is expressed as a
/// failed `ActionResult`.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("execution runtime unavailable: {reason}")]
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct ExecBudget {
    pub timeout: Duration,
    pub max_output_chars: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub missing_binary: Option<String>,
}

impl ExecOutcome {
    pub(crate) fn from_process(output: process::ProcessOutput) -> Self {
        Self {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: output.timed_out,
            missing_binary: None,
        }
    }

    pub fn missing_binary(binary: String) -> Self {
        Self {
            missing_binary: Some(binary),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && self.missing_binary.is_none()
    }

    pub fn combined_text(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Command/code execution seam between the runtime facade and the host or
/// container substrate. `argv` paths are workspace-relative; the backend
/// decides where the workspace actually lives.
pub trait CommandBackend: Send {
    fn run(&mut self, argv: &[String], budget: &ExecBudget) -> Result<ExecOutcome, ExecError>;
    fn install_module(&mut self, module: &str, budget: &ExecBudget)
        -> Result<ExecOutcome, ExecError>;
    fn python_program(&self) -> String;
    fn shutdown(&mut self) {}
}

/// Per-run execution runtime: dispatches filesystem and fetch capabilities
/// in-process and command/code capabilities to the configured backend.
pub struct ExecutionRuntime {
    workspace: PathBuf,
    budget: ExecBudget,
    fetch_timeout: Duration,
    max_fetch_bytes: usize,
    auto_install_enabled: bool,
    auto_install_max_modules: u32,
    backend: Box<dyn CommandBackend>,
    events: Vec<String>,
    code_seq: u32,
}

impl ExecutionRuntime {
    pub fn new(config: &EngineConfig, run_id: &str, workspace: &Path, image: &str) -> Self {
        let backend: Box<dyn CommandBackend> = match config.runtime {
            RuntimeMode::Host => Box::new(HostBackend::new(workspace)),
            RuntimeMode::Container => {
                Box::new(ContainerBackend::new(config, run_id, workspace).with_image(image))
            }
        };
        Self::with_backend(config, workspace, backend)
    }

    pub fn with_backend(
        config: &EngineConfig,
        workspace: &Path,
        backend: Box<dyn CommandBackend>,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            budget: ExecBudget {
                timeout: Duration::from_secs(config.action_timeout_secs),
                max_output_chars: config.max_action_output_chars,
            },
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            max_fetch_bytes: config.max_fetch_bytes,
            auto_install_enabled: config.auto_install_enabled,
            auto_install_max_modules: config.auto_install_max_modules,
            backend,
            events: Vec::new(),
            code_seq: 0,
        }
    }

    /// Drain events produced since the last call (installs, session notes),
    /// for the controller to append to the run's event log.
    pub fn take_events(&mut self) -> Vec<String> {
        std::mem::take(&mut self.events)
    }

    pub fn shutdown(&mut self) {
        self.backend.shutdown();
    }

    pub fn execute(&mut self, action: &Action) -> Result<ActionResult, ExecError> {
        let started = Instant::now();
        let (output, error) = match action.name.as_str() {
            ACTION_LIST_DIR => split_outcome(self.list_dir(action)),
            ACTION_READ_FILE => split_outcome(self.read_file(action)),
            ACTION_WRITE_FILE => split_outcome(self.write_file(action)),
            ACTION_DELETE_FILE => split_outcome(self.delete_file(action)),
            ACTION_FETCH_URL => split_outcome(self.fetch_url(action)),
            ACTION_RUN_COMMAND => self.run_command(action)?,
            ACTION_RUN_CODE => self.run_code(action)?,
            other => (
                String::new(),
                Some(ActionError::new(
                    FailureKind::CapabilityDenied,
                    format!("action not allowed: {other}"),
                )),
            ),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let output = truncate_chars(&output, self.budget.max_output_chars);
        Ok(match error {
            None => ActionResult::success(&action.name, output, duration_ms),
            Some(error) => {
                ActionResult::failure_with_output(&action.name, output, error, duration_ms)
            }
        })
    }

    fn list_dir(&self, action: &Action) -> Result<String, ActionError> {
        let raw = action.path_param().unwrap_or(".");
        let path = resolve_workspace_path(&self.workspace, raw)?;
        if !path.is_dir() {
            return Err(ActionError::new(
                FailureKind::InvalidParams,
                format!("not a directory: {raw}"),
            ));
        }
        let mut names: Vec<String> = fs::read_dir(&path)
            .map_err(|err| io_failure(&path, &err))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names.join("\n"))
    }

    fn read_file(&self, action: &Action) -> Result<String, ActionError> {
        let raw = action.path_param().ok_or_else(missing_path)?;
        let path = resolve_workspace_path(&self.workspace, raw)?;
        if !path.is_file() {
            return Err(ActionError::new(
                FailureKind::InvalidParams,
                format!("not a file: {raw}"),
            ));
        }
        fs::read_to_string(&path).map_err(|err| io_failure(&path, &err))
    }

    fn write_file(&self, action: &Action) -> Result<String, ActionError> {
        let raw = action.path_param().ok_or_else(missing_path)?;
        let content = action.str_param("content").unwrap_or_default();
        let mode = action.str_param("mode").unwrap_or("overwrite");
        let path = resolve_workspace_path(&self.workspace, raw)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_failure(parent, &err))?;
        }
        if mode == "append" {
            use std::io::Write;
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|err| io_failure(&path, &err))?;
            file.write_all(content.as_bytes())
                .map_err(|err| io_failure(&path, &err))?;
        } else {
            fs::write(&path, content).map_err(|err| io_failure(&path, &err))?;
        }
        Ok(format!("written: {raw}"))
    }

    fn delete_file(&self, action: &Action) -> Result<String, ActionError> {
        let raw = action.path_param().ok_or_else(missing_path)?;
        let path = resolve_workspace_path(&self.workspace, raw)?;
        if !path.is_file() {
            return Err(ActionError::new(
                FailureKind::InvalidParams,
                format!("not a file: {raw}"),
            ));
        }
        fs::remove_file(&path).map_err(|err| io_failure(&path, &err))?;
        Ok(format!("deleted: {raw}"))
    }

    fn fetch_url(&self, action: &Action) -> Result<String, ActionError> {
        let url = action
            .str_param("url")
            .ok_or_else(|| ActionError::new(FailureKind::InvalidParams, "missing url"))?;
        let response = ureq::get(url)
            .timeout(self.fetch_timeout)
            .call()
            .map_err(|err| {
                ActionError::new(FailureKind::Network, format!("fetch failed: {err}"))
            })?;
        let mut body = String::new();
        response
            .into_reader()
            .take(self.max_fetch_bytes as u64)
            .read_to_string(&mut body)
            .map_err(|err| ActionError::new(FailureKind::Network, format!("fetch read error: {err}")))?;
        Ok(body)
    }

    fn run_command(&mut self, action: &Action) -> Result<ActionOutcome, ExecError> {
        let command = action.str_param("command").unwrap_or_default().trim();
        if command.is_empty() {
            return Ok(invalid("missing command"));
        }
        let Some(mut argv) = split_command(command) else {
            return Ok(invalid("unbalanced command quoting"));
        };
        if let Some(Value::Array(args)) = action.params.get("args") {
            argv.extend(args.iter().filter_map(Value::as_str).map(str::to_string));
        }
        if argv.is_empty() {
            return Ok(invalid("empty command"));
        }
        let outcome = self.backend.run(&argv, &self.budget)?;
        Ok(outcome_to_parts(&outcome))
    }

    fn run_code(&mut self, action: &Action) -> Result<ActionOutcome, ExecError> {
        let script = match action.str_param("path") {
            Some(path) if !path.trim().is_empty() => path.trim().to_string(),
            _ => {
                let code = action.str_param("code").unwrap_or_default();
                if code.trim().is_empty() {
                    return Ok(invalid("missing code or path"));
                }
                match self.materialize_code(code) {
                    Ok(rel) => rel,
                    Err(error) => return Ok((String::new(), Some(error))),
                }
            }
        };

        let mut argv = vec![self.backend.python_program(), script];
        if let Some(Value::Array(args)) = action.params.get("args") {
            argv.extend(args.iter().filter_map(Value::as_str).map(str::to_string));
        }

        let mut outcome = self.backend.run(&argv, &self.budget)?;
        let mut governor = InstallGovernor::new(
            self.auto_install_enabled,
            self.auto_install_max_modules,
        );
        while !outcome.succeeded() && !outcome.timed_out {
            let Some(module) = extract_missing_module(&outcome.combined_text()) else {
                break;
            };
            if !governor.approve(&module) {
                break;
            }
            let install = self.backend.install_module(&module, &self.budget)?;
            if !install.succeeded() {
                self.events
                    .push(format!("dependency install failed module={module}"));
                break;
            }
            self.events
                .push(format!("dependency installed module={module}"));
            // The python program may move into the run venv after the first
            // install.
            argv[0] = self.backend.python_program();
            outcome = self.backend.run(&argv, &self.budget)?;
        }
        Ok(outcome_to_parts(&outcome))
    }

    fn materialize_code(&mut self, code: &str) -> Result<String, ActionError> {
        self.code_seq += 1;
        let rel = format!(".taskmill/exec/code_{}.py", self.code_seq);
        let path = resolve_workspace_path(&self.workspace, &rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_failure(parent, &err))?;
        }
        fs::write(&path, code).map_err(|err| io_failure(&path, &err))?;
        Ok(rel)
    }
}

/// A capability outcome as the controller records it: the captured output
/// text plus the classified failure, if any.
type ActionOutcome = (String, Option<ActionError>);

fn split_outcome(result: Result<String, ActionError>) -> ActionOutcome {
    match result {
        Ok(output) => (output, None),
        Err(error) => (String::new(), Some(error)),
    }
}

fn invalid(message: &str) -> ActionOutcome {
    (
        String::new(),
        Some(ActionError::new(FailureKind::InvalidParams, message)),
    )
}

fn outcome_to_parts(outcome: &ExecOutcome) -> ActionOutcome {
    if let Some(binary) = &outcome.missing_binary {
        return (
            outcome.combined_text(),
            Some(ActionError::new(
                FailureKind::MissingBinary,
                format!("no such file or directory: '{binary}'"),
            )),
        );
    }
    if outcome.timed_out {
        return (
            outcome.combined_text(),
            Some(ActionError::new(FailureKind::Timeout, "command timed out")),
        );
    }
    let text = outcome.combined_text();
    match outcome.exit_code {
        Some(0) => (text.trim().to_string(), None),
        code => {
            let kind = if extract_missing_module(&text).is_some() {
                FailureKind::MissingModule
            } else {
                FailureKind::ExitNonzero
            };
            let error = ActionError::new(
                kind,
                format!(
                    "exit_code={} {}",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string()),
                    first_error_line(&text)
                ),
            );
            (text, Some(error))
        }
    }
}

fn first_error_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn missing_path() -> ActionError {
    ActionError::new(FailureKind::InvalidParams, "missing required path parameter")
}

fn io_failure(path: &Path, err: &std::io::Error) -> ActionError {
    ActionError::new(FailureKind::Io, format!("{}: {err}", path.display()))
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n[output truncated]")
}
