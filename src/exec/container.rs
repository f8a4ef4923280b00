use super::process::{run_process, SpawnFailure};
use super::{CommandBackend, ExecBudget, ExecError, ExecOutcome};
use crate::config::{ContainerLifecycle, ContainerLimits, EngineConfig};
use crate::store::{RunStore, RunStatus};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const WORKSPACE_MOUNT: &str = "/workspace";
pub const CACHE_MOUNT: &str = "/taskmill-cache";
pub const RUN_LABEL: &str = "taskmill.run";

/// Docker exit codes that indicate the engine itself failed, as opposed to
/// the command inside the container.
const DOCKER_CLIENT_ERROR: i32 = 125;
const DOCKER_CANNOT_INVOKE: i32 = 126;
const DOCKER_NOT_FOUND: i32 = 127;

/// Live handle for a `per_run` container. Held exclusively by the backend;
/// removed at the run's terminal transition, on drop, and by the orphan
/// sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSession {
    pub container_id: String,
    pub image: String,
    pub run_id: String,
}

#[derive(Debug)]
pub struct ContainerBackend {
    docker_bin: String,
    image: String,
    lifecycle: ContainerLifecycle,
    limits: ContainerLimits,
    run_id: String,
    workspace: PathBuf,
    cache_dir: Option<PathBuf>,
    pip_cache_enabled: bool,
    run_venv_enabled: bool,
    session: Option<ContainerSession>,
    venv_ready: bool,
}

impl ContainerBackend {
    pub fn new(config: &EngineConfig, run_id: &str, workspace: &Path) -> Self {
        // The cache is advisory: if it cannot be created, execution proceeds
        // without it and installs hit the network instead.
        let cache_dir = fs::create_dir_all(&config.cache_dir)
            .ok()
            .and_then(|()| fs::canonicalize(&config.cache_dir).ok());
        Self {
            docker_bin: config.docker_bin.clone(),
            image: config.images.for_profile(config.image_profile).to_string(),
            lifecycle: config.container_lifecycle,
            limits: config.limits.clone(),
            run_id: run_id.to_string(),
            workspace: workspace.to_path_buf(),
            cache_dir,
            pip_cache_enabled: config.pip_cache_enabled,
            run_venv_enabled: config.run_venv_enabled,
            session: None,
            venv_ready: false,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn session(&self) -> Option<&ContainerSession> {
        self.session.as_ref()
    }

    fn resource_flags(&self) -> Vec<String> {
        let mut flags = vec![
            "--network".to_string(),
            self.limits.network.clone(),
            "--cpus".to_string(),
            format!("{}", self.limits.cpus),
            "--memory".to_string(),
            self.limits.memory.clone(),
            "--pids-limit".to_string(),
            self.limits.pids_limit.to_string(),
            "--label".to_string(),
            format!("{RUN_LABEL}={}", self.run_id),
            "-v".to_string(),
            format!("{}:{WORKSPACE_MOUNT}", self.workspace.display()),
            "-w".to_string(),
            WORKSPACE_MOUNT.to_string(),
        ];
        if let Some(cache) = &self.cache_dir {
            flags.push("-v".to_string());
            flags.push(format!("{}:{CACHE_MOUNT}", cache.display()));
            if self.pip_cache_enabled {
                flags.push("-e".to_string());
                flags.push(format!("PIP_CACHE_DIR={CACHE_MOUNT}/pip"));
            }
        }
        flags
    }

    /// Run-scoped virtual environment path as seen inside the container.
    fn venv_dir(&self) -> String {
        if self.cache_dir.is_some() {
            format!("{CACHE_MOUNT}/venvs/{}", self.run_id)
        } else {
            format!("{WORKSPACE_MOUNT}/.taskmill/venv")
        }
    }

    fn docker(&self, args: Vec<String>, timeout: Duration) -> Result<ExecOutcome, ExecError> {
        let mut argv = vec![self.docker_bin.clone()];
        argv.extend(args);
        match run_process(&argv, None, timeout) {
            Ok(output) => {
                if output.exit_code == Some(DOCKER_CLIENT_ERROR) {
                    return Err(ExecError::Unavailable {
                        reason: format!(
                            "container engine error: {}",
                            output.stderr.trim().lines().last().unwrap_or("exit 125")
                        ),
                    });
                }
                Ok(ExecOutcome::from_process(output))
            }
            Err(SpawnFailure::NotFound { binary }) => Err(ExecError::Unavailable {
                reason: format!("container engine binary `{binary}` not found"),
            }),
            Err(SpawnFailure::Io(source)) => Err(ExecError::Unavailable {
                reason: format!("container engine spawn failed: {source}"),
            }),
        }
    }

    fn ensure_session(&mut self, budget: &ExecBudget) -> Result<String, ExecError> {
        if let Some(session) = &self.session {
            return Ok(session.container_id.clone());
        }
        let mut args = vec!["run".to_string(), "-d".to_string()];
        args.extend(self.resource_flags());
        args.push(self.image.clone());
        args.extend(["sleep".to_string(), "infinity".to_string()]);
        let outcome = self.docker(args, budget.timeout)?;
        if !outcome.succeeded() {
            return Err(ExecError::Unavailable {
                reason: format!(
                    "failed to start run container: {}",
                    outcome.stderr.trim().lines().last().unwrap_or("unknown")
                ),
            });
        }
        let container_id = outcome.stdout.trim().to_string();
        if container_id.is_empty() {
            return Err(ExecError::Unavailable {
                reason: "container engine returned no container id".to_string(),
            });
        }
        self.session = Some(ContainerSession {
            container_id: container_id.clone(),
            image: self.image.clone(),
            run_id: self.run_id.clone(),
        });
        Ok(container_id)
    }

    fn run_in_container(
        &mut self,
        argv: &[String],
        budget: &ExecBudget,
    ) -> Result<ExecOutcome, ExecError> {
        let outcome = match self.lifecycle {
            ContainerLifecycle::PerAction => {
                let mut args = vec!["run".to_string(), "--rm".to_string()];
                args.extend(self.resource_flags());
                args.push(self.image.clone());
                args.extend(argv.iter().cloned());
                self.docker(args, budget.timeout)?
            }
            ContainerLifecycle::PerRun => {
                let container_id = self.ensure_session(budget)?;
                let mut args = vec!["exec".to_string(), container_id];
                args.extend(argv.iter().cloned());
                self.docker(args, budget.timeout)?
            }
        };

        if matches!(
            outcome.exit_code,
            Some(DOCKER_CANNOT_INVOKE) | Some(DOCKER_NOT_FOUND)
        ) {
            let binary = argv.first().cloned().unwrap_or_default();
            let mut missing = ExecOutcome::missing_binary(binary);
            missing.stderr = outcome.stderr;
            return Ok(missing);
        }
        Ok(outcome)
    }
}

impl CommandBackend for ContainerBackend {
    fn run(&mut self, argv: &[String], budget: &ExecBudget) -> Result<ExecOutcome, ExecError> {
        self.run_in_container(argv, budget)
    }

    fn install_module(
        &mut self,
        module: &str,
        budget: &ExecBudget,
    ) -> Result<ExecOutcome, ExecError> {
        if self.run_venv_enabled && !self.venv_ready {
            let venv = self.venv_dir();
            let argv = [
                "python".to_string(),
                "-m".to_string(),
                "venv".to_string(),
                venv,
            ];
            let outcome = self.run_in_container(&argv, budget)?;
            self.venv_ready = outcome.succeeded();
        }
        let argv = if self.venv_ready {
            vec![
                format!("{}/bin/pip", self.venv_dir()),
                "install".to_string(),
                module.to_string(),
            ]
        } else {
            vec![
                "python".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                module.to_string(),
            ]
        };
        self.run_in_container(&argv, budget)
    }

    fn python_program(&self) -> String {
        if self.venv_ready {
            format!("{}/bin/python", self.venv_dir())
        } else {
            "python".to_string()
        }
    }

    fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            let args = vec![
                "rm".to_string(),
                "-f".to_string(),
                session.container_id.clone(),
            ];
            let _ = self.docker(args, Duration::from_secs(30));
        }
    }
}

impl Drop for ContainerBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Remove containers left behind by a crashed controller: anything carrying
/// the run label whose persisted run is terminal or unknown. Returns the
/// removed container ids.
pub fn sweep_orphan_containers(
    docker_bin: &str,
    store: &dyn RunStore,
) -> Result<Vec<String>, ExecError> {
    let argv = vec![
        docker_bin.to_string(),
        "ps".to_string(),
        "-a".to_string(),
        "--filter".to_string(),
        format!("label={RUN_LABEL}"),
        "--format".to_string(),
        format!("{{{{.ID}}}}\t{{{{.Label \"{RUN_LABEL}\"}}}}"),
    ];
    let output = match run_process(&argv, None, Duration::from_secs(30)) {
        Ok(output) => output,
        Err(SpawnFailure::NotFound { binary }) => {
            return Err(ExecError::Unavailable {
                reason: format!("container engine binary `{binary}` not found"),
            })
        }
        Err(SpawnFailure::Io(source)) => {
            return Err(ExecError::Unavailable {
                reason: format!("container engine spawn failed: {source}"),
            })
        }
    };
    if output.exit_code != Some(0) {
        return Err(ExecError::Unavailable {
            reason: format!(
                "container listing failed: {}",
                output.stderr.trim().lines().last().unwrap_or("unknown")
            ),
        });
    }

    let mut removed = Vec::new();
    for line in output.stdout.lines() {
        let Some((container_id, run_id)) = line.split_once('\t') else {
            continue;
        };
        let container_id = container_id.trim();
        let run_id = run_id.trim();
        if container_id.is_empty() {
            continue;
        }
        let still_running = matches!(
            store.read_state(run_id),
            Ok(run) if run.status == RunStatus::Running
        );
        if still_running {
            continue;
        }
        let rm = vec![
            docker_bin.to_string(),
            "rm".to_string(),
            "-f".to_string(),
            container_id.to_string(),
        ];
        if let Ok(result) = run_process(&rm, None, Duration::from_secs(30)) {
            if result.exit_code == Some(0) {
                removed.push(container_id.to_string());
            }
        }
    }
    Ok(removed)
}
