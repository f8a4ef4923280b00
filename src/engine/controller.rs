use crate::config::{EngineConfig, RuntimeMode};
use crate::engine::contract::TaskContract;
use crate::engine::error::EngineError;
use crate::engine::plan::{parse_plan, Action, ActionResult, ParsedPlan, Plan, ACTION_WRITE_FILE};
use crate::engine::planner::{
    reduced_request, render_plan_prompt, PlanRequest, Planner, PlannerError,
};
use crate::engine::progress::{ProgressMonitor, StopSignal, Verdict};
use crate::engine::validate::{
    collect_checks, evaluate_auto_complete, evaluate_checks, objective_progress,
};
use crate::exec::{
    resolve_runtime_image, sweep_orphan_containers, ExecError, ExecutionRuntime,
};
use crate::policy::{authorize_action, PolicySource};
use crate::shared::ids::allocate_run_id;
use crate::shared::{unix_now, utc_now_iso};
use crate::store::{
    CapabilitySpec, EventRecord, IterationRecord, Run, RunStatus, RunStore, StopReason,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Inputs for one run. `injected_context` and `skills` come from the memory
/// and skill subsystems respectively; the engine treats both as data.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub task: String,
    pub workspace: PathBuf,
    pub max_iters: Option<u32>,
    pub injected_context: String,
    pub skills: Vec<CapabilitySpec>,
}

/// The run execution engine. One instance serves many concurrent runs; the
/// embedding host supplies one worker (thread) per run and calls
/// `execute_run` on it. All cross-run state lives in the store.
pub struct RunEngine {
    config: EngineConfig,
    store: Arc<dyn RunStore>,
    planner: Arc<dyn Planner>,
    policy: Arc<dyn PolicySource>,
}

enum PlanAttempt {
    Parsed {
        plan: Plan,
        raw: String,
        prompt: String,
    },
    ParseFailed {
        reason: String,
        raw: String,
        prompt: String,
    },
    Unavailable {
        reason: String,
    },
}

impl RunEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RunStore>,
        planner: Arc<dyn Planner>,
        policy: Arc<dyn PolicySource>,
    ) -> Self {
        Self {
            config,
            store,
            planner,
            policy,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Allocate and persist a new run without executing it.
    pub fn prepare_run(&self, request: RunRequest) -> Result<Run, EngineError> {
        fs::create_dir_all(&request.workspace).map_err(|source| EngineError::Workspace {
            path: request.workspace.display().to_string(),
            source,
        })?;
        let workspace =
            fs::canonicalize(&request.workspace).map_err(|source| EngineError::Workspace {
                path: request.workspace.display().to_string(),
                source,
            })?;
        let run_id = allocate_run_id(unix_now(), |candidate| self.store.run_exists(candidate))
            .map_err(EngineError::RunId)?;
        let now = utc_now_iso();
        let run = Run {
            run_id,
            task: request.task,
            workspace,
            max_iters: request.max_iters.unwrap_or(self.config.default_max_iters),
            iteration: 0,
            status: RunStatus::Running,
            stop_reason: None,
            created_at: now.clone(),
            updated_at: now,
            last_output: String::new(),
            cancel_requested: false,
            injected_context: request.injected_context,
            skills: request.skills,
        };
        self.store.init_run(&run)?;
        Ok(run)
    }

    /// Drive a prepared run to a terminal state on the calling thread.
    pub fn execute_run(&self, run_id: &str) -> Result<Run, EngineError> {
        let run = self.store.read_state(run_id)?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        self.run_loop(run)
    }

    pub fn start_run(&self, request: RunRequest) -> Result<Run, EngineError> {
        let run = self.prepare_run(request)?;
        self.execute_run(&run.run_id)
    }

    /// Re-enter a previously interrupted run at the top of its loop.
    /// Terminal runs are returned unchanged.
    pub fn resume_run(&self, run_id: &str) -> Result<Run, EngineError> {
        self.execute_run(run_id)
    }

    /// Cooperative cancellation: flips the persisted flag, honored at the
    /// top of the run's next iteration.
    pub fn cancel_run(&self, run_id: &str) -> Result<(), EngineError> {
        self.store.request_cancel(run_id)?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run, EngineError> {
        Ok(self.store.read_state(run_id)?)
    }

    pub fn get_iterations(&self, run_id: &str) -> Result<Vec<IterationRecord>, EngineError> {
        Ok(self.store.read_iterations(run_id)?)
    }

    /// Run-ordered event records, replayable from any prior offset.
    pub fn read_events(
        &self,
        run_id: &str,
        from_offset: u64,
    ) -> Result<Vec<EventRecord>, EngineError> {
        Ok(self.store.read_events(run_id, from_offset)?)
    }

    /// Hosts call this from their shutdown path for runs they were driving.
    pub fn mark_interrupted(&self, run_id: &str) -> Result<Run, EngineError> {
        let mut run = self.store.read_state(run_id)?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        run.status = RunStatus::Canceled;
        run.stop_reason = Some(StopReason::Interrupted);
        run.updated_at = utc_now_iso();
        self.store.write_state(&run)?;
        self.store.append_event(&run.run_id, "stopped: interrupted")?;
        Ok(run)
    }

    /// Remove `per_run` containers whose run is no longer running; invoked
    /// on controller restart.
    pub fn sweep_orphan_containers(&self) -> Result<Vec<String>, EngineError> {
        sweep_orphan_containers(&self.config.docker_bin, self.store.as_ref()).map_err(
            |ExecError::Unavailable { reason }| EngineError::RuntimeUnavailable { reason },
        )
    }

    fn run_loop(&self, mut run: Run) -> Result<Run, EngineError> {
        let contract = TaskContract::parse(&run.task);
        let skill_names: Vec<String> = run.skills.iter().map(|s| s.name.clone()).collect();
        let required_outputs =
            merge_required_outputs(&contract.required_outputs, &skill_artifacts(&run.skills));

        let (image, profile) = resolve_runtime_image(&self.config, &run.task, &skill_names);
        if self.config.runtime == RuntimeMode::Container {
            self.store.append_event(
                &run.run_id,
                &format!("container runtime profile={} image={image}", profile.as_str()),
            )?;
        }
        let mut runtime = ExecutionRuntime::new(&self.config, &run.run_id, &run.workspace, &image);
        let result = self.drive(&mut run, &contract, &required_outputs, &mut runtime);
        // The container session is released on every exit path; `Drop` on
        // the backend covers panics and early returns.
        runtime.shutdown();
        result.map(|()| run)
    }

    fn drive(
        &self,
        run: &mut Run,
        contract: &TaskContract,
        required_outputs: &[String],
        runtime: &mut ExecutionRuntime,
    ) -> Result<(), EngineError> {
        let mut monitor = ProgressMonitor::new(&self.config);
        let mut produced: BTreeSet<String> = BTreeSet::new();
        let mut recovery_directive: Option<String> = None;

        loop {
            if let Some(stop) = monitor.check_wall_clock() {
                return self.finish(run, &stop);
            }

            let latest = self.store.read_state(&run.run_id)?;
            if latest.cancel_requested {
                run.cancel_requested = true;
                return self.finish(
                    run,
                    &StopSignal {
                        status: RunStatus::Canceled,
                        reason: StopReason::Canceled,
                        detail: "stopped by cancel request".to_string(),
                    },
                );
            }

            if run.iteration >= run.max_iters {
                self.append_max_iters_diagnostics(run, required_outputs, &produced);
                return self.finish(
                    run,
                    &StopSignal {
                        status: RunStatus::Failed,
                        reason: StopReason::MaxIters,
                        detail: "stopped: max_iters reached".to_string(),
                    },
                );
            }

            let iteration = run.iteration + 1;
            let allowed_tools = self.policy.current_allowed_tools();
            let request = PlanRequest {
                task: run.task.clone(),
                iteration,
                max_iters: run.max_iters,
                previous_output: run.last_output.clone(),
                injected_context: run.injected_context.clone(),
                allowed_tools: allowed_tools
                    .as_ref()
                    .map(|tools| tools.iter().cloned().collect())
                    .unwrap_or_default(),
                recovery_directive: recovery_directive.take(),
                reduced: false,
            };

            let (plan, raw_plan, prompt) = match self.plan_with_retry(&run.run_id, &request)? {
                PlanAttempt::Parsed { plan, raw, prompt } => {
                    monitor.note_parse_success();
                    (plan, raw, prompt)
                }
                PlanAttempt::Unavailable { reason } => {
                    return self.finish(
                        run,
                        &StopSignal {
                            status: RunStatus::Failed,
                            reason: StopReason::Error,
                            detail: format!("planner unavailable: {reason}"),
                        },
                    );
                }
                PlanAttempt::ParseFailed { reason, raw, prompt } => {
                    let output = format!("planner_parse_error: {reason}");
                    self.store.append_event(
                        &run.run_id,
                        &format!("planner parse error iteration={iteration}"),
                    )?;
                    self.persist_iteration(
                        run,
                        iteration,
                        &prompt,
                        Plan::default(),
                        &raw,
                        &[],
                        output.clone(),
                        false,
                    )?;
                    if let Some(stop) = monitor.observe_parse_failure() {
                        return self.finish(run, &stop);
                    }
                    self.store.write_state(run)?;
                    continue;
                }
            };

            // Execute the plan's actions strictly in sequence; a denial is a
            // recorded result, never a run-level fault.
            let baseline = required_output_baseline(&run.workspace, required_outputs);
            let mut results: Vec<ActionResult> = Vec::new();
            let mut fatal: Option<String> = None;
            for action in &plan.actions {
                if let Err(denied) = authorize_action(
                    action,
                    &run.workspace,
                    &self.config.safe_commands,
                    allowed_tools.as_ref(),
                ) {
                    self.store.append_event(
                        &run.run_id,
                        &format!("action denied name={} reason={denied}", action.name),
                    )?;
                    results.push(ActionResult::failure(&action.name, denied, 0));
                    continue;
                }
                match runtime.execute(action) {
                    Ok(result) => {
                        for event in runtime.take_events() {
                            self.store.append_event(&run.run_id, &event)?;
                        }
                        results.push(result);
                    }
                    Err(ExecError::Unavailable { reason }) => {
                        fatal = Some(reason);
                        break;
                    }
                }
            }

            let mut output = plan.final_output.clone();
            if output.is_empty() && !results.is_empty() {
                output = render_results(&results);
            }
            let has_failed_action = results.iter().any(|result| !result.ok);
            let mut done = plan.done;

            if let Some(reason) = fatal {
                self.persist_iteration(
                    run,
                    iteration,
                    &prompt,
                    plan.clone(),
                    &raw_plan,
                    &results,
                    output,
                    false,
                )?;
                return self.finish(
                    run,
                    &StopSignal {
                        status: RunStatus::Failed,
                        reason: StopReason::Error,
                        detail: format!("execution runtime unavailable: {reason}"),
                    },
                );
            }

            produced.extend(self.snapshot_artifacts(
                run,
                &plan.actions,
                &results,
                required_outputs,
                &baseline,
            ));

            // Partial failure within the iteration disqualifies it from
            // closing the run, regardless of what validations would say.
            if done && has_failed_action {
                done = false;
                output = append_validation_failures(
                    &output,
                    &["current iteration has failed actions".to_string()],
                );
                self.store.append_event(
                    &run.run_id,
                    "objective validation blocked by failed actions in iteration",
                )?;
            }

            let progress = objective_progress(&run.workspace, required_outputs, &produced);
            let verdict =
                monitor.observe_iteration(&plan.actions, &results, &output, progress.score());
            let stop = match verdict {
                Verdict::Stop(stop) => Some(stop),
                Verdict::Recover(directive) => {
                    self.store.append_event(
                        &run.run_id,
                        &format!(
                            "objective stagnation detected streak={} required={} existing={}",
                            monitor.stagnation_streak(),
                            progress.required_total,
                            progress.existing
                        ),
                    )?;
                    recovery_directive = Some(directive);
                    None
                }
                Verdict::Continue => None,
            };

            if stop.is_none() && done {
                let checks = collect_checks(
                    contract,
                    &plan.validations,
                    required_outputs,
                    &produced,
                );
                let report = evaluate_checks(
                    &run.workspace,
                    &checks,
                    &contract.required_outputs,
                    &produced,
                );
                if report.ok {
                    self.store
                        .append_event(&run.run_id, "objective validation passed")?;
                } else {
                    done = false;
                    output = append_validation_failures(&output, &report.failures);
                    self.store.append_event(
                        &run.run_id,
                        &format!("objective validation failed count={}", report.failures.len()),
                    )?;
                }
            }

            // Auto-completion: the plan did not claim done, but every
            // inferred objective check already passes within this run.
            let mut auto_completed = false;
            if stop.is_none() && !done && !has_failed_action {
                if let Some(report) = evaluate_auto_complete(&run.workspace, contract, &produced) {
                    if report.ok && !report.checks.is_empty() {
                        done = true;
                        auto_completed = true;
                    }
                }
            }

            self.persist_iteration(
                run,
                iteration,
                &prompt,
                plan.clone(),
                &raw_plan,
                &results,
                output,
                done,
            )?;

            if let Some(stop) = stop {
                return self.finish(run, &stop);
            }
            if done {
                if auto_completed {
                    self.store.append_event(
                        &run.run_id,
                        "objective auto-completed from inferred validations",
                    )?;
                }
                return self.finish(
                    run,
                    &StopSignal {
                        status: RunStatus::Completed,
                        reason: StopReason::Completed,
                        detail: "objective validation passed".to_string(),
                    },
                );
            }
            self.store.write_state(run)?;
        }
    }

    fn plan_with_retry(
        &self,
        run_id: &str,
        request: &PlanRequest,
    ) -> Result<PlanAttempt, EngineError> {
        let attempts = self.config.planner_retry_max_attempts.max(1);
        let mut last: Option<PlanAttempt> = None;
        for attempt in 1..=attempts {
            let current = if attempt == 1 {
                request.clone()
            } else {
                self.store.append_event(
                    run_id,
                    &format!("planner retry attempt={attempt}/{attempts} mode=reduced_context"),
                )?;
                reduced_request(request)
            };
            let prompt = render_plan_prompt(&current);
            let reply = match self.planner.plan(&current) {
                Ok(reply) => reply,
                Err(PlannerError::Unavailable(reason)) => {
                    return Ok(PlanAttempt::Unavailable { reason })
                }
            };
            match parse_plan(&reply.content) {
                ParsedPlan::Plan(plan) => {
                    if attempt > 1 {
                        self.store
                            .append_event(run_id, &format!("planner retry recovered attempt={attempt}"))?;
                    }
                    return Ok(PlanAttempt::Parsed {
                        plan,
                        raw: reply.content,
                        prompt,
                    });
                }
                ParsedPlan::ParseError { reason, raw } => {
                    last = Some(PlanAttempt::ParseFailed { reason, raw, prompt });
                }
            }
        }
        Ok(last.unwrap_or(PlanAttempt::ParseFailed {
            reason: "planner produced no reply".to_string(),
            raw: String::new(),
            prompt: render_plan_prompt(request),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_iteration(
        &self,
        run: &mut Run,
        iteration: u32,
        prompt: &str,
        plan: Plan,
        raw_plan: &str,
        results: &[ActionResult],
        output: String,
        done: bool,
    ) -> Result<(), EngineError> {
        let actions = plan.actions.clone();
        let record = IterationRecord {
            run_id: run.run_id.clone(),
            iteration,
            timestamp: utc_now_iso(),
            prompt: prompt.to_string(),
            plan,
            raw_plan: raw_plan.to_string(),
            actions,
            action_results: results.to_vec(),
            output: output.clone(),
            done,
        };
        self.store.append_iteration(&record)?;
        self.store
            .append_event(&run.run_id, &format!("iteration={iteration} done={done}"))?;
        run.iteration = iteration;
        run.last_output = output;
        run.updated_at = utc_now_iso();
        Ok(())
    }

    fn finish(&self, run: &mut Run, stop: &StopSignal) -> Result<(), EngineError> {
        run.status = stop.status;
        run.stop_reason = Some(stop.reason);
        run.updated_at = utc_now_iso();
        if matches!(stop.reason, StopReason::Error | StopReason::NoProgress) {
            run.last_output = if run.last_output.is_empty() {
                stop.detail.clone()
            } else {
                format!("{}\n\n{}", run.last_output, stop.detail)
            };
        }
        self.store.write_state(run)?;
        self.store.append_event(&run.run_id, &stop.detail)?;
        Ok(())
    }

    /// Copy files this iteration produced into the run's artifact store:
    /// successful file writes, plus required outputs that changed against
    /// the pre-iteration baseline.
    fn snapshot_artifacts(
        &self,
        run: &Run,
        actions: &[Action],
        results: &[ActionResult],
        required_outputs: &[String],
        baseline: &BTreeMap<String, FileStamp>,
    ) -> BTreeSet<String> {
        let mut snapshotted = BTreeSet::new();

        for (action, result) in actions.iter().zip(results.iter()) {
            if !result.ok || action.name != ACTION_WRITE_FILE {
                continue;
            }
            if let Some(raw) = action.path_param() {
                self.snapshot_one(run, raw, &mut snapshotted);
            }
        }

        for path in required_outputs {
            let current = stamp_file(&run.workspace, path);
            let previous = baseline.get(path).copied().unwrap_or_default();
            if current.exists && current != previous {
                self.snapshot_one(run, path, &mut snapshotted);
            }
        }
        snapshotted
    }

    fn snapshot_one(&self, run: &Run, raw: &str, snapshotted: &mut BTreeSet<String>) {
        let rel = raw.trim().trim_start_matches("./").replace('\\', "/");
        if rel.is_empty() || snapshotted.contains(&rel) {
            return;
        }
        let Ok(resolved) = crate::policy::resolve_workspace_path(&run.workspace, &rel) else {
            return;
        };
        let Ok(bytes) = fs::read(&resolved) else {
            return;
        };
        if self.store.write_artifact(&run.run_id, &rel, &bytes).is_ok() {
            let _ = self
                .store
                .append_event(&run.run_id, &format!("artifact saved: {rel}"));
            snapshotted.insert(rel);
        }
    }

    fn append_max_iters_diagnostics(
        &self,
        run: &mut Run,
        required_outputs: &[String],
        produced: &BTreeSet<String>,
    ) {
        if required_outputs.is_empty() {
            return;
        }
        let progress = objective_progress(&run.workspace, required_outputs, produced);
        let missing = if progress.missing_paths.is_empty() {
            "-".to_string()
        } else {
            progress.missing_paths.join(", ")
        };
        let diagnostic = format!(
            "[objective] incomplete at max_iters\n- required_outputs: {}\n- existing: {}\n- non_empty: {}\n- produced_in_run: {}\n- missing: {missing}",
            progress.required_total, progress.existing, progress.non_empty, progress.produced
        );
        run.last_output = if run.last_output.is_empty() {
            diagnostic
        } else {
            format!("{}\n\n{diagnostic}", run.last_output)
        };
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FileStamp {
    exists: bool,
    size: u64,
    modified: Option<SystemTime>,
}

fn stamp_file(workspace: &Path, rel: &str) -> FileStamp {
    let Ok(path) = crate::policy::resolve_workspace_path(workspace, rel) else {
        return FileStamp::default();
    };
    let Ok(metadata) = fs::metadata(&path) else {
        return FileStamp::default();
    };
    if !metadata.is_file() {
        return FileStamp::default();
    }
    FileStamp {
        exists: true,
        size: metadata.len(),
        modified: metadata.modified().ok(),
    }
}

fn required_output_baseline(
    workspace: &Path,
    required_outputs: &[String],
) -> BTreeMap<String, FileStamp> {
    required_outputs
        .iter()
        .map(|path| (path.clone(), stamp_file(workspace, path)))
        .collect()
}

fn skill_artifacts(skills: &[CapabilitySpec]) -> Vec<String> {
    let mut rows = Vec::new();
    for skill in skills {
        for raw in &skill.success_artifacts {
            let candidate = raw.trim().replace('\\', "/");
            if candidate.is_empty() || candidate.starts_with('/') || candidate.starts_with("../") {
                continue;
            }
            rows.push(candidate);
        }
    }
    rows
}

fn merge_required_outputs(left: &[String], right: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut merged = Vec::new();
    for value in left.iter().chain(right.iter()) {
        let item = value.trim().to_string();
        if item.is_empty() || !seen.insert(item.clone()) {
            continue;
        }
        merged.push(item);
    }
    merged
}

fn render_results(results: &[ActionResult]) -> String {
    results
        .iter()
        .map(|result| {
            let mut block = format!("[{}] ok={}\n{}", result.name, result.ok, result.output);
            if let Some(error) = &result.error {
                block.push_str(&format!("\nerror={error}"));
            }
            block.trim().to_string()
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn append_validation_failures(output: &str, failures: &[String]) -> String {
    let mut text = String::new();
    if !output.is_empty() {
        text.push_str(output);
        text.push_str("\n\n");
    }
    text.push_str("[validation] failed; continue iterations");
    for failure in failures {
        text.push_str(&format!("\n- {failure}"));
    }
    text
}
