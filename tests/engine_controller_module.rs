use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use taskmill::config::{EngineConfig, RuntimeMode};
use taskmill::engine::plan::FailureKind;
use taskmill::engine::planner::{PlanRequest, Planner, PlannerError, PlannerReply};
use taskmill::engine::{RunEngine, RunRequest};
use taskmill::policy::{OpenPolicy, PolicySource};
use taskmill::store::{FilesystemRunStore, RunStatus, RunStore, StopReason};
use tempfile::{tempdir, TempDir};

/// Planner stub that replays scripted replies; the last reply repeats once
/// the script is exhausted.
struct ScriptedPlanner {
    replies: Mutex<VecDeque<String>>,
    calls: AtomicU32,
}

impl ScriptedPlanner {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Planner for ScriptedPlanner {
    fn plan(&self, _request: &PlanRequest) -> Result<PlannerReply, PlannerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut replies = self.replies.lock().expect("lock");
        let content = if replies.len() > 1 {
            replies.pop_front().unwrap_or_default()
        } else {
            replies.front().cloned().unwrap_or_default()
        };
        Ok(PlannerReply { content })
    }
}

struct Harness {
    _temp: TempDir,
    engine: RunEngine,
    store: FilesystemRunStore,
    planner: Arc<ScriptedPlanner>,
    workspace: std::path::PathBuf,
}

fn harness(replies: &[&str], mutate: impl FnOnce(&mut EngineConfig)) -> Harness {
    harness_with_policy(replies, mutate, Arc::new(OpenPolicy))
}

fn harness_with_policy(
    replies: &[&str],
    mutate: impl FnOnce(&mut EngineConfig),
    policy: Arc<dyn PolicySource>,
) -> Harness {
    let temp = tempdir().expect("tempdir");
    let workspace = temp.path().join("workspace");
    std::fs::create_dir_all(&workspace).expect("workspace");
    let mut config = EngineConfig::default();
    config.runs_dir = temp.path().join("runs");
    mutate(&mut config);
    let store = FilesystemRunStore::new(&config.runs_dir);
    let planner = Arc::new(ScriptedPlanner::new(replies));
    let engine = RunEngine::new(
        config,
        Arc::new(store.clone()),
        Arc::clone(&planner) as Arc<dyn Planner>,
        policy,
    );
    Harness {
        _temp: temp,
        engine,
        store,
        planner,
        workspace,
    }
}

fn request(task: &str, workspace: &std::path::Path) -> RunRequest {
    RunRequest {
        task: task.to_string(),
        workspace: workspace.to_path_buf(),
        ..RunRequest::default()
    }
}

const WRITE_AND_DONE: &str = r#"{
    "thought": "write the file and finish",
    "done": true,
    "final_output": "wrote result.txt",
    "actions": [
        {"name": "write_file", "params": {"path": "result.txt", "content": "success"}}
    ],
    "validations": [
        {"type": "text_in_file", "path": "result.txt", "contains": "success"}
    ]
}"#;

const CLAIM_DONE_WITHOUT_WRITING: &str = r#"{
    "thought": "declare victory early",
    "done": true,
    "final_output": "all done",
    "actions": []
}"#;

const LIST_DIR_FOREVER: &str = r#"{
    "thought": "look around",
    "done": false,
    "actions": [{"name": "list_dir", "params": {"path": "."}}]
}"#;

#[test]
fn scenario_a_valid_completion_on_first_iteration() {
    let h = harness(&[WRITE_AND_DONE], |_| {});
    let run = h
        .engine
        .start_run(request("Write the word success into result.txt", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.stop_reason, Some(StopReason::Completed));
    assert_eq!(run.iteration, 1);
    assert!(run.is_consistent());

    let content = std::fs::read_to_string(h.workspace.join("result.txt")).expect("file");
    assert_eq!(content, "success");

    // Reloading reproduces an identical run and iteration log.
    let reloaded = h.engine.get_run(&run.run_id).expect("reload");
    assert_eq!(reloaded, run);
    let iterations = h.engine.get_iterations(&run.run_id).expect("iterations");
    assert_eq!(iterations.len(), 1);
    assert!(iterations[0].done);
    assert_eq!(iterations[0].action_results.len(), 1);
    assert!(iterations[0].action_results[0].ok);
    assert_eq!(
        h.engine.get_iterations(&run.run_id).expect("reread"),
        iterations
    );

    let artifacts = h.store.list_artifacts(&run.run_id).expect("artifacts");
    assert_eq!(artifacts, vec!["result.txt".to_string()]);

    let events = h.engine.read_events(&run.run_id, 0).expect("events");
    assert!(events
        .iter()
        .any(|event| event.message.contains("objective validation passed")));
}

#[test]
fn scenario_b_unvalidated_done_claim_forces_continuation() {
    let h = harness(&[CLAIM_DONE_WITHOUT_WRITING, WRITE_AND_DONE], |_| {});
    let run = h
        .engine
        .start_run(request("Write the word success into result.txt", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.iteration, 2);

    let iterations = h.engine.get_iterations(&run.run_id).expect("iterations");
    assert_eq!(iterations.len(), 2);
    assert!(!iterations[0].done, "validator must override the done claim");
    assert!(iterations[0].output.contains("[validation] failed"));
    assert!(iterations[0]
        .output
        .contains("missing output file: result.txt"));
    assert!(iterations[1].done);

    let events = h.engine.read_events(&run.run_id, 0).expect("events");
    assert!(events
        .iter()
        .any(|event| event.message.contains("objective validation failed")));
}

#[test]
fn scenario_c_identical_iterations_stop_at_the_repetition_threshold() {
    let h = harness(&[LIST_DIR_FOREVER], |config| {
        config.no_progress_repeat_threshold = 3;
    });
    let run = h
        .engine
        .start_run(request("Poll the directory listing", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stop_reason, Some(StopReason::NoProgress));
    assert_eq!(run.iteration, 3, "never before and never after the threshold");

    let events = h.engine.read_events(&run.run_id, 0).expect("events");
    assert!(events
        .iter()
        .any(|event| event.message.contains("no_progress")));
}

#[test]
fn failed_actions_veto_a_done_claim_even_with_passing_validations() {
    // The plan writes the required file but also runs a command that fails;
    // completion must be refused for this iteration.
    let write_and_fail = r#"{
        "done": true,
        "final_output": "claiming done",
        "actions": [
            {"name": "write_file", "params": {"path": "result.txt", "content": "success"}},
            {"name": "run_command", "params": {"command": "taskmill-no-such-binary"}}
        ]
    }"#;
    let h = harness(&[write_and_fail, WRITE_AND_DONE], |_| {});
    let run = h
        .engine
        .start_run(request("Write the word success into result.txt", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.iteration, 2);
    let iterations = h.engine.get_iterations(&run.run_id).expect("iterations");
    assert!(!iterations[0].done);
    assert!(iterations[0]
        .output
        .contains("current iteration has failed actions"));
}

#[test]
fn parse_error_streak_stops_the_run() {
    let h = harness(&["this is not a plan"], |config| {
        config.planner_parse_error_streak_threshold = 3;
        config.planner_retry_max_attempts = 1;
    });
    let run = h
        .engine
        .start_run(request("Poll the directory listing", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stop_reason, Some(StopReason::NoProgress));
    assert_eq!(run.iteration, 3);
    assert_eq!(h.planner.calls(), 3);

    let iterations = h.engine.get_iterations(&run.run_id).expect("iterations");
    assert!(iterations
        .iter()
        .all(|record| record.output.contains("planner_parse_error")));
}

#[test]
fn parse_retry_recovers_within_the_same_iteration() {
    let h = harness(&["garbage reply", WRITE_AND_DONE], |config| {
        config.planner_retry_max_attempts = 2;
    });
    let run = h
        .engine
        .start_run(request("Write the word success into result.txt", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.iteration, 1, "retry happens inside the iteration");
    assert_eq!(h.planner.calls(), 2);

    let events = h.engine.read_events(&run.run_id, 0).expect("events");
    assert!(events
        .iter()
        .any(|event| event.message.contains("planner retry recovered")));
}

#[test]
fn max_iters_without_completion_fails_with_max_iters() {
    let write_a = r#"{"done": false, "actions": [{"name": "write_file", "params": {"path": "a.txt", "content": "a"}}]}"#;
    let write_b = r#"{"done": false, "actions": [{"name": "write_file", "params": {"path": "b.txt", "content": "b"}}]}"#;
    let h = harness(&[write_a, write_b], |config| {
        config.default_max_iters = 2;
    });
    let run = h
        .engine
        .start_run(request("Keep yourself busy", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stop_reason, Some(StopReason::MaxIters));
    assert_eq!(run.iteration, 2);
    assert!(run.is_consistent());
}

#[test]
fn cancellation_is_honored_before_planning() {
    let h = harness(&[LIST_DIR_FOREVER], |_| {});
    let run = h
        .engine
        .prepare_run(request("Poll the directory listing", &h.workspace))
        .expect("prepare");
    h.engine.cancel_run(&run.run_id).expect("cancel");

    let finished = h.engine.execute_run(&run.run_id).expect("execute");
    assert_eq!(finished.status, RunStatus::Canceled);
    assert_eq!(finished.stop_reason, Some(StopReason::Canceled));
    assert_eq!(finished.iteration, 0);
    assert_eq!(h.planner.calls(), 0, "no plan is requested after cancel");
}

#[test]
fn resume_of_a_terminal_run_is_a_no_op() {
    let h = harness(&[WRITE_AND_DONE], |_| {});
    let run = h
        .engine
        .start_run(request("Write the word success into result.txt", &h.workspace))
        .expect("run");
    let calls_after_first = h.planner.calls();

    let resumed = h.engine.resume_run(&run.run_id).expect("resume");
    assert_eq!(resumed, run);
    assert_eq!(h.planner.calls(), calls_after_first);
}

#[test]
fn mark_interrupted_closes_an_abandoned_run() {
    let h = harness(&[LIST_DIR_FOREVER], |_| {});
    let run = h
        .engine
        .prepare_run(request("Poll the directory listing", &h.workspace))
        .expect("prepare");

    let interrupted = h.engine.mark_interrupted(&run.run_id).expect("interrupt");
    assert_eq!(interrupted.status, RunStatus::Canceled);
    assert_eq!(interrupted.stop_reason, Some(StopReason::Interrupted));
    assert!(interrupted.is_consistent());

    let resumed = h.engine.resume_run(&run.run_id).expect("resume");
    assert_eq!(resumed.status, RunStatus::Canceled);
}

/// Policy source that narrows the allow-list after its first read,
/// exercising the per-iteration hot reload.
struct NarrowingPolicy {
    reads: AtomicU32,
}

impl PolicySource for NarrowingPolicy {
    fn current_allowed_tools(&self) -> Option<BTreeSet<String>> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst);
        if read == 0 {
            Some(["list_dir".to_string()].into_iter().collect())
        } else {
            Some(BTreeSet::new())
        }
    }
}

#[test]
fn policy_changes_take_effect_on_the_next_iteration() {
    let h = harness_with_policy(
        &[LIST_DIR_FOREVER],
        |config| {
            config.default_max_iters = 2;
        },
        Arc::new(NarrowingPolicy {
            reads: AtomicU32::new(0),
        }),
    );
    let run = h
        .engine
        .start_run(request("Poll the directory listing", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stop_reason, Some(StopReason::MaxIters));

    let iterations = h.engine.get_iterations(&run.run_id).expect("iterations");
    assert_eq!(iterations.len(), 2);
    assert!(iterations[0].action_results[0].ok, "allowed at iteration 1");
    let denied = &iterations[1].action_results[0];
    assert!(!denied.ok, "denied at iteration 2 after policy change");
    assert_eq!(
        denied.error.as_ref().expect("error").kind,
        FailureKind::CapabilityDenied
    );

    let events = h.engine.read_events(&run.run_id, 0).expect("events");
    assert!(events.iter().any(|event| event.message.contains("action denied")));
}

#[test]
fn unreachable_container_engine_is_fatal_for_the_run() {
    let run_echo = r#"{"done": false, "actions": [{"name": "run_command", "params": {"command": "echo hi"}}]}"#;
    let h = harness(&[run_echo], |config| {
        config.runtime = RuntimeMode::Container;
        config.docker_bin = "taskmill-missing-docker".to_string();
    });
    let run = h
        .engine
        .start_run(request("Echo a greeting", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stop_reason, Some(StopReason::Error));
    assert!(run.last_output.contains("execution runtime unavailable"));
    assert!(run.is_consistent());
}

#[test]
fn auto_completion_closes_a_run_that_met_its_contract_without_claiming_done() {
    let write_without_done = r#"{
        "done": false,
        "actions": [{"name": "write_file", "params": {"path": "result.txt", "content": "success"}}]
    }"#;
    let h = harness(&[write_without_done], |_| {});
    let run = h
        .engine
        .start_run(request("Write the word success into result.txt", &h.workspace))
        .expect("run");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.stop_reason, Some(StopReason::Completed));
    assert_eq!(run.iteration, 1);

    let events = h.engine.read_events(&run.run_id, 0).expect("events");
    assert!(events
        .iter()
        .any(|event| event.message.contains("auto-completed")));
}
