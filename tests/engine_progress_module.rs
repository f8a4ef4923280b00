use serde_json::Map;
use taskmill::config::{CapabilityStreakReset, EngineConfig};
use taskmill::engine::plan::{Action, ActionError, ActionResult, FailureKind};
use taskmill::engine::progress::{ProgressMonitor, Verdict};
use taskmill::store::{RunStatus, StopReason};

fn config() -> EngineConfig {
    EngineConfig::default()
}

fn noop_iteration() -> (Vec<Action>, Vec<ActionResult>, String) {
    let actions = vec![Action::new("list_dir", Map::new())];
    let results = vec![ActionResult::success("list_dir", "a\nb", 1)];
    (actions, results, "same output".to_string())
}

fn capability_failure(module: &str) -> Vec<ActionResult> {
    vec![ActionResult::failure(
        "run_code",
        ActionError::new(
            FailureKind::MissingModule,
            format!("no module named '{module}'"),
        ),
        1,
    )]
}

#[test]
fn repetition_stops_exactly_at_the_threshold() {
    let mut monitor = ProgressMonitor::new(&config());
    let (actions, results, output) = noop_iteration();

    // Default threshold is 3: iterations 1 and 2 continue, 3 stops.
    for expected_continue in [true, true] {
        let verdict = monitor.observe_iteration(&actions, &results, &output, 0);
        assert_eq!(
            matches!(verdict, Verdict::Continue | Verdict::Recover(_)),
            expected_continue
        );
    }
    match monitor.observe_iteration(&actions, &results, &output, 0) {
        Verdict::Stop(stop) => {
            assert_eq!(stop.status, RunStatus::Failed);
            assert_eq!(stop.reason, StopReason::NoProgress);
            assert!(stop.detail.contains("no_progress"));
            assert!(stop.detail.contains("list_dir"));
        }
        other => panic!("expected stop, got {other:?}"),
    }

    let window = monitor.recent_signatures();
    assert_eq!(window.len(), 3);
    assert!(window.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn a_different_iteration_resets_the_repetition_window() {
    let mut monitor = ProgressMonitor::new(&config());
    let (actions, results, output) = noop_iteration();

    monitor.observe_iteration(&actions, &results, &output, 0);
    monitor.observe_iteration(&actions, &results, &output, 1);
    // Different output breaks the streak.
    monitor.observe_iteration(&actions, &results, "fresh output", 2);
    let verdict = monitor.observe_iteration(&actions, &results, &output, 3);
    assert!(!matches!(verdict, Verdict::Stop(_)));
}

#[test]
fn capability_streak_stops_with_fingerprint_diagnostics() {
    let mut config = config();
    config.no_progress_repeat_threshold = 10;
    config.capability_failure_streak_threshold = 2;
    let mut monitor = ProgressMonitor::new(&config);
    let actions = vec![Action::new("run_code", Map::new())];
    let results = capability_failure("pandas");

    // Scores advance so stagnation stays quiet; outputs differ so the
    // repetition window stays quiet.
    assert!(matches!(
        monitor.observe_iteration(&actions, &results, "try 1", 1),
        Verdict::Continue
    ));
    match monitor.observe_iteration(&actions, &results, "try 2", 2) {
        Verdict::Stop(stop) => {
            assert_eq!(stop.reason, StopReason::NoProgress);
            assert!(stop.detail.contains("capability block"));
            assert!(stop.detail.contains("missing_module"));
        }
        other => panic!("expected stop, got {other:?}"),
    }
}

#[test]
fn on_any_change_reset_restarts_the_streak_for_new_fingerprints() {
    let mut config = config();
    config.no_progress_repeat_threshold = 10;
    config.capability_failure_streak_threshold = 3;
    config.capability_streak_reset = CapabilityStreakReset::OnAnyChange;
    let mut monitor = ProgressMonitor::new(&config);
    let actions = vec![Action::new("run_code", Map::new())];

    monitor.observe_iteration(&actions, &capability_failure("pandas"), "a", 1);
    monitor.observe_iteration(&actions, &capability_failure("pandas"), "b", 2);
    // A different module interrupts the streak under on_any_change.
    monitor.observe_iteration(&actions, &capability_failure("numpy"), "c", 3);
    let verdict = monitor.observe_iteration(&actions, &capability_failure("pandas"), "d", 4);
    assert!(!matches!(verdict, Verdict::Stop(_)));
}

#[test]
fn on_class_change_reset_survives_unrelated_module_churn() {
    let mut config = config();
    config.no_progress_repeat_threshold = 10;
    config.capability_failure_streak_threshold = 3;
    config.capability_streak_reset = CapabilityStreakReset::OnClassChange;
    let mut monitor = ProgressMonitor::new(&config);
    let actions = vec![Action::new("run_code", Map::new())];

    monitor.observe_iteration(&actions, &capability_failure("pandas"), "a", 1);
    monitor.observe_iteration(&actions, &capability_failure("numpy"), "b", 2);
    // Same failure class (missing_module) keeps the streak alive.
    match monitor.observe_iteration(&actions, &capability_failure("scipy"), "c", 3) {
        Verdict::Stop(stop) => assert_eq!(stop.reason, StopReason::NoProgress),
        other => panic!("expected stop, got {other:?}"),
    }
}

#[test]
fn parse_error_streak_stops_after_the_threshold() {
    let mut monitor = ProgressMonitor::new(&config());
    assert!(monitor.observe_parse_failure().is_none());
    assert!(monitor.observe_parse_failure().is_none());
    let stop = monitor.observe_parse_failure().expect("third strike");
    assert_eq!(stop.reason, StopReason::NoProgress);
    assert!(stop.detail.contains("planner_parse_error"));

    let mut monitor = ProgressMonitor::new(&config());
    monitor.observe_parse_failure();
    monitor.note_parse_success();
    assert!(monitor.observe_parse_failure().is_none());
}

#[test]
fn stagnation_emits_a_recovery_directive_without_stopping() {
    let mut config = config();
    config.no_progress_repeat_threshold = 10;
    let mut monitor = ProgressMonitor::new(&config);
    let actions = vec![Action::new("read_file", Map::new())];
    let results = vec![ActionResult::success("read_file", "content", 1)];

    // Score never improves; outputs differ so repetition stays quiet.
    monitor.observe_iteration(&actions, &results, "one", 5);
    monitor.observe_iteration(&actions, &results, "two", 5);
    monitor.observe_iteration(&actions, &results, "three", 5);
    match monitor.observe_iteration(&actions, &results, "four", 5) {
        Verdict::Recover(directive) => assert!(directive.contains("different strategy")),
        other => panic!("expected recovery directive, got {other:?}"),
    }
}

#[test]
fn wall_clock_budget_stops_with_an_error_reason() {
    let mut config = config();
    config.run_max_wall_time_secs = 1;
    let monitor = ProgressMonitor::new(&config);
    assert!(monitor.check_wall_clock().is_none());
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let stop = monitor.check_wall_clock().expect("budget exceeded");
    assert_eq!(stop.status, RunStatus::Failed);
    assert_eq!(stop.reason, StopReason::Error);
    assert!(stop.detail.contains("wall time limit"));

    let mut unlimited = EngineConfig::default();
    unlimited.run_max_wall_time_secs = 0;
    assert!(ProgressMonitor::new(&unlimited).check_wall_clock().is_none());
}
