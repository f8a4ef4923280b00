use crate::config::{CapabilityStreakReset, EngineConfig};
use crate::engine::plan::{Action, ActionResult, FailureKind};
use crate::store::{RunStatus, StopReason};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Terminal verdict from the monitor, carried back to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSignal {
    pub status: RunStatus,
    pub reason: StopReason,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Keep running, but fold this directive into the next planning prompt.
    Recover(String),
    Stop(StopSignal),
}

/// Per-run progress accounting: repetition window, planner-parse and
/// capability-failure streaks, wall-clock budget, and objective stagnation.
/// Counters are monotonic only within an unbroken streak; any qualitatively
/// different observation resets them.
#[derive(Debug)]
pub struct ProgressMonitor {
    started: Instant,
    wall_limit: Duration,
    repeat_threshold: u32,
    parse_error_threshold: u32,
    capability_threshold: u32,
    stagnation_threshold: u32,
    streak_reset: CapabilityStreakReset,
    recent_signatures: VecDeque<String>,
    last_signature: String,
    repeat_count: u32,
    parse_error_streak: u32,
    capability_streak: u32,
    last_fingerprint: String,
    last_failure_class: String,
    best_score: i64,
    stagnation_streak: u32,
}

impl ProgressMonitor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            started: Instant::now(),
            wall_limit: Duration::from_secs(config.run_max_wall_time_secs),
            repeat_threshold: config.repeat_threshold(),
            parse_error_threshold: config.parse_error_threshold(),
            capability_threshold: config.capability_threshold(),
            stagnation_threshold: config.stagnation_threshold(),
            streak_reset: config.capability_streak_reset,
            recent_signatures: VecDeque::new(),
            last_signature: String::new(),
            repeat_count: 0,
            parse_error_streak: 0,
            capability_streak: 0,
            last_fingerprint: String::new(),
            last_failure_class: String::new(),
            best_score: i64::MIN,
            stagnation_streak: 0,
        }
    }

    /// Exceeding the wall-clock ceiling terminates the run as an engine
    /// budget failure, regardless of every other counter.
    pub fn check_wall_clock(&self) -> Option<StopSignal> {
        if self.wall_limit.is_zero() {
            return None;
        }
        let elapsed = self.started.elapsed();
        if elapsed < self.wall_limit {
            return None;
        }
        Some(StopSignal {
            status: RunStatus::Failed,
            reason: StopReason::Error,
            detail: format!(
                "stopped by wall time limit (elapsed={}s, limit={}s)",
                elapsed.as_secs(),
                self.wall_limit.as_secs()
            ),
        })
    }

    pub fn observe_parse_failure(&mut self) -> Option<StopSignal> {
        self.parse_error_streak += 1;
        if self.parse_error_streak < self.parse_error_threshold {
            return None;
        }
        Some(StopSignal {
            status: RunStatus::Failed,
            reason: StopReason::NoProgress,
            detail: format!(
                "stopped: repeated planner_parse_error (streak={})",
                self.parse_error_streak
            ),
        })
    }

    pub fn note_parse_success(&mut self) {
        self.parse_error_streak = 0;
    }

    /// Feed one completed iteration. Order of severity: repeated capability
    /// block, repetition window, then a stagnation recovery nudge.
    pub fn observe_iteration(
        &mut self,
        actions: &[Action],
        results: &[ActionResult],
        output: &str,
        objective_score: i64,
    ) -> Verdict {
        if let Some(stop) = self.observe_capability_failures(results) {
            return Verdict::Stop(stop);
        }
        if let Some(stop) = self.observe_signature(actions, results, output) {
            return Verdict::Stop(stop);
        }
        if self.observe_stagnation(objective_score) {
            return Verdict::Recover(
                "Stagnation detected: previous plans did not improve objective progress. \
                 Re-plan with a different strategy and execute actions that create or \
                 validate the required outputs."
                    .to_string(),
            );
        }
        Verdict::Continue
    }

    fn observe_capability_failures(&mut self, results: &[ActionResult]) -> Option<StopSignal> {
        let fingerprint = capability_fingerprint(results);
        if fingerprint.is_empty() {
            self.capability_streak = 0;
            self.last_fingerprint.clear();
            self.last_failure_class.clear();
            return None;
        }
        let class = failure_class(results);
        let same_streak = match self.streak_reset {
            CapabilityStreakReset::OnAnyChange => fingerprint == self.last_fingerprint,
            CapabilityStreakReset::OnClassChange => class == self.last_failure_class,
        };
        if same_streak && self.capability_streak > 0 {
            self.capability_streak += 1;
        } else {
            self.capability_streak = 1;
        }
        self.last_fingerprint = fingerprint.clone();
        self.last_failure_class = class;

        if self.capability_streak < self.capability_threshold {
            return None;
        }
        Some(StopSignal {
            status: RunStatus::Failed,
            reason: StopReason::NoProgress,
            detail: format!(
                "stopped: repeated capability block (streak={}, fingerprint={fingerprint})",
                self.capability_streak
            ),
        })
    }

    fn observe_signature(
        &mut self,
        actions: &[Action],
        results: &[ActionResult],
        output: &str,
    ) -> Option<StopSignal> {
        let signature = iteration_signature(actions, results, output);
        if signature == self.last_signature {
            self.repeat_count += 1;
        } else {
            self.repeat_count = 1;
            self.last_signature = signature.clone();
        }
        self.recent_signatures.push_back(signature.clone());
        while self.recent_signatures.len() as u32 > self.repeat_threshold {
            self.recent_signatures.pop_front();
        }

        if self.repeat_count < self.repeat_threshold {
            return None;
        }
        let action_names = if actions.is_empty() {
            "(none)".to_string()
        } else {
            actions
                .iter()
                .map(|action| action.name.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        Some(StopSignal {
            status: RunStatus::Failed,
            reason: StopReason::NoProgress,
            detail: format!(
                "stopped: no_progress detected repeated={} signature={} actions={action_names}",
                self.repeat_count,
                &signature[..12.min(signature.len())]
            ),
        })
    }

    fn observe_stagnation(&mut self, score: i64) -> bool {
        if score > self.best_score {
            self.best_score = score;
            self.stagnation_streak = 0;
            return false;
        }
        self.stagnation_streak += 1;
        self.stagnation_streak >= self.stagnation_threshold
    }

    pub fn stagnation_streak(&self) -> u32 {
        self.stagnation_streak
    }

    /// The window of most recent signatures, oldest first (diagnostics).
    pub fn recent_signatures(&self) -> Vec<String> {
        self.recent_signatures.iter().cloned().collect()
    }
}

/// Fingerprint of an iteration for the repetition window: the actions, a
/// compacted view of their results, and the truncated free-text output.
pub fn iteration_signature(actions: &[Action], results: &[ActionResult], output: &str) -> String {
    let compact_results: Vec<serde_json::Value> = results
        .iter()
        .map(|result| {
            serde_json::json!({
                "name": result.name,
                "ok": result.ok,
                "error": result
                    .error
                    .as_ref()
                    .map(|err| err.to_string())
                    .unwrap_or_default(),
                "output": head_chars(&result.output, 500),
            })
        })
        .collect();
    let payload = serde_json::json!({
        "actions": actions,
        "results": compact_results,
        "output": head_chars(output, 800),
    });
    let raw = serde_json::to_string(&payload).unwrap_or_default();
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Capability failures are the classified, non-transient failure family:
/// missing tools/modules and denied capabilities. Transient or
/// data-dependent failures produce no fingerprint, which resets the streak.
pub fn capability_fingerprint(results: &[ActionResult]) -> String {
    let mut signals = std::collections::BTreeSet::new();
    for result in results {
        if result.ok {
            continue;
        }
        let Some(error) = &result.error else {
            continue;
        };
        match error.kind {
            FailureKind::MissingModule | FailureKind::MissingBinary => {
                signals.insert(format!("{}:{}", error.kind, tail_token(&error.message)));
            }
            FailureKind::CapabilityDenied | FailureKind::PathEscape => {
                signals.insert(format!("{}:{}", error.kind, result.name));
            }
            _ => {}
        }
    }
    signals.into_iter().collect::<Vec<_>>().join(",")
}

fn failure_class(results: &[ActionResult]) -> String {
    let mut kinds = std::collections::BTreeSet::new();
    for result in results {
        if result.ok {
            continue;
        }
        if let Some(error) = &result.error {
            if matches!(
                error.kind,
                FailureKind::MissingModule
                    | FailureKind::MissingBinary
                    | FailureKind::CapabilityDenied
                    | FailureKind::PathEscape
            ) {
                kinds.insert(error.kind.as_str().to_string());
            }
        }
    }
    kinds.into_iter().collect::<Vec<_>>().join(",")
}

fn head_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Last path-ish token of an error message, e.g. the module or binary name.
fn tail_token(message: &str) -> String {
    message
        .rsplit(|c: char| c.is_whitespace() || c == ':')
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'))
        .to_ascii_lowercase()
}
