use crate::engine::contract::{requires_non_empty_output, TaskContract};
use crate::engine::plan::{dedup_checks, ValidationCheck};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Outcome of one validation pass. `ok` requires every check to pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveReport {
    pub ok: bool,
    pub failures: Vec<String>,
    pub checks: Vec<ValidationCheck>,
}

/// Read-only view of how far the declared objective has advanced; the
/// progress monitor compares scores across iterations to spot stagnation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectiveProgress {
    pub required_total: usize,
    pub existing: usize,
    pub non_empty: usize,
    pub produced_required: usize,
    pub produced: usize,
    pub missing_paths: Vec<String>,
    pub stale_paths: Vec<String>,
}

impl ObjectiveProgress {
    /// Weighted: required objective completion dominates side artifacts.
    pub fn score(&self) -> i64 {
        (self.produced_required as i64 * 4)
            + (self.existing as i64 * 2)
            + (self.non_empty as i64 * 3)
            + self.produced as i64
    }
}

/// Assemble every check for this run: declared plan validations first, then
/// checks synthesized from the task contract and produced files.
pub fn collect_checks(
    contract: &TaskContract,
    declared: &[ValidationCheck],
    required_outputs: &[String],
    produced_files: &BTreeSet<String>,
) -> Vec<ValidationCheck> {
    let mut checks: Vec<ValidationCheck> = declared.to_vec();

    for path in required_outputs {
        checks.push(ValidationCheck::file_exists(path.clone()));
        if requires_non_empty_output(path) {
            checks.push(ValidationCheck::file_non_empty(path.clone()));
        }
    }

    for path in &contract.required_absent {
        checks.push(ValidationCheck::file_absent(path.clone()));
    }

    // A produced source file that merely looks plausible is not enough: if
    // the task names a library, the file must actually reference it.
    if !contract.required_modules.is_empty() {
        let python_targets: Vec<&String> = required_outputs
            .iter()
            .filter(|path| path.ends_with(".py"))
            .filter(|path| produced_files.is_empty() || produced_files.contains(*path))
            .collect();
        for path in python_targets {
            for module in &contract.required_modules {
                checks.push(ValidationCheck::python_import(path.clone(), module.clone()));
            }
        }
    }

    if !contract.expected_text_markers.is_empty() {
        let text_targets: Vec<&String> = required_outputs
            .iter()
            .filter(|path| requires_non_empty_output(path))
            .collect();
        if text_targets.len() == 1 {
            let target = text_targets[0];
            for marker in &contract.expected_text_markers {
                checks.push(ValidationCheck::text_in_file(target.clone(), marker.clone()));
            }
        }
    }

    dedup_checks(checks)
}

/// Evaluate all checks against the workspace. Read-only and
/// order-independent; every failure is reported, not just the first.
pub fn evaluate_checks(
    workspace: &Path,
    checks: &[ValidationCheck],
    inferred_outputs: &[String],
    produced_files: &BTreeSet<String>,
) -> ObjectiveReport {
    let mut failures = Vec::new();

    for path in inferred_outputs {
        if !produced_files.contains(path) {
            failures.push(format!("inferred output not produced in this run: {path}"));
        }
    }

    for check in checks {
        evaluate_one(workspace, check, &mut failures);
    }

    ObjectiveReport {
        ok: failures.is_empty(),
        failures,
        checks: checks.to_vec(),
    }
}

fn evaluate_one(workspace: &Path, check: &ValidationCheck, failures: &mut Vec<String>) {
    let path_text = check.path.trim();
    if path_text.is_empty() {
        failures.push("validation missing path".to_string());
        return;
    }
    let Some(target) = resolve_within(workspace, path_text) else {
        failures.push(format!("path escapes workspace: {path_text}"));
        return;
    };

    match check.check_type.as_str() {
        "file_exists" => {
            if !target.is_file() {
                failures.push(format!("missing output file: {path_text}"));
            }
        }
        "file_absent" => {
            if target.exists() {
                failures.push(format!("file should be absent but still exists: {path_text}"));
            }
        }
        "file_non_empty" => {
            if !target.is_file() {
                failures.push(format!("missing output file: {path_text}"));
            } else if fs::metadata(&target).map(|m| m.len()).unwrap_or(0) == 0 {
                failures.push(format!("output file is empty: {path_text}"));
            }
        }
        "text_in_file" => {
            if !target.is_file() {
                failures.push(format!("missing output file: {path_text}"));
                return;
            }
            let needle = check.contains.as_deref().unwrap_or_default();
            let content = fs::read_to_string(&target).unwrap_or_default();
            if !needle.is_empty() && !content.contains(needle) {
                failures.push(format!("text not found in {path_text}: {needle}"));
            }
        }
        "python_import" => {
            if !target.is_file() {
                failures.push(format!("missing output file: {path_text}"));
                return;
            }
            let Some(module) = check.module.as_deref().filter(|m| !m.trim().is_empty()) else {
                failures.push(format!("validation missing module for {path_text}"));
                return;
            };
            let content = fs::read_to_string(&target).unwrap_or_default();
            if !python_file_imports_module(&content, module) {
                failures.push(format!("module not imported in {path_text}: {module}"));
            }
        }
        "json_key_exists" | "json_key_equals" => {
            if !target.is_file() {
                failures.push(format!("missing output file: {path_text}"));
                return;
            }
            let Some(key) = check.key.as_deref().filter(|k| !k.trim().is_empty()) else {
                failures.push(format!("validation missing key for {path_text}"));
                return;
            };
            let raw = fs::read_to_string(&target).unwrap_or_default();
            let Ok(payload) = serde_json::from_str::<serde_json::Value>(&raw) else {
                failures.push(format!("invalid json in {path_text}"));
                return;
            };
            let Some(object) = payload.as_object() else {
                failures.push(format!("json root is not object in {path_text}"));
                return;
            };
            let Some(actual) = object.get(key) else {
                failures.push(format!("json key not found in {path_text}: {key}"));
                return;
            };
            if check.check_type == "json_key_equals" {
                let expected = check.value.clone().unwrap_or_default();
                let actual_text = match actual {
                    serde_json::Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                if actual_text != expected {
                    failures.push(format!(
                        "json key mismatch in {path_text}: {key} expected={expected:?} actual={actual_text:?}"
                    ));
                }
            }
        }
        other => failures.push(format!("unknown validation type: {other}")),
    }
}

/// Auto-completion probe: when no `done` was claimed but every inferred
/// output exists, passes its checks, and was produced within this run, the
/// objective is considered achieved. Returns `None` when the task carries
/// no inferable contract.
pub fn evaluate_auto_complete(
    workspace: &Path,
    contract: &TaskContract,
    produced_files: &BTreeSet<String>,
) -> Option<ObjectiveReport> {
    if contract.required_outputs.is_empty() {
        return None;
    }
    let checks = collect_checks(contract, &[], &contract.required_outputs, produced_files);
    if checks.is_empty() {
        return None;
    }
    Some(evaluate_checks(
        workspace,
        &checks,
        &contract.required_outputs,
        produced_files,
    ))
}

pub fn objective_progress(
    workspace: &Path,
    required_outputs: &[String],
    produced_files: &BTreeSet<String>,
) -> ObjectiveProgress {
    let mut progress = ObjectiveProgress {
        required_total: required_outputs.len(),
        produced: produced_files.len(),
        ..ObjectiveProgress::default()
    };

    for path in required_outputs {
        let Some(target) = resolve_within(workspace, path) else {
            progress.missing_paths.push(path.clone());
            continue;
        };
        if !target.is_file() {
            progress.missing_paths.push(path.clone());
            continue;
        }
        progress.existing += 1;
        if produced_files.contains(path) {
            progress.produced_required += 1;
        } else {
            progress.stale_paths.push(path.clone());
        }
        if !requires_non_empty_output(path)
            || fs::metadata(&target).map(|m| m.len()).unwrap_or(0) > 0
        {
            progress.non_empty += 1;
        } else {
            progress.missing_paths.push(path.clone());
        }
    }
    progress
}

fn python_file_imports_module(source: &str, module: &str) -> bool {
    let target = module.trim().to_ascii_lowercase();
    if target.is_empty() {
        return false;
    }
    for line in source.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("import ") {
            for part in rest.split(',') {
                let name = part.trim().split_whitespace().next().unwrap_or_default();
                if name.split('.').next().unwrap_or_default().to_ascii_lowercase() == target {
                    return true;
                }
            }
        } else if let Some(rest) = line.strip_prefix("from ") {
            let name = rest.split_whitespace().next().unwrap_or_default();
            if name.split('.').next().unwrap_or_default().to_ascii_lowercase() == target {
                return true;
            }
        }
    }
    false
}

/// Lexically confine a check path to the workspace; validations never read
/// outside it.
fn resolve_within(workspace: &Path, value: &str) -> Option<PathBuf> {
    let raw = Path::new(value.trim());
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        workspace.join(raw)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => normalized.push(component.as_os_str()),
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
        }
    }
    if normalized.starts_with(workspace) {
        Some(normalized)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_import_detection_handles_both_forms() {
        assert!(python_file_imports_module("import pandas as pd\n", "pandas"));
        assert!(python_file_imports_module(
            "from numpy.linalg import norm\n",
            "numpy"
        ));
        assert!(python_file_imports_module("import os, sys\n", "sys"));
        assert!(!python_file_imports_module("print('pandas')\n", "pandas"));
    }

    #[test]
    fn progress_score_rewards_required_completion() {
        let empty = ObjectiveProgress::default();
        assert_eq!(empty.score(), 0);
        let progress = ObjectiveProgress {
            required_total: 1,
            existing: 1,
            non_empty: 1,
            produced_required: 1,
            produced: 1,
            ..ObjectiveProgress::default()
        };
        assert_eq!(progress.score(), 4 + 2 + 3 + 1);
    }
}
