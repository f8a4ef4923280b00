use std::collections::BTreeSet;
use taskmill::engine::contract::TaskContract;
use taskmill::engine::plan::ValidationCheck;
use taskmill::engine::validate::{
    collect_checks, evaluate_auto_complete, evaluate_checks, objective_progress,
};
use tempfile::tempdir;

fn produced(paths: &[&str]) -> BTreeSet<String> {
    paths.iter().map(|p| p.to_string()).collect()
}

#[test]
fn declared_checks_all_pass_against_the_workspace() {
    let temp = tempdir().expect("tempdir");
    std::fs::write(temp.path().join("result.txt"), "success").expect("write");

    let checks = vec![
        ValidationCheck::file_exists("result.txt"),
        ValidationCheck::file_non_empty("result.txt"),
        ValidationCheck::text_in_file("result.txt", "success"),
    ];
    let report = evaluate_checks(temp.path(), &checks, &[], &produced(&["result.txt"]));
    assert!(report.ok, "failures: {:?}", report.failures);
}

#[test]
fn each_unmet_check_is_reported() {
    let temp = tempdir().expect("tempdir");
    std::fs::write(temp.path().join("empty.txt"), "").expect("write");

    let checks = vec![
        ValidationCheck::file_exists("missing.txt"),
        ValidationCheck::file_non_empty("empty.txt"),
        ValidationCheck::text_in_file("empty.txt", "needle"),
        ValidationCheck::file_absent("empty.txt"),
    ];
    let report = evaluate_checks(temp.path(), &checks, &[], &BTreeSet::new());
    assert!(!report.ok);
    assert_eq!(report.failures.len(), 4);
    assert!(report.failures[0].contains("missing output file"));
    assert!(report.failures[1].contains("empty"));
    assert!(report.failures[3].contains("should be absent"));
}

#[test]
fn unknown_check_types_fail_instead_of_passing_silently() {
    let temp = tempdir().expect("tempdir");
    let check = ValidationCheck {
        check_type: "sha256_matches".to_string(),
        path: "result.txt".to_string(),
        ..ValidationCheck::default()
    };
    let report = evaluate_checks(temp.path(), &[check], &[], &BTreeSet::new());
    assert!(!report.ok);
    assert!(report.failures[0].contains("unknown validation type"));
}

#[test]
fn validation_paths_may_not_escape_the_workspace() {
    let temp = tempdir().expect("tempdir");
    let check = ValidationCheck::file_exists("../outside.txt");
    let report = evaluate_checks(temp.path(), &[check], &[], &BTreeSet::new());
    assert!(!report.ok);
    assert!(report.failures[0].contains("escapes workspace"));
}

#[test]
fn hollow_completion_is_caught_by_python_import_checks() {
    let temp = tempdir().expect("tempdir");
    std::fs::write(
        temp.path().join("chart.py"),
        "print('pandas would be used here')\n",
    )
    .expect("write");

    let contract = TaskContract::parse("pip install pandas and create chart.py");
    let required = contract.required_outputs.clone();
    let produced_set = produced(&["chart.py"]);
    let checks = collect_checks(&contract, &[], &required, &produced_set);
    assert!(checks
        .iter()
        .any(|check| check.check_type == "python_import"));

    let report = evaluate_checks(temp.path(), &checks, &required, &produced_set);
    assert!(!report.ok);
    assert!(report
        .failures
        .iter()
        .any(|failure| failure.contains("module not imported")));

    std::fs::write(temp.path().join("chart.py"), "import pandas as pd\n").expect("rewrite");
    let report = evaluate_checks(temp.path(), &checks, &required, &produced_set);
    assert!(report.ok, "failures: {:?}", report.failures);
}

#[test]
fn outputs_not_produced_in_this_run_block_completion() {
    let temp = tempdir().expect("tempdir");
    // The file exists on disk, but was not produced by this run.
    std::fs::write(temp.path().join("result.txt"), "stale").expect("write");

    let contract = TaskContract::parse("write the answer to result.txt");
    let checks = collect_checks(&contract, &[], &contract.required_outputs, &BTreeSet::new());
    let report = evaluate_checks(
        temp.path(),
        &checks,
        &contract.required_outputs,
        &BTreeSet::new(),
    );
    assert!(!report.ok);
    assert!(report
        .failures
        .iter()
        .any(|failure| failure.contains("not produced in this run")));
}

#[test]
fn json_key_checks_compare_values() {
    let temp = tempdir().expect("tempdir");
    std::fs::write(
        temp.path().join("meta.json"),
        r#"{"generated_by": "fetch.py", "count": 3}"#,
    )
    .expect("write");

    let exists = ValidationCheck {
        check_type: "json_key_exists".to_string(),
        path: "meta.json".to_string(),
        key: Some("generated_by".to_string()),
        ..ValidationCheck::default()
    };
    let equals_ok = ValidationCheck {
        check_type: "json_key_equals".to_string(),
        path: "meta.json".to_string(),
        key: Some("generated_by".to_string()),
        value: Some("fetch.py".to_string()),
        ..ValidationCheck::default()
    };
    let equals_bad = ValidationCheck {
        check_type: "json_key_equals".to_string(),
        path: "meta.json".to_string(),
        key: Some("count".to_string()),
        value: Some("4".to_string()),
        ..ValidationCheck::default()
    };

    let report = evaluate_checks(
        temp.path(),
        &[exists, equals_ok, equals_bad],
        &[],
        &BTreeSet::new(),
    );
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].contains("mismatch"));
}

#[test]
fn auto_complete_requires_in_run_production() {
    let temp = tempdir().expect("tempdir");
    let contract = TaskContract::parse("write totals to out.csv");

    // Nothing produced yet: probe reports unmet checks.
    let report =
        evaluate_auto_complete(temp.path(), &contract, &BTreeSet::new()).expect("has contract");
    assert!(!report.ok);

    std::fs::write(temp.path().join("out.csv"), "a,b\n1,2\n").expect("write");
    let report = evaluate_auto_complete(temp.path(), &contract, &produced(&["out.csv"]))
        .expect("has contract");
    assert!(report.ok, "failures: {:?}", report.failures);

    // Tasks with no inferable contract never auto-complete.
    let silent = TaskContract::parse("think about the answer");
    assert!(evaluate_auto_complete(temp.path(), &silent, &BTreeSet::new()).is_none());
}

#[test]
fn progress_snapshot_counts_and_scores() {
    let temp = tempdir().expect("tempdir");
    std::fs::write(temp.path().join("done.txt"), "content").expect("write");

    let required = vec!["done.txt".to_string(), "missing.txt".to_string()];
    let progress = objective_progress(temp.path(), &required, &produced(&["done.txt"]));
    assert_eq!(progress.required_total, 2);
    assert_eq!(progress.existing, 1);
    assert_eq!(progress.non_empty, 1);
    assert_eq!(progress.produced_required, 1);
    assert_eq!(progress.missing_paths, vec!["missing.txt".to_string()]);
    assert_eq!(progress.score(), 4 + 2 + 3 + 1);
}
