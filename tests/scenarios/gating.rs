//! Test: Gating - success/failure gate pairs and explicit gate blocks

use crate::helpers::*;
use ci_engine::core::{EventContext, JobReason, Outcome};
use ci_engine::Verdict;

const CI: &str = include_str!("../../demos/rust-analyzer-ci.yaml");

fn bors_on_auto() -> EventContext {
    bors_push("auto").with_repository("rust-lang/rust-analyzer")
}

/// Everything passes on a merge-queue push: end-success decides the verdict
#[tokio::test]
async fn test_merge_queue_success() {
    let result = run_with_mock(CI, MockRunner::new(), &bors_on_auto()).await;

    assert_eq!(result.report.verdict, Verdict::Success);
    assert_eq!(result.report.gate.as_deref(), Some("end-success"));
    assert_outcome(&result, "end-success", Outcome::Success);
    assert_outcome(&result, "end-failure", Outcome::Skipped);
    assert_reason(&result, "end-failure", JobReason::ConditionFalse);
    assert_eq!(result.report.exit_code(), 0);

    // rust x3, rust-cross x3, typescript, typo-check, end-success, end-failure
    assert_eq!(result.report.jobs.len(), 10);
    assert_eq!(result.report.instances_of("rust").count(), 3);
}

/// `rust` fails: end-failure runs, end-success is skipped, the run fails
#[tokio::test]
async fn test_merge_queue_failure_runs_failure_branch() {
    let runner = MockRunner::new().exit("cargo test -- --quiet", 101);
    let result = run_with_mock(CI, runner, &bors_on_auto()).await;

    for instance in result.report.instances_of("rust") {
        assert_eq!(instance.outcome, Outcome::Failure);
        assert_eq!(
            instance.reason,
            JobReason::StepFailed {
                step: "Run tests".to_string(),
                exit_code: 101
            }
        );
    }
    assert_outcome(&result, "typescript", Outcome::Success);
    assert_outcome(&result, "end-failure", Outcome::Success);
    assert_outcome(&result, "end-success", Outcome::Skipped);
    assert_eq!(result.report.verdict, Verdict::Failure);
    assert_eq!(result.report.exit_code(), 1);
    assert_eq!(result.runner.call_count("exit 1"), 1);
    assert_eq!(result.runner.call_count("exit 0"), 0);
}

/// fail-fast is off for `rust`: one failing OS does not cancel the others
#[tokio::test]
async fn test_matrix_without_fail_fast_keeps_running() {
    let runner = MockRunner::new().exit("cargo codegen --check", 1);
    let result = run_with_mock(CI, runner, &bors_on_auto()).await;

    assert_outcome(&result, "rust (os=ubuntu-latest)", Outcome::Failure);
    assert_outcome(&result, "rust (os=windows-latest)", Outcome::Success);
    assert_outcome(&result, "rust (os=macos-latest)", Outcome::Success);
    assert_eq!(result.report.verdict, Verdict::Failure);
}

/// A push not made by the merge bot matches neither gate branch
#[tokio::test]
async fn test_non_bors_push_is_no_match() {
    let event = push("auto").with_repository("rust-lang/rust-analyzer");
    let result = run_with_mock(CI, MockRunner::new(), &event).await;

    assert_outcome(&result, "end-success", Outcome::Skipped);
    assert_outcome(&result, "end-failure", Outcome::Skipped);
    assert_outcome(&result, "typescript", Outcome::Success);
    assert_eq!(result.report.verdict, Verdict::NoMatch);
    assert_eq!(result.report.exit_code(), 0);
}

/// Explicit gate whose condition is false for the event
#[tokio::test]
async fn test_explicit_gate_no_match() {
    let yaml = r#"
name: release
gate:
  name: publish
  needs: [build]
  if: github.ref_name == 'release'
jobs:
  build:
    steps: [ { run: cargo build --release } ]
  docs:
    steps: [ { run: cargo doc } ]
"#;
    let result = run_with_mock(yaml, MockRunner::new(), &push("main")).await;

    assert_outcome(&result, "build", Outcome::Success);
    assert_eq!(result.report.gate.as_deref(), Some("publish"));
    assert_eq!(result.report.verdict, Verdict::NoMatch);

    let result = run_with_mock(yaml, MockRunner::new().exit("cargo build --release", 1), &push("release")).await;
    assert_eq!(result.report.verdict, Verdict::Failure);
    assert_eq!(result.report.gate_members, vec!["build"]);
}

/// Only the gate's needs decide the verdict
#[tokio::test]
async fn test_explicit_gate_ignores_other_jobs() {
    let yaml = r#"
gate:
  needs: [test]
jobs:
  test:
    steps: [ { run: cargo test } ]
  benchmarks:
    steps: [ { run: cargo bench } ]
"#;
    let runner = MockRunner::new().exit("cargo bench", 1);
    let result = run_with_mock(yaml, runner, &push("main")).await;

    assert_outcome(&result, "benchmarks", Outcome::Failure);
    assert_eq!(result.report.verdict, Verdict::Success);
}

/// Without a gate every job that ran counts
#[tokio::test]
async fn test_implicit_gate_over_jobs_that_ran() {
    let yaml = r#"
jobs:
  lint:
    steps: [ { run: cargo clippy } ]
  nightly:
    if: github.event_name == 'schedule'
    steps: [ { run: cargo +nightly test } ]
"#;
    let result = run_with_mock(yaml, MockRunner::new(), &push("main")).await;
    assert_outcome(&result, "nightly", Outcome::Skipped);
    assert_eq!(result.report.gate, None);
    assert_eq!(result.report.gate_members, vec!["lint"]);
    assert_eq!(result.report.verdict, Verdict::Success);

    let result = run_with_mock(yaml, MockRunner::new().exit("cargo clippy", 1), &push("main")).await;
    assert_eq!(result.report.verdict, Verdict::Failure);
}
