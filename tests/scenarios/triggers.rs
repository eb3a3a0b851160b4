//! Test: Triggers - which events start a run

use crate::helpers::*;
use ci_engine::Verdict;

const CI: &str = include_str!("../../demos/rust-analyzer-ci.yaml");

#[tokio::test]
async fn test_untriggered_push_runs_nothing() {
    let event = bors_push("master").with_repository("rust-lang/rust-analyzer");
    let result = run_with_mock(CI, MockRunner::new(), &event).await;

    assert!(!result.report.triggered);
    assert!(result.report.jobs.is_empty());
    assert!(result.runner.calls().is_empty());
    assert_eq!(result.report.verdict, Verdict::NoMatch);
    assert_eq!(result.report.exit_code(), 0);
}

#[tokio::test]
async fn test_pull_request_runs_jobs_but_matches_no_gate_branch() {
    let event = pull_request().with_repository("rust-lang/rust-analyzer");
    let result = run_with_mock(CI, MockRunner::new(), &event).await;

    assert!(result.report.triggered);
    assert!(result.runner.call_count("typos") == 1);
    // gate jobs only fire for the merge bot
    assert_eq!(result.report.verdict, Verdict::NoMatch);
}

#[tokio::test]
async fn test_branch_filters() {
    let yaml = r#"
on:
  push:
    branches: ["release/*"]
jobs:
  publish:
    steps: [ { run: publish } ]
"#;
    let result = run_with_mock(yaml, MockRunner::new(), &push("release/1.0")).await;
    assert!(result.report.triggered);
    assert_eq!(result.report.verdict, Verdict::Success);

    let result = run_with_mock(yaml, MockRunner::new(), &push("main")).await;
    assert!(!result.report.triggered);

    let result = run_with_mock(yaml, MockRunner::new(), &pull_request()).await;
    assert!(!result.report.triggered);
}
