//! Test: Dependencies - ordering, propagation and status functions

use crate::helpers::*;
use ci_engine::core::{JobReason, Outcome};
use ci_engine::execution::SchedulingStrategy;
use ci_engine::Verdict;

const DIAMOND: &str = r#"
jobs:
  checkout:
    steps: [ { run: checkout } ]
  unit:
    needs: checkout
    steps: [ { run: unit } ]
  integration:
    needs: checkout
    steps: [ { run: integration } ]
  package:
    needs: [unit, integration]
    steps: [ { run: package } ]
"#;

/// Dependents start only after every dependency finished
#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let result = run_with_mock(DIAMOND, MockRunner::new(), &push("main")).await;

    assert_eq!(result.report.verdict, Verdict::Success);
    assert_ran_before(&result, "checkout", "unit");
    assert_ran_before(&result, "checkout", "integration");
    assert_ran_before(&result, "unit", "package");
    assert_ran_before(&result, "integration", "package");
    assert_eq!(result.report.job("package").unwrap().layer, 2);
}

/// Sequential scheduling produces the same outcome
#[tokio::test]
async fn test_sequential_strategy_matches_parallel() {
    let runner = MockRunner::new().exit("integration", 2);
    let sequential = run_with_strategy(DIAMOND, runner, &push("main"), SchedulingStrategy::Sequential).await;
    let runner = MockRunner::new().exit("integration", 2);
    let parallel = run_with_strategy(DIAMOND, runner, &push("main"), SchedulingStrategy::Parallel).await;

    for name in ["checkout", "unit", "integration", "package"] {
        assert_eq!(
            sequential.report.job(name).unwrap().outcome,
            parallel.report.job(name).unwrap().outcome,
            "outcome of '{}' differs",
            name
        );
    }
    assert_eq!(sequential.runner.max_active.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(sequential.report.verdict, parallel.report.verdict);
}

/// A failure skips dependents transitively, but not unrelated jobs
#[tokio::test]
async fn test_failure_propagates_downstream() {
    let runner = MockRunner::new().exit("unit", 1);
    let result = run_with_mock(DIAMOND, runner, &push("main")).await;

    assert_outcome(&result, "unit", Outcome::Failure);
    assert_outcome(&result, "integration", Outcome::Success);
    assert_outcome(&result, "package", Outcome::Skipped);
    assert_reason(
        &result,
        "package",
        JobReason::UpstreamFailed {
            job: "unit".to_string(),
        },
    );
    assert_eq!(result.runner.call_count("package"), 0);
    assert_eq!(result.report.verdict, Verdict::Failure);
}

/// always() and needs.<job>.result let cleanup and reporting jobs run
#[tokio::test]
async fn test_status_functions_opt_in_after_failure() {
    let yaml = r#"
jobs:
  test:
    steps: [ { run: test } ]
  publish:
    needs: test
    steps: [ { run: publish } ]
  cleanup:
    needs: publish
    if: always()
    steps: [ { run: cleanup } ]
  report-failure:
    needs: test
    if: needs.test.result == 'failure'
    steps: [ { run: report } ]
  celebrate:
    needs: test
    if: needs.test.result == 'success'
    steps: [ { run: celebrate } ]
"#;
    let runner = MockRunner::new().exit("test", 1);
    let result = run_with_mock(yaml, runner, &push("main")).await;

    assert_outcome(&result, "publish", Outcome::Skipped);
    assert_outcome(&result, "cleanup", Outcome::Success);
    // needs.<job>.result alone does not opt into running after a failure
    assert_outcome(&result, "report-failure", Outcome::Skipped);
    assert_outcome(&result, "celebrate", Outcome::Skipped);
    assert_ran_before(&result, "test", "cleanup");
}

/// A job condition with status functions that is false is a plain
/// condition skip, not an upstream failure
#[tokio::test]
async fn test_success_only_job_skipped_by_condition() {
    let yaml = r#"
jobs:
  build:
    steps: [ { run: build } ]
  deploy:
    needs: build
    if: success() && github.ref_name == 'main'
    steps: [ { run: deploy } ]
"#;
    let result = run_with_mock(yaml, MockRunner::new().exit("build", 1), &push("main")).await;
    assert_reason(&result, "deploy", JobReason::ConditionFalse);

    let result = run_with_mock(yaml, MockRunner::new(), &push("feature")).await;
    assert_outcome(&result, "build", Outcome::Success);
    assert_reason(&result, "deploy", JobReason::ConditionFalse);

    let result = run_with_mock(yaml, MockRunner::new(), &push("main")).await;
    assert_outcome(&result, "deploy", Outcome::Success);
}

/// Environment layers: pipeline < job < step
#[tokio::test]
async fn test_environment_is_layered() {
    let yaml = r#"
env:
  CI: 1
  LEVEL: pipeline
jobs:
  build:
    env:
      LEVEL: job
      TARGET: x86_64
    steps:
      - run: show
        env:
          TARGET: aarch64
"#;
    let result = run_with_mock(yaml, MockRunner::new(), &push("main")).await;
    let env = result.runner.env_of("show").unwrap();

    assert_eq!(env.get("CI").map(String::as_str), Some("1"));
    assert_eq!(env.get("LEVEL").map(String::as_str), Some("job"));
    assert_eq!(env.get("TARGET").map(String::as_str), Some("aarch64"));
}
