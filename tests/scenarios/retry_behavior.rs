//! Test: Retry behavior - network retries, continue-on-error and caching

use crate::helpers::*;
use ci_engine::core::{JobReason, Outcome};
use ci_engine::Verdict;

const RETRYING: &str = r#"
defaults:
  retry:
    max-attempts: 3
    delay-ms: 1
    backoff: fixed
jobs:
  fetch:
    steps:
      - name: Download crates
        run: cargo fetch
        network: true
      - name: Build
        run: cargo build
"#;

/// Network steps recover from transient failures
#[tokio::test]
async fn test_network_step_retries_until_success() {
    let runner = MockRunner::new().exit_sequence("cargo fetch", &[1, 1]);
    let result = run_with_mock(RETRYING, runner, &push("main")).await;

    assert_outcome(&result, "fetch", Outcome::Success);
    let step = &result.report.job("fetch").unwrap().steps[0];
    assert_eq!(step.attempts, 3);
    assert_eq!(result.runner.call_count("cargo fetch"), 3);
}

/// Retries are bounded and non-network steps are never retried
#[tokio::test]
async fn test_retries_are_bounded() {
    let runner = MockRunner::new().exit("cargo fetch", 1);
    let result = run_with_mock(RETRYING, runner, &push("main")).await;

    assert_eq!(result.runner.call_count("cargo fetch"), 3);
    assert_eq!(result.runner.call_count("cargo build"), 0);
    assert_reason(
        &result,
        "fetch",
        JobReason::StepFailed {
            step: "Download crates".to_string(),
            exit_code: 1,
        },
    );

    let runner = MockRunner::new().exit("cargo build", 1);
    let result = run_with_mock(RETRYING, runner, &push("main")).await;
    assert_eq!(result.runner.call_count("cargo build"), 1);
    assert_eq!(result.report.verdict, Verdict::Failure);
}

/// continue-on-error keeps the job green but is reported
#[tokio::test]
async fn test_continue_on_error_is_reported() {
    let yaml = r#"
jobs:
  check:
    steps:
      - run: cargo fmt --check
        continue-on-error: true
      - run: cargo check
"#;
    let runner = MockRunner::new().exit("cargo fmt --check", 1);
    let result = run_with_mock(yaml, runner, &push("main")).await;

    assert_outcome(&result, "check", Outcome::Success);
    assert_eq!(result.runner.call_count("cargo check"), 1);
    assert_eq!(result.report.tolerated_failures(), 1);
    assert_eq!(result.report.verdict, Verdict::Success);
}

/// Steps sharing a cache key run once per run
#[tokio::test]
async fn test_cached_step_runs_once() {
    let yaml = r#"
jobs:
  a:
    steps:
      - run: rustup toolchain install stable
        cache-key: toolchain-stable
      - run: build a
  b:
    steps:
      - run: rustup toolchain install stable
        cache-key: toolchain-stable
      - run: build b
"#;
    let result = run_with_mock(yaml, MockRunner::new(), &push("main")).await;

    assert_eq!(result.runner.call_count("rustup toolchain install stable"), 1);
    assert_outcome(&result, "a", Outcome::Success);
    assert_outcome(&result, "b", Outcome::Success);
}
