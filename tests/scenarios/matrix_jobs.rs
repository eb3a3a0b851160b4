//! Test: Matrix jobs - expansion, substitution and fail-fast

use crate::helpers::*;
use ci_engine::core::{CancelCause, JobReason, Outcome};
use ci_engine::Verdict;
use std::time::Duration;

/// include/exclude shape the instance set and values reach the steps
#[tokio::test]
async fn test_matrix_expansion_and_substitution() {
    let yaml = r#"
jobs:
  cross:
    runs-on: ${{ matrix.os }}
    strategy:
      matrix:
        os: [linux, windows]
        toolchain: [stable, nightly]
        exclude:
          - os: windows
            toolchain: nightly
        include:
          - os: macos
            toolchain: stable
    steps:
      - name: Build with ${{ matrix.toolchain }}
        run: cargo +${{ matrix.toolchain }} build
        env:
          HOST: ${{ matrix.os }}
"#;
    let result = run_with_mock(yaml, MockRunner::new(), &push("main")).await;

    let names: Vec<&str> = result
        .report
        .instances_of("cross")
        .map(|j| j.display_name.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "cross (os=linux, toolchain=stable)",
            "cross (os=linux, toolchain=nightly)",
            "cross (os=windows, toolchain=stable)",
            "cross (os=macos, toolchain=stable)",
        ]
    );
    assert_eq!(result.runner.call_count("cargo +stable build"), 3);
    assert_eq!(result.runner.call_count("cargo +nightly build"), 1);

    let job = result.report.job("cross (os=macos, toolchain=stable)").unwrap();
    assert_eq!(job.steps[0].name, "Build with stable");
    assert_eq!(job.matrix.get("os"), Some("macos"));
    assert_eq!(result.report.verdict, Verdict::Success);
}

/// Dependents wait for every instance of a matrix job
#[tokio::test]
async fn test_dependents_wait_for_all_instances() {
    let yaml = r#"
jobs:
  test:
    strategy:
      fail-fast: false
      matrix:
        shard: [1, 2, 3]
    steps: [ { run: "test shard ${{ matrix.shard }}" } ]
  merge-coverage:
    needs: test
    steps: [ { run: merge } ]
"#;
    let runner = MockRunner::new().delay("test shard 3", Duration::from_millis(60));
    let result = run_with_mock(yaml, runner, &push("main")).await;

    assert_ran_before(&result, "test shard 3", "merge");
    assert_outcome(&result, "merge-coverage", Outcome::Success);

    let runner = MockRunner::new().exit("test shard 2", 1);
    let result = run_with_mock(yaml, runner, &push("main")).await;
    assert_outcome(&result, "test (shard=1)", Outcome::Success);
    assert_outcome(&result, "test (shard=3)", Outcome::Success);
    assert_reason(
        &result,
        "merge-coverage",
        JobReason::UpstreamFailed {
            job: "test".to_string(),
        },
    );
}

/// With fail-fast on, one failing instance cancels its siblings
#[tokio::test]
async fn test_fail_fast_cancels_siblings() {
    let yaml = r#"
defaults:
  concurrency: 4
  grace-period-secs: 0
jobs:
  test:
    strategy:
      matrix:
        os: [fast, slow-a, slow-b]
    steps: [ { run: "test ${{ matrix.os }}" } ]
  lint:
    steps: [ { run: lint } ]
"#;
    let runner = MockRunner::new()
        .exit("test fast", 1)
        .delay("test slow-a", Duration::from_secs(10))
        .delay("test slow-b", Duration::from_secs(10));
    let started = std::time::Instant::now();
    let result = run_with_mock(yaml, runner, &push("main")).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_outcome(&result, "test (os=fast)", Outcome::Failure);
    for sibling in ["test (os=slow-a)", "test (os=slow-b)"] {
        assert_outcome(&result, sibling, Outcome::Cancelled);
        assert_reason(
            &result,
            sibling,
            JobReason::Cancelled {
                cause: CancelCause::FailFast,
            },
        );
    }
    // other jobs are not part of the fail-fast group
    assert_outcome(&result, "lint", Outcome::Success);
    assert_eq!(result.report.verdict, Verdict::Failure);
}

/// Matrix conditions decide per instance
#[tokio::test]
async fn test_matrix_condition_per_instance() {
    let yaml = r#"
jobs:
  docs:
    if: matrix.os == 'linux'
    strategy:
      matrix:
        os: [linux, windows]
    steps: [ { run: "docs ${{ matrix.os }}" } ]
"#;
    let result = run_with_mock(yaml, MockRunner::new(), &push("main")).await;

    assert_outcome(&result, "docs (os=linux)", Outcome::Success);
    assert_outcome(&result, "docs (os=windows)", Outcome::Skipped);
    assert_eq!(result.runner.calls(), vec!["docs linux"]);
    assert_eq!(result.report.verdict, Verdict::Success);
}

/// An axis without values yields no instances; the job is skipped
#[tokio::test]
async fn test_empty_matrix_is_skipped() {
    let yaml = r#"
jobs:
  nothing:
    strategy:
      matrix:
        os: []
    steps: [ { run: never } ]
  after:
    needs: nothing
    steps: [ { run: after } ]
"#;
    let result = run_with_mock(yaml, MockRunner::new(), &push("main")).await;

    assert_reason(&result, "nothing", JobReason::EmptyMatrix);
    assert_outcome(&result, "after", Outcome::Success);
    assert_eq!(result.runner.call_count("never"), 0);
}
