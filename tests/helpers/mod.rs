//! Test utilities for ci-engine scenarios

use async_trait::async_trait;
use ci_engine::core::{EventContext, JobReason, Outcome, PipelineDefinition, StepAction};
use ci_engine::execution::{ExecutionEngine, SchedulingStrategy};
use ci_engine::runner::{RunnerError, StepInvocation, StepOutput, StepRunner};
use ci_engine::PipelineReport;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock runner scripted per command text
#[derive(Default)]
pub struct MockRunner {
    exit_codes: HashMap<String, i32>,
    /// Exit codes handed out in order before falling back to `exit_codes`
    sequences: Mutex<HashMap<String, Vec<i32>>>,
    delays: HashMap<String, Duration>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    calls: Mutex<Vec<String>>,
    envs: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a command exit with the given code
    pub fn exit(mut self, command: &str, code: i32) -> Self {
        self.exit_codes.insert(command.to_string(), code);
        self
    }

    /// Fail the first attempts of a command, then use the regular code
    pub fn exit_sequence(self, command: &str, codes: &[i32]) -> Self {
        if let Ok(mut sequences) = self.sequences.lock() {
            let mut codes = codes.to_vec();
            codes.reverse();
            sequences.insert(command.to_string(), codes);
        }
        self
    }

    pub fn delay(mut self, command: &str, delay: Duration) -> Self {
        self.delays.insert(command.to_string(), delay);
        self
    }

    /// Commands in the order they started
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| *c == command).count()
    }

    /// Environment the named command ran with (first invocation)
    pub fn env_of(&self, command: &str) -> Option<BTreeMap<String, String>> {
        self.envs
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c == command)
            .map(|(_, env)| env.clone())
    }

    fn next_exit_code(&self, command: &str) -> i32 {
        let scripted = self
            .sequences
            .lock()
            .unwrap()
            .get_mut(command)
            .and_then(|codes| codes.pop());
        scripted.unwrap_or_else(|| self.exit_codes.get(command).copied().unwrap_or(0))
    }
}

#[async_trait]
impl StepRunner for MockRunner {
    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutput, RunnerError> {
        let command = match &invocation.command {
            StepAction::Run(cmd) => cmd.clone(),
            StepAction::Uses { action, .. } => action.clone(),
        };
        self.calls.lock().unwrap().push(command.clone());
        self.envs
            .lock()
            .unwrap()
            .push((command.clone(), invocation.env.clone()));

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .delays
            .get(&command)
            .copied()
            .unwrap_or(Duration::from_millis(5));
        tokio::time::sleep(delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        Ok(StepOutput {
            exit_code: self.next_exit_code(&command),
            output: format!("ran {}", command),
        })
    }
}

/// Result of running a pipeline with a mock runner
pub struct PipelineTestResult {
    pub report: PipelineReport,
    pub runner: Arc<MockRunner>,
}

/// Parse a definition and run it against a mock runner
pub async fn run_with_mock(
    yaml: &str,
    runner: MockRunner,
    event: &EventContext,
) -> PipelineTestResult {
    run_with_strategy(yaml, runner, event, SchedulingStrategy::Configured).await
}

pub async fn run_with_strategy(
    yaml: &str,
    runner: MockRunner,
    event: &EventContext,
    strategy: SchedulingStrategy,
) -> PipelineTestResult {
    let definition = PipelineDefinition::from_yaml(yaml).expect("definition should be valid");
    let runner = Arc::new(runner);
    let engine = ExecutionEngine::with_shared_runner(runner.clone(), strategy)
        .with_base_env(BTreeMap::new());
    let report = engine
        .execute(&definition, event)
        .await
        .expect("run should produce a report");
    PipelineTestResult { report, runner }
}

pub fn push(branch: &str) -> EventContext {
    EventContext::new("push", branch, "dev")
}

/// Push by the merge bot
pub fn bors_push(branch: &str) -> EventContext {
    EventContext::new("push", branch, "bors")
}

pub fn pull_request() -> EventContext {
    EventContext::new("pull_request", "refs/pull/1/merge", "contributor")
}

pub fn assert_outcome(result: &PipelineTestResult, job: &str, expected: Outcome) {
    let report = result
        .report
        .job(job)
        .unwrap_or_else(|| panic!("job '{}' missing from report", job));
    assert_eq!(
        report.outcome, expected,
        "job '{}' ended {:?} ({:?}), expected {:?}",
        job, report.outcome, report.reason, expected
    );
}

pub fn assert_reason(result: &PipelineTestResult, job: &str, expected: JobReason) {
    let report = result
        .report
        .job(job)
        .unwrap_or_else(|| panic!("job '{}' missing from report", job));
    assert_eq!(report.reason, expected, "unexpected reason for '{}'", job);
}

/// Assert `first` started before `second`
pub fn assert_ran_before(result: &PipelineTestResult, first: &str, second: &str) {
    let calls = result.runner.calls();
    let a = calls.iter().position(|c| c == first);
    let b = calls.iter().position(|c| c == second);
    match (a, b) {
        (Some(a), Some(b)) => assert!(a < b, "'{}' should run before '{}': {:?}", first, second, calls),
        _ => panic!("both '{}' and '{}' should have run: {:?}", first, second, calls),
    }
}
