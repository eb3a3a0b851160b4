//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal outcome of a step or a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Skipped,
    Cancelled,
}

pub type StepOutcome = Outcome;
pub type JobOutcome = Outcome;

impl Outcome {
    /// Lowercase name, as compared against `needs.<job>.result`
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Skipped => "skipped",
            Outcome::Cancelled => "cancelled",
        }
    }

    /// Fold the outcomes of all instances of a matrix job into one.
    ///
    /// Failure dominates, then cancellation; a job is skipped only if every
    /// instance was skipped (or it has none).
    pub fn combine<I: IntoIterator<Item = Outcome>>(outcomes: I) -> Outcome {
        let mut any = false;
        let mut all_skipped = true;
        let mut cancelled = false;
        for outcome in outcomes {
            any = true;
            match outcome {
                Outcome::Failure => return Outcome::Failure,
                Outcome::Cancelled => cancelled = true,
                Outcome::Success => all_skipped = false,
                Outcome::Skipped => {}
            }
        }
        if cancelled {
            Outcome::Cancelled
        } else if !any || all_skipped {
            Outcome::Skipped
        } else {
            Outcome::Success
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why something was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    /// Manual or signal-driven abort of the whole run
    Aborted,
    /// The pipeline-wide timeout elapsed
    PipelineTimeout,
    /// A sibling matrix instance failed under `fail-fast`
    FailFast,
}

/// Attribution for a step's terminal outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepReason {
    Completed,
    ExitCode { code: i32 },
    Timeout { after_secs: u64 },
    RunnerError { message: String },
    Cancelled { cause: CancelCause },
    ConditionFalse,
    /// An earlier required step failed
    Halted,
    /// Result reused from the shared step cache
    CacheRestored,
}

/// Attribution for a job's terminal outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobReason {
    Completed,
    StepFailed { step: String, exit_code: i32 },
    Timeout { step: String },
    RunnerError { step: String },
    Cancelled { cause: CancelCause },
    ConditionFalse,
    UpstreamFailed { job: String },
    UpstreamCancelled { job: String },
    EmptyMatrix,
    /// The worker running the job stopped without publishing a result
    Crashed,
}

impl JobReason {
    /// Derive the job reason from the step that decided a failure
    pub fn from_failed_step(step: &StepResult) -> Self {
        match &step.reason {
            StepReason::Timeout { .. } => JobReason::Timeout {
                step: step.name.clone(),
            },
            StepReason::RunnerError { .. } => JobReason::RunnerError {
                step: step.name.clone(),
            },
            StepReason::ExitCode { code } => JobReason::StepFailed {
                step: step.name.clone(),
                exit_code: *code,
            },
            _ => JobReason::StepFailed {
                step: step.name.clone(),
                exit_code: step.exit_code.unwrap_or(-1),
            },
        }
    }
}

/// Terminal record of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub outcome: StepOutcome,
    pub reason: StepReason,
    pub attempts: u32,
    pub exit_code: Option<i32>,
    /// Tail of the captured output
    pub output: String,
    pub continue_on_error: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    /// A step that never started
    pub fn not_run(name: &str, outcome: StepOutcome, reason: StepReason) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            reason,
            attempts: 0,
            exit_code: None,
            output: String::new(),
            continue_on_error: false,
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.started_at
            .and_then(|s| (self.finished_at - s).to_std().ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// A failure that was tolerated by `continue-on-error`
    pub fn is_tolerated_failure(&self) -> bool {
        self.continue_on_error && self.outcome == Outcome::Failure
    }
}

/// Terminal record of one job instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub outcome: JobOutcome,
    pub reason: JobReason,
    pub steps: Vec<StepResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    /// A job that never ran because of its condition or its dependencies
    pub fn skipped(reason: JobReason) -> Self {
        Self {
            outcome: Outcome::Skipped,
            reason,
            steps: Vec::new(),
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    /// A job cancelled before it was dispatched
    pub fn cancelled(cause: CancelCause) -> Self {
        Self {
            outcome: Outcome::Cancelled,
            reason: JobReason::Cancelled { cause },
            steps: Vec::new(),
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    /// Derive the job outcome from its step results.
    ///
    /// Success iff every required step succeeded (or was skipped by its own
    /// condition) and none was cancelled.
    pub fn from_steps(steps: Vec<StepResult>, started_at: DateTime<Utc>) -> Self {
        let cancelled = steps.iter().find_map(|s| match s.reason {
            StepReason::Cancelled { cause } => Some(cause),
            _ => None,
        });
        let failed = steps
            .iter()
            .find(|s| s.outcome == Outcome::Failure && !s.continue_on_error);

        let (outcome, reason) = if let Some(cause) = cancelled {
            (Outcome::Cancelled, JobReason::Cancelled { cause })
        } else if let Some(step) = failed {
            (Outcome::Failure, JobReason::from_failed_step(step))
        } else {
            (Outcome::Success, JobReason::Completed)
        };

        Self {
            outcome,
            reason,
            steps,
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }

    pub fn tolerated_failures(&self) -> usize {
        self.steps.iter().filter(|s| s.is_tolerated_failure()).count()
    }
}

/// Aggregated pass/fail signal over a set of gating jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineOutcome {
    Success,
    Failure,
}

/// Final verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    Failure,
    /// No gate matched this event; the run was a no-op
    NoMatch,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Success => "success",
            Verdict::Failure => "failure",
            Verdict::NoMatch => "no_match",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Verdict::Success),
            "failure" => Some(Verdict::Failure),
            "no_match" => Some(Verdict::NoMatch),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Success | Verdict::NoMatch => 0,
            Verdict::Failure => 1,
        }
    }
}

impl From<PipelineOutcome> for Verdict {
    fn from(outcome: PipelineOutcome) -> Self {
        match outcome {
            PipelineOutcome::Success => Verdict::Success,
            PipelineOutcome::Failure => Verdict::Failure,
        }
    }
}
