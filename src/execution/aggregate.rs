//! Outcome aggregation
//!
//! Pure functions deciding whether a job may run given its dependencies,
//! folding job outcomes into a pipeline outcome, and resolving the gate
//! into the run's verdict.

use crate::core::{
    condition::{evaluate, should_run, EvalContext, UpstreamStatus},
    context::EventContext,
    Gate, JobReason, JobResult, JobTemplate, Outcome, PipelineOutcome, Verdict,
};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("Job '{0}' has not reached a terminal state")]
    NotTerminal(String),

    #[error("Unknown gating job '{0}'")]
    UnknownJob(String),
}

/// Terminal state of a job as seen by its dependents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    /// Combined outcome over all instances
    pub outcome: Outcome,
    /// Some instance was skipped because its own upstream failed
    pub upstream_failed: bool,
    /// Some instance was skipped because its own upstream was cancelled
    pub upstream_cancelled: bool,
}

impl JobSummary {
    pub fn from_results<'a, I: IntoIterator<Item = &'a JobResult>>(results: I) -> Self {
        let mut outcomes = Vec::new();
        let mut upstream_failed = false;
        let mut upstream_cancelled = false;
        for result in results {
            outcomes.push(result.outcome);
            match result.reason {
                JobReason::UpstreamFailed { .. } => upstream_failed = true,
                JobReason::UpstreamCancelled { .. } => upstream_cancelled = true,
                _ => {}
            }
        }
        Self {
            outcome: Outcome::combine(outcomes),
            upstream_failed,
            upstream_cancelled,
        }
    }

    fn counts_as_failed(&self) -> bool {
        self.outcome == Outcome::Failure || self.upstream_failed
    }

    fn counts_as_cancelled(&self) -> bool {
        self.outcome == Outcome::Cancelled || self.upstream_cancelled
    }
}

/// Settled view of a job's direct dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Upstream {
    pub status: UpstreamStatus,
    pub outcomes: BTreeMap<String, Outcome>,
    /// First dependency that failed, for attribution
    pub failed_job: Option<String>,
    pub cancelled_job: Option<String>,
}

/// Whether a job's dependencies have settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// Some dependency is still pending or running
    Blocked,
    Settled(Upstream),
}

/// Compute dependency eligibility from each dependency's summary, `None`
/// meaning the dependency has not finished yet
pub fn eligibility<'a, I>(needs: I) -> Eligibility
where
    I: IntoIterator<Item = (&'a str, Option<JobSummary>)>,
{
    let mut upstream = Upstream::default();
    for (name, summary) in needs {
        let Some(summary) = summary else {
            return Eligibility::Blocked;
        };
        if summary.counts_as_failed() {
            upstream.status.failed = true;
            upstream.failed_job.get_or_insert_with(|| name.to_string());
        }
        if summary.counts_as_cancelled() {
            upstream.status.cancelled = true;
            upstream.cancelled_job.get_or_insert_with(|| name.to_string());
        }
        upstream.outcomes.insert(name.to_string(), summary.outcome);
    }
    Eligibility::Settled(upstream)
}

/// Decision for a job instance whose dependencies have settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip(JobReason),
}

/// Evaluate the job's condition against its settled upstream
pub fn decide(
    job: &JobTemplate,
    upstream: &Upstream,
    event: &EventContext,
    matrix: &BTreeMap<String, String>,
    runner_os: Option<&str>,
) -> Decision {
    let ctx = EvalContext {
        event,
        matrix,
        runner_os,
        status: upstream.status,
        needs: &upstream.outcomes,
    };
    if should_run(job.condition.as_ref(), &ctx) {
        return Decision::Run;
    }

    let opted_in = job.condition.as_ref().is_some_and(|c| c.uses_status());
    let reason = match (&upstream.failed_job, &upstream.cancelled_job) {
        _ if opted_in => JobReason::ConditionFalse,
        (Some(job), _) => JobReason::UpstreamFailed { job: job.clone() },
        (None, Some(job)) => JobReason::UpstreamCancelled { job: job.clone() },
        (None, None) => JobReason::ConditionFalse,
    };
    Decision::Skip(reason)
}

/// Fold gating jobs into a pipeline outcome.
///
/// Success iff every gating job succeeded; skipped counts as failure here.
/// `None` in `outcomes` marks a job that has not finished.
pub fn aggregate<S: AsRef<str>>(
    gating: &[S],
    outcomes: &BTreeMap<String, Option<Outcome>>,
) -> Result<PipelineOutcome, AggregateError> {
    let mut result = PipelineOutcome::Success;
    for name in gating {
        let name = name.as_ref();
        match outcomes.get(name) {
            None => return Err(AggregateError::UnknownJob(name.to_string())),
            Some(None) => return Err(AggregateError::NotTerminal(name.to_string())),
            Some(Some(Outcome::Success)) => {}
            Some(Some(_)) => result = PipelineOutcome::Failure,
        }
    }
    Ok(result)
}

/// How the verdict was reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResolution {
    /// Gate name, or `None` for the implicit gate over all jobs that ran
    pub gate: Option<String>,
    pub verdict: Verdict,
    /// Jobs whose outcomes were aggregated
    pub members: Vec<String>,
}

/// Resolve the run's verdict from the gate and every job's summary
pub fn resolve_gate(
    gate: Option<&Gate>,
    jobs: &BTreeMap<String, Option<JobSummary>>,
    event: &EventContext,
) -> Result<GateResolution, AggregateError> {
    let outcomes: BTreeMap<String, Option<Outcome>> = jobs
        .iter()
        .map(|(name, summary)| (name.clone(), summary.as_ref().map(|s| s.outcome)))
        .collect();
    let outcome_of = |name: &str| -> Result<Outcome, AggregateError> {
        match outcomes.get(name) {
            None => Err(AggregateError::UnknownJob(name.to_string())),
            Some(None) => Err(AggregateError::NotTerminal(name.to_string())),
            Some(Some(outcome)) => Ok(*outcome),
        }
    };

    match gate {
        None => {
            let members: Vec<String> = outcomes
                .iter()
                .filter(|(_, outcome)| **outcome != Some(Outcome::Skipped))
                .map(|(name, _)| name.clone())
                .collect();
            let verdict = if members.is_empty() {
                Verdict::NoMatch
            } else {
                aggregate(&members, &outcomes)?.into()
            };
            Ok(GateResolution {
                gate: None,
                verdict,
                members,
            })
        }

        Some(Gate::Explicit {
            name,
            needs,
            condition,
        }) => {
            let summaries = needs
                .iter()
                .map(|n| {
                    jobs.get(n)
                        .cloned()
                        .ok_or_else(|| AggregateError::UnknownJob(n.clone()))
                        .map(|s| (n.as_str(), s))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let upstream = match eligibility(summaries) {
                Eligibility::Settled(upstream) => upstream,
                Eligibility::Blocked => {
                    let pending = needs
                        .iter()
                        .find(|n| matches!(outcomes.get(*n), Some(None)))
                        .cloned()
                        .unwrap_or_else(|| name.clone());
                    return Err(AggregateError::NotTerminal(pending));
                }
            };

            let matrix = BTreeMap::new();
            let ctx = EvalContext {
                event,
                matrix: &matrix,
                runner_os: None,
                status: upstream.status,
                needs: &upstream.outcomes,
            };
            let active = condition.as_ref().map_or(true, |c| evaluate(c, &ctx));
            let verdict = if active {
                aggregate(needs, &outcomes)?.into()
            } else {
                Verdict::NoMatch
            };
            Ok(GateResolution {
                gate: Some(name.clone()),
                verdict,
                members: needs.clone(),
            })
        }

        Some(Gate::Pair {
            success,
            failure,
            needs,
        }) => {
            let failure_outcome = outcome_of(failure)?;
            let success_outcome = outcome_of(success)?;

            let verdict = if failure_outcome != Outcome::Skipped {
                Verdict::Failure
            } else if success_outcome != Outcome::Skipped {
                match (success_outcome, aggregate(needs, &outcomes)?) {
                    (Outcome::Success, PipelineOutcome::Success) => Verdict::Success,
                    _ => Verdict::Failure,
                }
            } else {
                Verdict::NoMatch
            };
            Ok(GateResolution {
                gate: Some(success.clone()),
                verdict,
                members: needs.clone(),
            })
        }
    }
}
