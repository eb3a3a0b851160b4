//! Job executor - runs the steps of one job instance in order

use crate::{
    core::{
        condition::{should_run, EvalContext, UpstreamStatus},
        context::{merge_env, EventContext},
        CancelCause, EngineSettings, JobInstance, JobResult, Outcome, StepReason, StepResult,
        StepTemplate,
    },
    execution::{
        cache::{fingerprint, StepCache},
        cancel::CancelToken,
        engine::{EventBus, ExecutionEvent},
    },
    runner::{RunnerError, StepInvocation, StepOutput, StepRunner},
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything a job instance needs besides its steps
#[derive(Debug, Clone)]
pub struct JobContext {
    pub event: Arc<EventContext>,
    /// Process, pipeline and job environment, already merged
    pub env: BTreeMap<String, String>,
    /// Outcomes of the jobs listed in `needs`
    pub needs: BTreeMap<String, Outcome>,
    /// Fallback step timeout set on the job
    pub job_timeout: Option<Duration>,
    pub cancel: CancelToken,
}

/// Result of one attempt at running a step
enum Attempt {
    Finished(StepOutput),
    Timeout(Duration),
    RunnerError(RunnerError),
    Cancelled(CancelCause),
}

/// Executes job instances against a step runner
pub struct JobExecutor<R> {
    runner: Arc<R>,
    cache: Arc<StepCache>,
    settings: EngineSettings,
    events: EventBus,
}

impl<R> Clone for JobExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            cache: self.cache.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
        }
    }
}

impl<R: StepRunner + 'static> JobExecutor<R> {
    pub fn new(runner: Arc<R>, cache: Arc<StepCache>, settings: EngineSettings, events: EventBus) -> Self {
        Self {
            runner,
            cache,
            settings,
            events,
        }
    }

    /// Run every step of the instance and derive the job result
    pub async fn run(&self, job: &JobInstance, ctx: &JobContext) -> JobResult {
        let started_at = Utc::now();
        let matrix = job.coordinate.to_map();
        let mut results: Vec<StepResult> = Vec::with_capacity(job.steps.len());
        let mut failed = false;

        info!("Running job {}", job.display_name);

        for step in &job.steps {
            if let Some(cause) = ctx.cancel.cause() {
                results.push(StepResult::not_run(
                    &step.name,
                    Outcome::Cancelled,
                    StepReason::Cancelled { cause },
                ));
                continue;
            }

            let opted_in = step.condition.as_ref().is_some_and(|c| c.uses_status());
            if failed && !opted_in {
                debug!("Skipping step '{}' after earlier failure", step.name);
                results.push(StepResult::not_run(&step.name, Outcome::Skipped, StepReason::Halted));
                continue;
            }

            let eval = EvalContext {
                event: &ctx.event,
                matrix: &matrix,
                runner_os: job.runs_on.as_deref(),
                // A cancelled job runs no further steps (checked above), so
                // `cancelled()` is always false at step level
                status: UpstreamStatus {
                    failed,
                    cancelled: false,
                },
                needs: &ctx.needs,
            };
            if !should_run(step.condition.as_ref(), &eval) {
                debug!("Condition false for step '{}'", step.name);
                results.push(StepResult::not_run(
                    &step.name,
                    Outcome::Skipped,
                    StepReason::ConditionFalse,
                ));
                continue;
            }

            self.events.emit(ExecutionEvent::StepStarted {
                job: job.display_name.clone(),
                step: step.name.clone(),
            });

            let result = self.run_step(job, step, ctx).await;

            self.events.emit(ExecutionEvent::StepFinished {
                job: job.display_name.clone(),
                step: step.name.clone(),
                outcome: result.outcome,
                duration_ms: result.duration_ms(),
            });

            if result.outcome == Outcome::Failure {
                if step.continue_on_error {
                    warn!(
                        "Step '{}' of {} failed; continuing because continue-on-error is set",
                        step.name, job.display_name
                    );
                } else {
                    failed = true;
                }
            }
            results.push(result);
        }

        JobResult::from_steps(results, started_at)
    }

    async fn run_step(&self, job: &JobInstance, step: &StepTemplate, ctx: &JobContext) -> StepResult {
        let invocation = StepInvocation {
            job: job.display_name.clone(),
            step: step.name.clone(),
            command: step.action.clone(),
            env: merge_env([&ctx.env, &step.env]),
            working_dir: step.working_directory.as_ref().map(PathBuf::from),
            runs_on: job.runs_on.clone(),
        };

        let mut result = match &step.cache_key {
            Some(key) => {
                let started_at = Utc::now();
                let fp = fingerprint(key, &step.action, &invocation.env);
                let lookup = self
                    .cache
                    .get_or_populate(&fp, || self.run_with_retries(step, &invocation, ctx));
                tokio::pin!(lookup);

                // Waiting on another job's populator must still honour this job's cancellation
                tokio::select! {
                    result = &mut lookup => result,
                    cause = ctx.cancel.cancelled() => {
                        match tokio::time::timeout(self.settings.grace_period, &mut lookup).await {
                            Ok(result) => result,
                            Err(_) => finished(
                                step,
                                started_at,
                                0,
                                Outcome::Cancelled,
                                StepReason::Cancelled { cause },
                                None,
                            ),
                        }
                    }
                }
            }
            None => self.run_with_retries(step, &invocation, ctx).await,
        };
        result.continue_on_error = step.continue_on_error;
        result
    }

    async fn run_with_retries(
        &self,
        step: &StepTemplate,
        invocation: &StepInvocation,
        ctx: &JobContext,
    ) -> StepResult {
        let started_at = Utc::now();
        let retry = self.settings.retry;
        let max_attempts = if step.network { retry.max_attempts.max(1) } else { 1 };
        let timeout = step
            .timeout
            .or(ctx.job_timeout)
            .unwrap_or(self.settings.step_timeout);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.attempt(invocation, timeout, &ctx.cancel).await;

            let retryable = match &outcome {
                Attempt::Finished(output) if output.success() => {
                    return finished(step, started_at, attempt, Outcome::Success, StepReason::Completed, Some(output));
                }
                Attempt::Cancelled(cause) => {
                    return finished(
                        step,
                        started_at,
                        attempt,
                        Outcome::Cancelled,
                        StepReason::Cancelled { cause: *cause },
                        None,
                    );
                }
                Attempt::RunnerError(RunnerError::UnsupportedAction(_)) => false,
                _ => true,
            };

            if !retryable || attempt >= max_attempts {
                return match outcome {
                    Attempt::Finished(output) => finished(
                        step,
                        started_at,
                        attempt,
                        Outcome::Failure,
                        StepReason::ExitCode {
                            code: output.exit_code,
                        },
                        Some(&output),
                    ),
                    Attempt::Timeout(after) => finished(
                        step,
                        started_at,
                        attempt,
                        Outcome::Failure,
                        StepReason::Timeout {
                            after_secs: after.as_secs(),
                        },
                        None,
                    ),
                    Attempt::RunnerError(err) => finished(
                        step,
                        started_at,
                        attempt,
                        Outcome::Failure,
                        StepReason::RunnerError {
                            message: err.to_string(),
                        },
                        None,
                    ),
                    Attempt::Cancelled(cause) => finished(
                        step,
                        started_at,
                        attempt,
                        Outcome::Cancelled,
                        StepReason::Cancelled { cause },
                        None,
                    ),
                };
            }

            let delay = retry.delay_for(attempt);
            warn!(
                "Step '{}' of {} failed on attempt {}/{}, retrying in {:?}",
                step.name, invocation.job, attempt, max_attempts, delay
            );
            self.events.emit(ExecutionEvent::StepRetrying {
                job: invocation.job.clone(),
                step: step.name.clone(),
                attempt: attempt + 1,
                max_attempts,
                delay,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cause = ctx.cancel.cancelled() => {
                    return finished(
                        step,
                        started_at,
                        attempt,
                        Outcome::Cancelled,
                        StepReason::Cancelled { cause },
                        None,
                    );
                }
            }
        }
    }

    /// One attempt under the step timeout. On cancellation the running step
    /// gets the grace period to finish before it is dropped.
    async fn attempt(&self, invocation: &StepInvocation, timeout: Duration, cancel: &CancelToken) -> Attempt {
        let run = tokio::time::timeout(timeout, self.runner.execute(invocation));
        tokio::pin!(run);

        let completed = tokio::select! {
            result = &mut run => result,
            cause = cancel.cancelled() => {
                debug!(
                    "Cancellation while '{}' is running; waiting up to {:?}",
                    invocation.step, self.settings.grace_period
                );
                match tokio::time::timeout(self.settings.grace_period, &mut run).await {
                    Ok(result) => result,
                    Err(_) => return Attempt::Cancelled(cause),
                }
            }
        };

        match completed {
            Ok(Ok(output)) => Attempt::Finished(output),
            Ok(Err(err)) => Attempt::RunnerError(err),
            Err(_) => Attempt::Timeout(timeout),
        }
    }
}

fn finished(
    step: &StepTemplate,
    started_at: DateTime<Utc>,
    attempts: u32,
    outcome: Outcome,
    reason: StepReason,
    output: Option<&StepOutput>,
) -> StepResult {
    StepResult {
        name: step.name.clone(),
        outcome,
        reason,
        attempts,
        exit_code: output.map(|o| o.exit_code),
        output: output.map(|o| o.output.clone()).unwrap_or_default(),
        continue_on_error: step.continue_on_error,
        started_at: Some(started_at),
        finished_at: Utc::now(),
    }
}
