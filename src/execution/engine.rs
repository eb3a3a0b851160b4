//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    core::{
        context::{merge_env, process_env},
        CancelCause, EventContext, JobReason, JobResult, Outcome, PipelineDefinition, Verdict,
    },
    execution::{
        aggregate::{self, AggregateError, Decision, Eligibility, JobSummary},
        cache::StepCache,
        cancel::CancelToken,
        executor::{JobContext, JobExecutor},
        scheduler::{ExecutionScheduler, InstanceId, InstanceRecord, SchedulingStrategy},
    },
    report::PipelineReport,
    runner::StepRunner,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline: String,
        instances: usize,
    },
    JobStarted {
        job: String,
    },
    JobSkipped {
        job: String,
        reason: JobReason,
    },
    StepStarted {
        job: String,
        step: String,
    },
    StepRetrying {
        job: String,
        step: String,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    StepFinished {
        job: String,
        step: String,
        outcome: Outcome,
        duration_ms: u64,
    },
    JobFinished {
        job: String,
        outcome: Outcome,
        reason: JobReason,
    },
    PipelineFinished {
        run_id: Uuid,
        verdict: Verdict,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of execution events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.push(Arc::new(handler));
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let handlers: Vec<EventHandler> = match self.handlers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to resolve the pipeline verdict: {0}")]
    Aggregate(#[from] AggregateError),
}

/// Cancellation tokens for one run: the run itself plus one child token per
/// fail-fast matrix group
struct RunTokens {
    run: CancelToken,
    groups: Vec<Option<CancelToken>>,
}

impl RunTokens {
    fn for_job(&self, job_index: usize) -> &CancelToken {
        self.groups[job_index].as_ref().unwrap_or(&self.run)
    }
}

/// Writes a failed result if the worker stops without publishing one
struct CompletionGuard(Arc<InstanceRecord>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.0.is_terminal() {
            self.0.complete(JobResult {
                outcome: Outcome::Failure,
                reason: JobReason::Crashed,
                steps: Vec::new(),
                started_at: None,
                finished_at: Utc::now(),
            });
        }
    }
}

/// Main pipeline execution engine
pub struct ExecutionEngine<R> {
    runner: Arc<R>,
    strategy: SchedulingStrategy,
    cache: Arc<StepCache>,
    events: EventBus,
    cancel: CancelToken,
    base_env: BTreeMap<String, String>,
}

impl<R: StepRunner + 'static> ExecutionEngine<R> {
    pub fn new(runner: R, strategy: SchedulingStrategy) -> Self {
        Self::with_shared_runner(Arc::new(runner), strategy)
    }

    pub fn with_shared_runner(runner: Arc<R>, strategy: SchedulingStrategy) -> Self {
        Self {
            runner,
            strategy,
            cache: Arc::new(StepCache::new()),
            events: EventBus::default(),
            cancel: CancelToken::new(),
            base_env: process_env(),
        }
    }

    /// Replace the process environment used as the lowest env layer
    pub fn with_base_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    /// Token that aborts every run of this engine when cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &StepCache {
        &self.cache
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.add_handler(handler);
    }

    /// Execute the pipeline for one event and report the outcome
    pub async fn execute(
        &self,
        definition: &PipelineDefinition,
        event: &EventContext,
    ) -> Result<PipelineReport, EngineError> {
        let run_id = Uuid::new_v4();

        if !definition.is_triggered_by(event) {
            info!(
                "Pipeline {} is not triggered by '{}' on {}",
                definition.name, event.event_name, event.git_ref
            );
            let report = PipelineReport::not_triggered(run_id, &definition.name, event);
            self.events.emit(ExecutionEvent::PipelineFinished {
                run_id,
                verdict: report.verdict,
            });
            return Ok(report);
        }

        let started_at = Utc::now();
        let event = Arc::new(event.clone());
        let mut scheduler = ExecutionScheduler::new(definition, self.strategy);

        info!(
            "Starting pipeline {} ({}) with {} job instances",
            definition.name,
            run_id,
            scheduler.records().len()
        );
        self.events.emit(ExecutionEvent::PipelineStarted {
            run_id,
            pipeline: definition.name.clone(),
            instances: scheduler.records().len(),
        });

        for record in scheduler.records().iter().filter(|r| r.is_terminal()) {
            self.announce(record);
        }

        let run = self.cancel.child();
        let tokens = RunTokens {
            groups: definition
                .jobs
                .iter()
                .enumerate()
                .map(|(i, job)| {
                    (job.fail_fast && scheduler.instances_of(i).len() > 1).then(|| run.child())
                })
                .collect(),
            run,
        };

        let executor = JobExecutor::new(
            self.runner.clone(),
            self.cache.clone(),
            definition.settings.clone(),
            self.events.clone(),
        );
        let deadline = definition.settings.timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        let mut cancel_seen = false;
        let mut workers: JoinSet<InstanceId> = JoinSet::new();
        let mut in_flight: Vec<InstanceId> = Vec::new();

        loop {
            let ready = self.settle(definition, &event, &scheduler, &tokens);

            for (id, needs) in ready.into_iter().take(scheduler.capacity()) {
                let record = scheduler.record(id).clone();
                let template = &definition.jobs[record.job_index];
                let ctx = JobContext {
                    event: event.clone(),
                    env: merge_env([&self.base_env, &definition.env, &record.instance.env]),
                    needs,
                    job_timeout: template.timeout,
                    cancel: tokens.for_job(record.job_index).clone(),
                };

                scheduler.mark_dispatched(id);
                in_flight.push(id);
                debug!("Dispatching {} (layer {})", record.instance.display_name, record.layer);
                self.events.emit(ExecutionEvent::JobStarted {
                    job: record.instance.display_name.clone(),
                });

                let executor = executor.clone();
                workers.spawn(async move {
                    let guard = CompletionGuard(record.clone());
                    let result = executor.run(&record.instance, &ctx).await;
                    record.complete(result);
                    drop(guard);
                    id
                });
            }

            if workers.is_empty() {
                if scheduler.is_complete() {
                    break;
                }
                // Nothing running and nothing runnable: the rest can never start
                let stuck = scheduler.pending();
                error!("{} job instances can never become ready", stuck.len());
                for id in stuck {
                    self.finish(scheduler.record(id), JobResult::cancelled(CancelCause::Aborted));
                }
                continue;
            }

            tokio::select! {
                joined = workers.join_next() => {
                    if let Some(Err(err)) = joined {
                        error!("Job worker failed: {}", err);
                    }
                    let done: Vec<InstanceId> = in_flight
                        .iter()
                        .copied()
                        .filter(|&id| scheduler.record(id).is_terminal())
                        .collect();
                    in_flight.retain(|id| !done.contains(id));
                    for id in done {
                        scheduler.mark_finished(id);
                        self.on_finished(definition, scheduler.record(id), &tokens);
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !timed_out => {
                    warn!("Pipeline {} exceeded its timeout, cancelling", definition.name);
                    timed_out = true;
                    tokens.run.cancel(CancelCause::PipelineTimeout);
                }
                _ = tokens.run.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                }
            }
        }

        let summaries: BTreeMap<String, Option<JobSummary>> = definition
            .jobs
            .iter()
            .enumerate()
            .map(|(i, job)| {
                (
                    job.name.clone(),
                    scheduler.job_results(i).map(JobSummary::from_results),
                )
            })
            .collect();
        let resolution = aggregate::resolve_gate(definition.gate.as_ref(), &summaries, &event)?;

        let report = PipelineReport::new(
            run_id,
            &definition.name,
            &event,
            started_at,
            scheduler.records(),
            resolution,
        );

        info!(
            "Pipeline {} finished: {:?} in {}ms",
            definition.name,
            report.verdict,
            report.duration_ms()
        );
        self.events.emit(ExecutionEvent::PipelineFinished {
            run_id,
            verdict: report.verdict,
        });

        Ok(report)
    }

    /// Resolve every pending instance whose dependencies have settled.
    ///
    /// Instances are visited in layer order, so a skip decided here is seen
    /// by its dependents in the same pass. Returns the runnable instances
    /// with the outcomes of their needs.
    fn settle(
        &self,
        definition: &PipelineDefinition,
        event: &EventContext,
        scheduler: &ExecutionScheduler,
        tokens: &RunTokens,
    ) -> Vec<(InstanceId, BTreeMap<String, Outcome>)> {
        let mut ready = Vec::new();

        for id in scheduler.pending() {
            let record = scheduler.record(id);
            let template = &definition.jobs[record.job_index];

            if let Some(cause) = tokens.for_job(record.job_index).cause() {
                self.finish(record, JobResult::cancelled(cause));
                continue;
            }

            let needs = template.needs.iter().map(|name| {
                let summary = scheduler
                    .job_index(name)
                    .and_then(|i| scheduler.job_results(i))
                    .map(JobSummary::from_results);
                (name.as_str(), summary)
            });

            let upstream = match aggregate::eligibility(needs) {
                Eligibility::Blocked => continue,
                Eligibility::Settled(upstream) => upstream,
            };

            let matrix = record.instance.coordinate.to_map();
            match aggregate::decide(
                template,
                &upstream,
                event,
                &matrix,
                record.instance.runs_on.as_deref(),
            ) {
                Decision::Run => ready.push((id, upstream.outcomes)),
                Decision::Skip(reason) => {
                    debug!("Skipping {}: {:?}", record.instance.display_name, reason);
                    self.finish(record, JobResult::skipped(reason));
                }
            }
        }

        ready
    }

    /// Publish a result decided by the engine for an undispatched instance
    fn finish(&self, record: &InstanceRecord, result: JobResult) {
        if record.complete(result) {
            self.announce(record);
        }
    }

    fn announce(&self, record: &InstanceRecord) {
        let Some(result) = record.result() else {
            return;
        };
        let job = record.instance.display_name.clone();
        match result.outcome {
            Outcome::Skipped => self.events.emit(ExecutionEvent::JobSkipped {
                job,
                reason: result.reason.clone(),
            }),
            outcome => self.events.emit(ExecutionEvent::JobFinished {
                job,
                outcome,
                reason: result.reason.clone(),
            }),
        }
    }

    fn on_finished(&self, definition: &PipelineDefinition, record: &InstanceRecord, tokens: &RunTokens) {
        let Some(outcome) = record.outcome() else {
            return;
        };
        info!("Job {} finished: {}", record.instance.display_name, outcome);
        self.announce(record);

        if outcome == Outcome::Failure {
            if let Some(group) = &tokens.groups[record.job_index] {
                warn!(
                    "{} failed, cancelling the rest of '{}' (fail-fast)",
                    record.instance.display_name, definition.jobs[record.job_index].name
                );
                group.cancel(CancelCause::FailFast);
            }
        }
    }
}
