//! Pipeline result reporting

use crate::core::{
    matrix::Coordinate, EventContext, JobReason, Outcome, StepResult, Verdict,
};
use crate::execution::{aggregate::GateResolution, scheduler::InstanceRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Final record of one job instance
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub display_name: String,
    pub matrix: Coordinate,
    pub layer: usize,
    pub outcome: Outcome,
    pub reason: JobReason,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Failed steps tolerated by `continue-on-error`
    pub tolerated_failures: usize,
    pub steps: Vec<StepResult>,
}

impl JobReport {
    /// Snapshot a terminal instance record
    pub fn from_record(record: &InstanceRecord) -> Option<Self> {
        let result = record.result()?;
        let duration_ms = result
            .started_at
            .and_then(|s| (result.finished_at - s).to_std().ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Some(Self {
            job: record.instance.job.clone(),
            display_name: record.instance.display_name.clone(),
            matrix: record.instance.coordinate.clone(),
            layer: record.layer,
            outcome: result.outcome,
            reason: result.reason.clone(),
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_ms,
            tolerated_failures: result.tolerated_failures(),
            steps: result.steps.clone(),
        })
    }
}

/// Structured report of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub event: EventContext,
    /// False when the event did not match the pipeline's triggers
    pub triggered: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub gate: Option<String>,
    pub gate_members: Vec<String>,
    pub verdict: Verdict,
    pub jobs: Vec<JobReport>,
}

impl PipelineReport {
    pub fn new(
        run_id: Uuid,
        pipeline: &str,
        event: &EventContext,
        started_at: DateTime<Utc>,
        records: &[std::sync::Arc<InstanceRecord>],
        gate: GateResolution,
    ) -> Self {
        let mut jobs: Vec<JobReport> = records
            .iter()
            .filter_map(|r| JobReport::from_record(r))
            .collect();
        jobs.sort_by_key(|j| j.layer);

        Self {
            run_id,
            pipeline: pipeline.to_string(),
            event: event.clone(),
            triggered: true,
            started_at,
            finished_at: Utc::now(),
            gate: gate.gate,
            gate_members: gate.members,
            verdict: gate.verdict,
            jobs,
        }
    }

    /// Report for an event the pipeline does not react to
    pub fn not_triggered(run_id: Uuid, pipeline: &str, event: &EventContext) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            pipeline: pipeline.to_string(),
            event: event.clone(),
            triggered: false,
            started_at: now,
            finished_at: now,
            gate: None,
            gate_members: Vec::new(),
            verdict: Verdict::NoMatch,
            jobs: Vec::new(),
        }
    }

    /// Process exit code: 0 for success or no match, 1 for failure
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    pub fn job(&self, display_name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.display_name == display_name)
    }

    /// All instances of a job template
    pub fn instances_of<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a JobReport> + 'a {
        self.jobs.iter().filter(move |j| j.job == job)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.jobs.iter().filter(|j| j.outcome == outcome).count()
    }

    pub fn tolerated_failures(&self) -> usize {
        self.jobs.iter().map(|j| j.tolerated_failures).sum()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
