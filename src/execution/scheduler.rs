//! Execution scheduler - tracks job instances and decides what may run next

use crate::core::{matrix::Coordinate, JobInstance, JobReason, JobResult, Outcome, PipelineDefinition};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Strategy for scheduling job instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// One job instance at a time, in layer order
    Sequential,

    /// Every ready instance at once
    Parallel,

    /// At most N instances in flight
    LimitedParallel(usize),

    /// Limited by the pipeline's configured concurrency
    #[default]
    Configured,
}

impl SchedulingStrategy {
    /// Maximum number of instances in flight
    pub fn limit(&self, configured: usize) -> usize {
        match self {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => usize::MAX,
            SchedulingStrategy::LimitedParallel(n) => (*n).max(1),
            SchedulingStrategy::Configured => configured.max(1),
        }
    }
}

pub type InstanceId = usize;

/// One job instance and its write-once terminal result
#[derive(Debug)]
pub struct InstanceRecord {
    pub id: InstanceId,
    /// Index of the job template in the definition
    pub job_index: usize,
    pub instance: Arc<JobInstance>,
    pub layer: usize,
    result: OnceLock<JobResult>,
}

impl InstanceRecord {
    pub fn result(&self) -> Option<&JobResult> {
        self.result.get()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.result().map(|r| r.outcome)
    }

    pub fn is_terminal(&self) -> bool {
        self.result.get().is_some()
    }

    /// Publish the terminal result. Returns false if one was already set.
    pub fn complete(&self, result: JobResult) -> bool {
        self.result.set(result).is_ok()
    }
}

/// Arena of job instances for a single run
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
    limit: usize,
    records: Vec<Arc<InstanceRecord>>,
    by_key: HashMap<(String, Coordinate), InstanceId>,
    by_name: HashMap<String, usize>,
    /// Instance ids per job template, declaration order
    by_job: Vec<Vec<InstanceId>>,
    dispatched: Vec<bool>,
    running: usize,
}

impl ExecutionScheduler {
    /// Expand every job template into instance records. Jobs whose matrix
    /// expands to nothing get a single record, already skipped.
    pub fn new(definition: &PipelineDefinition, strategy: SchedulingStrategy) -> Self {
        let mut records = Vec::new();
        let mut by_key = HashMap::new();
        let mut by_job = Vec::with_capacity(definition.jobs.len());
        let by_name = definition
            .jobs
            .iter()
            .enumerate()
            .map(|(i, job)| (job.name.clone(), i))
            .collect();

        for (job_index, template) in definition.jobs.iter().enumerate() {
            let layer = definition.graph.layer_of(&template.name).unwrap_or(0);
            let mut instances = template.instances();
            let empty = instances.is_empty();
            if empty {
                instances.push(JobInstance {
                    job: template.name.clone(),
                    coordinate: Coordinate::default(),
                    display_name: template.name.clone(),
                    runs_on: template.runs_on.clone(),
                    env: template.env.clone(),
                    steps: Vec::new(),
                });
            }

            let mut ids = Vec::with_capacity(instances.len());
            for instance in instances {
                let id = records.len();
                let record = InstanceRecord {
                    id,
                    job_index,
                    layer,
                    instance: Arc::new(instance),
                    result: OnceLock::new(),
                };
                if empty {
                    record.complete(JobResult::skipped(JobReason::EmptyMatrix));
                }
                by_key.insert(
                    (record.instance.job.clone(), record.instance.coordinate.clone()),
                    id,
                );
                records.push(Arc::new(record));
                ids.push(id);
            }
            by_job.push(ids);
        }

        let dispatched = vec![false; records.len()];
        Self {
            strategy,
            limit: strategy.limit(definition.settings.concurrency),
            records,
            by_key,
            by_name,
            by_job,
            dispatched,
            running: 0,
        }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    pub fn records(&self) -> &[Arc<InstanceRecord>] {
        &self.records
    }

    pub fn record(&self, id: InstanceId) -> &Arc<InstanceRecord> {
        &self.records[id]
    }

    /// Look up an instance by job name and coordinate
    pub fn lookup(&self, job: &str, coordinate: &Coordinate) -> Option<InstanceId> {
        self.by_key
            .get(&(job.to_string(), coordinate.clone()))
            .copied()
    }

    /// Index of a job template by name
    pub fn job_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn instances_of(&self, job_index: usize) -> &[InstanceId] {
        &self.by_job[job_index]
    }

    /// Terminal results of every instance of a job, or None while any is pending
    pub fn job_results(&self, job_index: usize) -> Option<Vec<&JobResult>> {
        self.by_job[job_index]
            .iter()
            .map(|&id| self.records[id].result())
            .collect()
    }

    /// Combined outcome of a job once all its instances are terminal
    pub fn job_outcome(&self, job_index: usize) -> Option<Outcome> {
        self.job_results(job_index)
            .map(|results| Outcome::combine(results.iter().map(|r| r.outcome)))
    }

    /// Instances not yet dispatched and not yet terminal, in layer order
    pub fn pending(&self) -> Vec<InstanceId> {
        let mut pending: Vec<InstanceId> = self
            .records
            .iter()
            .filter(|r| !self.dispatched[r.id] && !r.is_terminal())
            .map(|r| r.id)
            .collect();
        pending.sort_by_key(|&id| (self.records[id].layer, id));
        pending
    }

    /// How many more instances may be dispatched right now
    pub fn capacity(&self) -> usize {
        self.limit.saturating_sub(self.running)
    }

    pub fn mark_dispatched(&mut self, id: InstanceId) {
        if !self.dispatched[id] {
            self.dispatched[id] = true;
            self.running += 1;
        }
    }

    pub fn mark_finished(&mut self, id: InstanceId) {
        if self.dispatched[id] {
            self.running = self.running.saturating_sub(1);
        }
    }

    pub fn is_dispatched(&self, id: InstanceId) -> bool {
        self.dispatched[id]
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn is_complete(&self) -> bool {
        self.records.iter().all(|r| r.is_terminal())
    }
}
