//! Persistence layer for pipeline run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{Outcome, Verdict};
use crate::report::PipelineReport;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run ID
    pub run_id: Uuid,

    /// Pipeline name
    pub pipeline: String,

    /// Triggering event type
    pub event_name: String,

    /// Triggering ref
    pub git_ref: String,

    pub actor: String,

    pub verdict: Verdict,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Job instance counts by outcome
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub fn from_report(report: &PipelineReport) -> Self {
        Self {
            run_id: report.run_id,
            pipeline: report.pipeline.clone(),
            event_name: report.event.event_name.clone(),
            git_ref: report.event.git_ref.clone(),
            actor: report.event.actor.clone(),
            verdict: report.verdict,
            started_at: report.started_at,
            finished_at: report.finished_at,
            succeeded: report.count(Outcome::Success),
            failed: report.count(Outcome::Failure),
            skipped: report.count(Outcome::Skipped),
            cancelled: report.count(Outcome::Cancelled),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.cancelled
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a run
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>>;

    /// Most recent runs first, optionally for one pipeline
    async fn list_runs(&self, pipeline: Option<&str>, limit: usize) -> Result<Vec<RunSummary>>;

    /// List all pipeline names
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: RwLock<HashMap<Uuid, RunSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, pipeline: Option<&str>, limit: usize) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<RunSummary> = runs
            .values()
            .filter(|r| pipeline.map_or(true, |p| r.pipeline == p))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|r| r.pipeline.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
