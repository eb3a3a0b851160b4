//! CLI command definitions

use crate::core::EventContext;
use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Triggering event type
    #[arg(long, default_value = "push")]
    pub event: String,

    /// Branch or full ref the event happened on
    #[arg(long = "ref", default_value = "main")]
    pub git_ref: String,

    /// Who triggered the run
    #[arg(long, default_value = "ci")]
    pub actor: String,

    /// Repository identifier, e.g. owner/name
    #[arg(long, default_value = "")]
    pub repository: String,

    /// Pusher identity (defaults to the actor)
    #[arg(long)]
    pub pusher: Option<String>,

    /// Scheduling strategy
    #[arg(long, value_enum, default_value_t = SchedulingStrategyArg::ParallelLimited)]
    pub strategy: SchedulingStrategyArg,

    /// Instance limit for parallel-limited (defaults to the pipeline's concurrency)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Directory steps run in
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Override the pipeline-wide timeout
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Extra environment for every step (KEY=VALUE)
    #[arg(long, value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Report `uses:` actions as successful instead of failing them
    #[arg(long)]
    pub stub_actions: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,
}

impl RunCommand {
    pub fn event_context(&self) -> EventContext {
        let ctx = EventContext::new(&self.event, &self.git_ref, &self.actor).with_repository(&self.repository);
        match &self.pusher {
            Some(pusher) => ctx.with_pusher(pusher),
            None => ctx,
        }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        match self.strategy {
            SchedulingStrategyArg::Sequential => SchedulingStrategy::Sequential,
            SchedulingStrategyArg::Parallel => SchedulingStrategy::Parallel,
            SchedulingStrategyArg::ParallelLimited => self
                .concurrency
                .map(SchedulingStrategy::LimitedParallel)
                .unwrap_or(SchedulingStrategy::Configured),
        }
    }
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the execution plan
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single run
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
