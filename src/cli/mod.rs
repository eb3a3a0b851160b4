//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, PlanCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;

/// CI pipeline orchestration engine
#[derive(Debug, Parser, Clone)]
#[command(name = "ci-engine")]
#[command(version)]
#[command(about = "Run CI pipelines: matrix expansion, conditions, dependency scheduling and gating", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline for an event
    Run(RunCommand),

    /// Validate a pipeline definition
    Validate(ValidateCommand),

    /// Show dependency layers and expanded job instances
    Plan(PlanCommand),

    /// Show run history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SchedulingStrategy;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "ci-engine",
            "-v",
            "run",
            "-f",
            "ci.yaml",
            "--event",
            "push",
            "--ref",
            "auto",
            "--actor",
            "bors",
            "--strategy",
            "parallel-limited",
            "--concurrency",
            "8",
            "--env",
            "CARGO_TERM_COLOR=always",
        ])
        .unwrap();

        assert!(cli.verbose);
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(run.strategy(), SchedulingStrategy::LimitedParallel(8));
        assert_eq!(run.event_context().git_ref, "refs/heads/auto");
        assert_eq!(run.event_context().pusher, "bors");
        assert_eq!(run.env, vec![("CARGO_TERM_COLOR".to_string(), "always".to_string())]);
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["ci-engine", "run", "-f", "ci.yaml"]).unwrap();
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(run.strategy(), SchedulingStrategy::Configured);
        assert_eq!(run.event_context().event_name, "push");
        assert!(!run.stub_actions);
    }

    #[test]
    fn test_parse_history_and_plan() {
        let cli = Cli::try_parse_from(["ci-engine", "history", "--pipeline", "ci", "--limit", "3"]).unwrap();
        let Command::History(history) = cli.command else {
            panic!("expected history");
        };
        assert_eq!(history.pipeline.as_deref(), Some("ci"));
        assert_eq!(history.limit, 3);

        assert!(Cli::try_parse_from(["ci-engine", "plan", "-f", "ci.yaml", "--json"]).is_ok());
        assert!(Cli::try_parse_from(["ci-engine", "run"]).is_err());
    }
}
