//! ci-engine - a CI pipeline orchestration engine

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod report;
pub mod runner;

// Re-export commonly used types
pub use core::{ConfigError, EventContext, Outcome, PipelineDefinition, Verdict};
pub use execution::{CancelToken, ExecutionEngine, ExecutionEvent, SchedulingStrategy};
pub use report::{JobReport, PipelineReport};
pub use runner::{ShellRunner, StepInvocation, StepOutput, StepRunner};
