//! Step runners - the narrow "run a step, get an outcome" interface

pub mod shell;

use crate::core::StepAction;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub use shell::ShellRunner;

/// Error types for runner operations
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn step: {0}")]
    Spawn(String),

    #[error("Unsupported action '{0}' (enable action stubbing to skip it)")]
    UnsupportedAction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully bound step ready to execute
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// Display name of the owning job instance
    pub job: String,
    pub step: String,
    pub command: StepAction,
    /// Merged environment (process < pipeline < job < step)
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Bound `runs-on` selector
    pub runs_on: Option<String>,
}

/// Result of running a step to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr
    pub output: String,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for step execution - allows for different implementations
///
/// Implementations must be cancel safe: dropping the returned future stops
/// the step.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutput, RunnerError>;
}

#[async_trait]
impl<R: StepRunner + ?Sized> StepRunner for std::sync::Arc<R> {
    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutput, RunnerError> {
        (**self).execute(invocation).await
    }
}

/// How `uses:` steps are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActionPolicy {
    /// Fail the step with [`RunnerError::UnsupportedAction`]
    #[default]
    Reject,
    /// Report success without doing anything
    Stub,
}

/// Keep only the last `limit` bytes of output, on a char boundary
pub fn tail(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut start = output.len() - limit;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}
