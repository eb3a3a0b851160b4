//! Definition-time error types
//!
//! Everything in here is fatal and reported before any job runs.

use thiserror::Error;

/// A dependency cycle between jobs.
///
/// `cycle` lists the jobs along the cycle, starting and ending with the same name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cycle detected in job dependencies: {}", .cycle.join(" -> "))]
pub struct CycleError {
    pub cycle: Vec<String>,
}

impl CycleError {
    /// Whether the given job takes part in the cycle
    pub fn involves(&self, job: &str) -> bool {
        self.cycle.iter().any(|j| j == job)
    }
}

/// Errors raised while loading or validating a pipeline definition
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read pipeline file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed pipeline definition: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Job '{0}' has no steps")]
    EmptyJob(String),

    #[error("Step {index} of job '{job}' must set exactly one of 'run' or 'uses'")]
    InvalidStep { job: String, index: usize },

    #[error("Syntax error in expression '{expr}' at {position}: {message}")]
    Syntax {
        expr: String,
        position: usize,
        message: String,
    },

    #[error("Unknown identifier '{ident}' in {scope}: '{expr}'")]
    UnknownIdentifier {
        scope: String,
        expr: String,
        ident: String,
    },

    #[error("Unknown function '{name}' in {scope}: '{expr}'")]
    UnknownFunction {
        scope: String,
        expr: String,
        name: String,
    },

    #[error("Function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Job '{job}' depends on non-existent job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("Job '{0}' depends on itself")]
    SelfDependency(String),

    #[error("{scope} references job '{job}' which is not listed in its needs")]
    UndeclaredNeed { scope: String, job: String },

    #[error("Invalid matrix for job '{job}': {message}")]
    InvalidMatrix { job: String, message: String },

    #[error("Job '{job}' references undeclared matrix axis '{axis}'")]
    UnknownMatrixAxis { job: String, axis: String },

    #[error("Gate jobs '{success}' and '{failure}' must declare identical needs")]
    GateNeedsMismatch { success: String, failure: String },

    #[error("More than one job is marked as the {0} gate")]
    DuplicateGate(String),

    #[error("Gate is defined both as a 'gate' block and as gate jobs")]
    AmbiguousGate,

    #[error("Gate job for the {0} branch is missing its counterpart")]
    IncompleteGate(String),

    #[error("Invalid retry policy: {0}")]
    InvalidRetry(String),

    #[error(transparent)]
    Cycle(#[from] CycleError),
}
