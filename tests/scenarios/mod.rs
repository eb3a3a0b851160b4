//! Pipeline scenarios

mod definition_errors;
mod dependencies;
mod gating;
mod matrix_jobs;
mod retry_behavior;
mod triggers;
