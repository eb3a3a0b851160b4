//! Core domain models for the pipeline engine
//!
//! This module defines the pipeline definition and its configuration, the
//! condition language, matrix expansion, the dependency graph and the
//! outcome types shared by the execution layer.

pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod expression;
pub mod graph;
pub mod matrix;
pub mod pipeline;
pub mod state;

pub use config::{Backoff, GateRole, PipelineConfig};
pub use context::*;
pub use error::*;
pub use pipeline::*;
pub use state::*;
