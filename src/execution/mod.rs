//! Pipeline execution engine

pub mod aggregate;
pub mod cache;
pub mod cancel;
pub mod engine;
pub mod executor;
pub mod scheduler;

pub use aggregate::{aggregate, AggregateError, GateResolution};
pub use cache::StepCache;
pub use cancel::CancelToken;
pub use engine::{EngineError, EventBus, EventHandler, ExecutionEngine, ExecutionEvent};
pub use executor::{JobContext, JobExecutor};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
