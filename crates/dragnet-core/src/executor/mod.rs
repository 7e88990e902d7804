//! Typed executors and the engine that supervises their runs.

pub mod engine;
pub mod registry;
pub mod trait_def;

pub use engine::{CANCELLED_ERROR, ExecutionEngine, RunningSnapshot, TIMEOUT_ERROR};
pub use registry::ExecutorRegistry;
pub use trait_def::{ExecContext, Executor, ExecutorDescriptor, TaskOutput};
