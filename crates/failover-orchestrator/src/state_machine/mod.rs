//! Execution state machine
//!
//! The only writer of execution status. Waves run strictly in index order:
//! wave N+1 is launched only after wave N is terminal.

pub mod engine;
pub mod step;

pub use engine::{ExecutionEngine, StartExecutionRequest};
pub use step::Step;
