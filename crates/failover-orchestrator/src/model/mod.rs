//! Data model
//!
//! Protection groups and recovery plans describe what to recover; executions
//! record one run of a plan. Status fields are closed enums with transition
//! tables checked before every write.

pub mod account;
pub mod execution;
pub mod plan;
pub mod status;

pub use account::*;
pub use execution::*;
pub use plan::*;
pub use status::*;
