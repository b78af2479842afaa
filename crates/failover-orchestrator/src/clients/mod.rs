//! Remote API interfaces and the cross-account client factory

pub mod factory;
pub mod recovery_api;

pub use factory::*;
pub use recovery_api::*;
