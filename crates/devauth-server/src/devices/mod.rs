//! Device identity and auth set state.
//!
//! Every path that changes an auth set (submission, decision, data
//! migration) re-derives the owning device's status through
//! [`status::derive_status`].

pub mod engine;
pub mod status;

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod engine_tests;

pub use engine::{Decision, DecisionOutcome, DeviceAuthEngine, DeviceError};
pub use status::{DerivedStatus, StatusConflict, derive_status};
