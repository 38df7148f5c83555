//! Relay supervision.
//!
//! Starts one relay process per usable destination when the ingest stream is
//! published, watches each relay's output for authentication failures and
//! stalls, and stops relays when the stream ends or they misbehave.

mod actor;
pub mod monitor;
mod session;
pub mod types;

#[cfg(test)]
mod supervisor_tests;

pub use actor::{Supervisor, SupervisorHandle, SupervisorSettings};
pub use monitor::{Liveness, LivenessPolicy};
pub use types::{
    DestinationStatus, PublishOutcome, RelayEvent, RelayState, SkipReason, StopReason,
    SupervisorError,
};
