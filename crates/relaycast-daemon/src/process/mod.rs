//! Relay process management.

pub mod invocation;
#[cfg(test)]
pub(crate) mod scripted;
pub mod spawner;

pub use invocation::RelayInvocation;
pub use spawner::{
    ExitCode, ProcessError, ProcessSpawner, RelayControl, RelaySpawner, SpawnedRelay, StopSignal,
};
