//! `RelayCast` Core Library
//!
//! Shared functionality for `RelayCast` components:
//! - Configuration resolution and hierarchy
//! - Destination registry and per-user credential store
//! - Relay diagnostic output classification
//! - Common error types

pub mod classifier;
pub mod config;
pub mod credentials;
pub mod error;
pub mod registry;
pub mod tracing_init;

pub use classifier::{Classification, Classifier, PatternTable};
pub use config::Config;
pub use credentials::{CredentialStore, StaticCredentials};
pub use error::{Error, Result};
pub use registry::{Destination, DestinationRegistry, StaticRegistry};
