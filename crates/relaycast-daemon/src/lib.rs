//! RelayCast Daemon Library
//!
//! Core functionality for the RelayCast daemon:
//! - Relay process spawning and signalling
//! - Relay supervision with health monitoring
//! - Ingest stream path matching
//! - HTTP hooks for the ingest server and a control API

pub mod http;
pub mod ingest;
pub mod process;
pub mod supervisor;
