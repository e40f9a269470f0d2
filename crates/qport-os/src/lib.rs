//! Runs a `qport` device on an operating system.
//!
//! This crate provides APIs to:
//!
//! - Drive a [`qport::Device`] from a periodic `tokio` timer until a
//!   shutdown signal resolves.
//! - Store the device configuration image in a file.
//! - Route the `log` records of the core crates to a `tracing` subscriber.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Logging setup.
pub mod logging;
/// The tick loop.
pub mod runner;
/// File storage of the configuration image.
pub mod store;

pub use logging::init_logging;
pub use runner::{Runner, RunnerConfig};
pub use store::FileStore;
