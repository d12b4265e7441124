//! Crash testing framework for samwal
//!
//! Provides:
//! - A scratch workspace with a config, log and master files
//! - Subprocess runs of the samwal binary with a crash point armed
//! - Helpers to inspect the master files afterwards

pub mod harness;

pub use harness::*;
