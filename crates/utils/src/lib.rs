//! Shared utilities for tasklaunch
//!
//! Process-group spawning and tree kills, RAII cleanup guards, and tracing
//! setup used by the launchers and the worker binary.

pub mod cleanup;
pub mod process;
pub mod tracing;

pub use cleanup::*;
pub use process::*;
