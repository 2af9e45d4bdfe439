//! Core domain types, errors, and constants for tasklaunch.
//!
//! ## Key Components
//!
//! - **`errors`**: the primary `Error` enum and `Result` alias shared by every
//!   launcher variant.
//! - **`types`**: task identities, `TaskResult` and its failure payload, captured
//!   logs, scripts and fork environments.
//! - **`constants`**: scheduler variable names and handshake defaults.

pub mod constants;
pub mod errors;
pub mod types;

pub use self::{
    constants::*,
    errors::{Error, Result, ResultExt},
    types::*,
};
