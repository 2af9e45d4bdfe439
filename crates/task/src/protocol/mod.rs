//! Parent/worker protocol for forked tasks
//!
//! The parent owns a [`RegistrationHub`]; a forked worker connects to it,
//! registers under its deployment id and then serves JSON-RPC requests from
//! the launcher that spawned it through a [`ChildRuntime`].

mod client;
mod registration;
pub mod types;

pub use client::{ChildRuntime, PendingCall, RemoteTaskLauncher};
pub use registration::{
    parse_contact_url, RegisteredRuntime, Registration, RegistrationHub, WaitOutcome,
};
