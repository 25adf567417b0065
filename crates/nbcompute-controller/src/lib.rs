//! Lifecycle controller for per-identity notebook compute.
//!
//! [`Controller`] is the host-facing facade. Each identity gets one
//! [`LifecycleMachine`] in the [`SessionRegistry`]; the machine creates the remote
//! instance, optionally attaches storage, and polls until the notebook server is
//! reachable, using [`poll::poll_until`] for every wait.

mod config;
mod controller;
mod error;
mod lifecycle;
pub mod poll;
mod registry;

#[cfg(test)]
mod testing;

pub use config::{ControllerConfig, PollConfig};
pub use controller::Controller;
pub use error::ControllerError;
pub use lifecycle::{LifecycleMachine, SessionSnapshot};
pub use poll::BackoffPolicy;
pub use registry::{SessionEntry, SessionRegistry};
