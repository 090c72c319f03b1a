//! Frisbee Kubernetes operator
//!
//! Runs the Cluster, Cascade and Service controllers on top of the
//! lifecycle engine, plus the webhook receiving alert notifications.

#![deny(missing_docs)]

/// Reconcilers of the Frisbee resources
pub mod controller;
/// Controller wiring
pub mod controller_runner;
/// Controller error type
pub mod error;
/// Alert notification endpoint
pub mod webhook;

pub use error::{ControllerError, Result};
