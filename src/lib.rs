#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # essential-containers
//!
//! Deletes a pod once the container its `essential-container` label names
//! has completed successfully.
//!
//! The control loop lives in [`essential_reconciler`]; this crate adds the
//! command line and the Kubernetes adapters.

pub mod cli;
pub mod cluster;

pub use essential_reconciler;
