//! nodegroup-drainer: policy-gated drain reconciler for Kubernetes node groups
//!
//! Periodically compares every Node's applied configuration checksum with the
//! checksum its NodeGroup wants, and walks out-of-date nodes through a
//! cordon, drain and return-to-service cycle without exceeding the group's
//! disruption budget.

pub mod controller;
pub mod crd;
pub mod error;
pub mod trigger;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
