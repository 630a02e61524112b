//! REST API module for external integrations
//!
//! Exposes liveness, Prometheus metrics and the report of the last pass.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
