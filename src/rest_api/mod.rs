//! Probe and metrics HTTP server
//!
//! Serves liveness, readiness and Prometheus endpoints for the controller.

mod handlers;
mod server;

pub use server::run_server;
