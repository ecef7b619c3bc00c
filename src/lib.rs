//! Node Label Controller: turns node annotations into labels and taints
//!
//! This crate provides a Kubernetes controller that watches nodes and keeps
//! their zone labels and scheduling taints in line with the
//! `altinity.cloud/auto-zone` and `altinity.cloud/auto-taint` annotations.

pub mod controller;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
