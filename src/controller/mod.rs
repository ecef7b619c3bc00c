//! Node label controller
//!
//! Watches cluster nodes and converges their labels and taints toward the
//! values requested through trigger annotations.

mod cache;
pub mod config;
mod desired;
#[cfg(feature = "metrics")]
pub mod metrics;
mod node_api;
mod patch;
mod reconciler;
pub mod taint;
mod watcher;
pub mod workqueue;

pub use cache::{NodeCache, NodeSnapshot};
pub use config::ControllerConfig;
pub use desired::{desired_labels, desired_taints};
pub use node_api::{label_patch_body, taint_patch_body, KubeNodeApi, NodeApi};
pub use patch::{diff_labels, diff_taints, LabelMergePatch, TaintPatchOps};
pub use reconciler::{
    process_next_item, reconcile_node, run_controller, run_controller_with_events, run_workers,
    ControllerState,
};
pub use taint::{parse_taints, Taint, TaintEffect, TaintParseError};
pub use watcher::{drive_events, node_events};
pub use workqueue::{RateLimiter, WorkQueue};
