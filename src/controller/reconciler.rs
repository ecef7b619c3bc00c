//! Node reconciler and worker pool
//!
//! Watch events land in the [`NodeCache`] and push node names onto the
//! [`WorkQueue`]. A fixed pool of workers drains the queue; each key runs
//! through [`reconcile_node`], which derives the desired labels and taints
//! from the node's annotations and sends the smallest additive patch.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::Stream;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::watcher;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};

use super::cache::NodeCache;
use super::config::ControllerConfig;
use super::desired::{desired_labels, desired_taints};
use super::node_api::NodeApi;
use super::patch::{diff_labels, diff_taints};
use super::watcher::{drive_events, node_events};
use super::workqueue::WorkQueue;

#[cfg(feature = "metrics")]
use super::metrics;

/// Shared state for the controller
pub struct ControllerState {
    pub cache: Arc<NodeCache>,
    pub queue: Arc<WorkQueue<String>>,
    pub api: Arc<dyn NodeApi>,
    pub config: ControllerConfig,
}

impl ControllerState {
    pub fn new(api: Arc<dyn NodeApi>, config: ControllerConfig) -> Self {
        Self {
            cache: Arc::new(NodeCache::new()),
            queue: Arc::new(WorkQueue::with_default_rate_limiter()),
            api,
            config,
        }
    }
}

/// Main entry point to start the controller
///
/// Starts the node watcher, waits for the initial node list, then runs
/// `config.workers` workers until `shutdown` resolves. In-flight reconciles
/// are allowed to finish before this returns. Fails with
/// [`Error::CacheSyncError`] if the watcher exits before the first sync.
pub async fn run_controller<F>(
    state: Arc<ControllerState>,
    nodes: Api<Node>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    run_controller_with_events(state, node_events(nodes), shutdown).await
}

/// [`run_controller`] over an arbitrary stream of node watch events
pub async fn run_controller_with_events<S, F>(
    state: Arc<ControllerState>,
    events: S,
    shutdown: F,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<watcher::Event<Node>, watcher::Error>> + Send + 'static,
    F: Future<Output = ()>,
{
    state.config.validate()?;
    tokio::pin!(shutdown);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut watcher = {
        let cache = Arc::clone(&state.cache);
        let queue = Arc::clone(&state.queue);
        tokio::spawn(async move { drive_events(events, &cache, &queue, stop_rx).await })
    };

    info!("Waiting for node cache to sync");
    tokio::select! {
        _ = state.cache.wait_for_sync() => {}
        finished = &mut watcher => {
            state.queue.shut_down();
            let reason = match finished {
                Ok(Ok(())) => "watcher stopped".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            return Err(Error::CacheSyncError(format!(
                "node cache never synced: {}",
                reason
            )));
        }
        _ = &mut shutdown => {
            info!("Shutdown requested before node cache synced");
            state.queue.shut_down();
            stop_tx.send_replace(true);
            let _ = (&mut watcher).await;
            return Ok(());
        }
    }
    info!("Node cache synced with {} node(s)", state.cache.len());

    let workers = run_workers(&state);
    info!("Started {} workers", workers.len());

    shutdown.await;
    info!("Shutting down workers");

    state.queue.shut_down();
    stop_tx.send_replace(true);
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker task failed: {}", e);
        }
    }
    match watcher.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Node watcher exited: {}", e),
        Err(e) => error!("Node watcher task failed: {}", e),
    }

    info!("Controller stopped");
    Ok(())
}

/// Spawn the worker pool. Each worker exits once the queue is shut down.
pub fn run_workers(state: &Arc<ControllerState>) -> Vec<JoinHandle<()>> {
    (0..state.config.workers)
        .map(|id| {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                debug!("Worker {} started", id);
                while process_next_item(&state).await {}
                debug!("Worker {} stopped", id);
            })
        })
        .collect()
}

/// Take one key off the queue and reconcile it.
///
/// Returns false once the queue has been shut down.
pub async fn process_next_item(state: &ControllerState) -> bool {
    let Some(key) = state.queue.get().await else {
        return false;
    };

    #[cfg(feature = "metrics")]
    metrics::set_queue_depth(state.queue.len());

    let started = Instant::now();
    let result = reconcile_node(&key, state).await;

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(started.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            state.queue.forget(&key);
            info!(
                "Successfully synced node {} in {:?}",
                key,
                started.elapsed()
            );
        }
        Err(e) => {
            log_sync_error(&key, &e, state.queue.num_requeues(&key));
            state.queue.add_rate_limited(key.clone());

            #[cfg(feature = "metrics")]
            {
                metrics::inc_reconcile_error(e.kind());
                metrics::inc_requeue();
            }
        }
    }

    state.queue.done(&key);
    true
}

fn log_sync_error(key: &str, error: &Error, requeues: u32) {
    if error.is_retriable() {
        warn!(
            "Error syncing node {} (attempt {}): {}, requeuing",
            key,
            requeues + 1,
            error
        );
    } else {
        error!(
            "Error syncing node {} (attempt {}): {}, requeuing",
            key,
            requeues + 1,
            error
        );
    }
}

/// Converge one node's labels and taints toward its annotations.
///
/// A node that is no longer in the cache has been deleted and counts as
/// synced. A malformed taint annotation is logged and skipped rather than
/// retried, since retrying cannot fix it.
#[instrument(skip(state), fields(node = %key))]
pub async fn reconcile_node(key: &str, state: &ControllerState) -> Result<()> {
    let Some(node) = state.cache.get(key) else {
        info!("Node {} in work queue no longer exists", key);
        return Ok(());
    };
    let config = &state.config;

    let labels = diff_labels(&node.labels, &desired_labels(&node, config));
    if labels.is_empty() {
        debug!("Labels already up to date on node {}", key);
    } else {
        state.api.patch_labels(key, &labels).await?;
        info!(
            "Applied {} label(s) to node {}: {:?}",
            labels.len(),
            key,
            labels.labels
        );
        #[cfg(feature = "metrics")]
        metrics::inc_patch("labels");
    }

    let desired = match desired_taints(&node, config) {
        Ok(taints) => taints,
        Err(e) => {
            warn!(
                "Ignoring annotation {} on node {}: {}",
                config.taint_annotation, key, e
            );
            Vec::new()
        }
    };

    let mut taints = diff_taints(&node.taints, &desired);
    if node.unmodeled_taints > 0 {
        // The taint array is not empty even if no modeled taint is on it
        taints = taints.into_append();
    }
    if taints.is_empty() {
        debug!("Taints already up to date on node {}", key);
    } else {
        state.api.patch_taints(key, &taints).await?;
        info!(
            "Applied {} taint(s) to node {}",
            taints.taints().len(),
            key
        );
        #[cfg(feature = "metrics")]
        metrics::inc_patch("taints");
    }

    Ok(())
}
