//! Node watch loop feeding the cache and the work queue

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::cache::NodeCache;
use super::workqueue::WorkQueue;

/// Watch stream over all nodes.
///
/// The stream re-lists and backs off on its own after errors, so
/// [`drive_events`] only logs them and keeps going.
pub fn node_events(
    nodes: Api<Node>,
) -> impl Stream<Item = std::result::Result<watcher::Event<Node>, watcher::Error>> + Send + 'static
{
    watcher(nodes, watcher::Config::default()).default_backoff()
}

/// Feed a stream of watch events into the cache, enqueueing changed nodes.
///
/// Returns `Ok` when stopped and [`Error::WatchError`] if the stream ends
/// on its own.
pub async fn drive_events<S>(
    events: S,
    cache: &NodeCache,
    queue: &WorkQueue<String>,
    mut stop: watch::Receiver<bool>,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<watcher::Event<Node>, watcher::Error>>,
{
    info!("Starting node watcher");
    futures::pin_mut!(events);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            event = events.next() => match event {
                Some(Ok(event)) => {
                    for key in cache.apply(event) {
                        debug!("Enqueueing node {}", key);
                        queue.add(key);
                    }
                }
                Some(Err(e)) => warn!("Node watch error: {}", e),
                None => {
                    warn!("Node watch stream ended");
                    return Err(Error::WatchError("node watch stream ended".to_string()));
                }
            }
        }
    }

    info!("Node watcher stopped");
    Ok(())
}
