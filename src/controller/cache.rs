//! Local node cache fed by the node watch stream
//!
//! The cache keeps an immutable [`NodeSnapshot`] per node. Snapshots are
//! replaced wholesale on every update and handed out as `Arc`s, so workers
//! can read them without holding the cache lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::taint::Taint;

/// Point-in-time view of a node, as far as this controller cares
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    /// Taints whose effect this controller does not model
    pub unmodeled_taints: usize,
    pub resource_version: Option<String>,
}

impl NodeSnapshot {
    pub fn from_node(node: &Node) -> Self {
        let raw_taints = node
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.as_deref())
            .unwrap_or_default();
        let taints: Vec<Taint> = raw_taints.iter().filter_map(Taint::from_kube).collect();
        let unmodeled_taints = raw_taints.len() - taints.len();
        if unmodeled_taints > 0 {
            warn!(
                "Node {} has {} taint(s) with an unrecognized effect",
                node.name_any(),
                unmodeled_taints
            );
        }

        Self {
            name: node.name_any(),
            labels: node.labels().clone(),
            annotations: node.annotations().clone(),
            taints,
            unmodeled_taints,
            resource_version: node.resource_version(),
        }
    }

    /// Annotation value, treating a blank value as absent
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Default)]
struct Store {
    nodes: HashMap<String, Arc<NodeSnapshot>>,
    /// Snapshots collected during a (re)list, swapped in on `InitDone`
    relist: Option<HashMap<String, Arc<NodeSnapshot>>>,
}

/// Read-shared node cache; written only by the watch loop
pub struct NodeCache {
    store: RwLock<Store>,
    synced: watch::Sender<bool>,
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCache {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store: RwLock::new(Store::default()),
            synced,
        }
    }

    /// Current snapshot for `name`, or `None` if the node is gone
    pub fn get(&self, name: &str) -> Option<Arc<NodeSnapshot>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the initial list has been fully loaded
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the initial list has been fully loaded
    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives in `self`, so this only fails if the cache is dropped
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Apply a watch event and return the node names that need reconciling.
    ///
    /// A node is returned when it is new to the cache or its resource
    /// version changed. Deletions never produce work.
    pub fn apply(&self, event: Event<Node>) -> Vec<String> {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            Event::Init => {
                debug!("Node relist started");
                store.relist = Some(HashMap::new());
                Vec::new()
            }
            Event::InitApply(node) => {
                let snapshot = Arc::new(NodeSnapshot::from_node(&node));
                store
                    .relist
                    .get_or_insert_with(HashMap::new)
                    .insert(snapshot.name.clone(), snapshot);
                Vec::new()
            }
            Event::InitDone => {
                let fresh = store.relist.take().unwrap_or_default();
                let changed = fresh
                    .values()
                    .filter(|snapshot| !same_version(store.nodes.get(&snapshot.name), snapshot))
                    .map(|snapshot| snapshot.name.clone())
                    .collect();
                store.nodes = fresh;
                drop(store);

                debug!("Node relist complete");
                self.synced.send_replace(true);
                changed
            }
            Event::Apply(node) => {
                let snapshot = Arc::new(NodeSnapshot::from_node(&node));
                if same_version(store.nodes.get(&snapshot.name), &snapshot) {
                    return Vec::new();
                }
                let name = snapshot.name.clone();
                store.nodes.insert(name.clone(), snapshot);
                vec![name]
            }
            Event::Delete(node) => {
                let name = node.name_any();
                debug!("Node {} deleted", name);
                store.nodes.remove(&name);
                Vec::new()
            }
        }
    }
}

fn same_version(cached: Option<&Arc<NodeSnapshot>>, fresh: &NodeSnapshot) -> bool {
    match (cached, &fresh.resource_version) {
        (Some(cached), Some(version)) => cached.resource_version.as_ref() == Some(version),
        _ => false,
    }
}
