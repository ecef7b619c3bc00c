//! Node patching against the Kubernetes API
//!
//! This is the only place patch values are turned into wire payloads: label
//! patches become a JSON merge patch on `metadata.labels`, taint patches
//! become RFC 6902 `add` operations on `spec.taints`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};

use crate::error::Result;

use super::config::FIELD_MANAGER;
use super::patch::{LabelMergePatch, TaintPatchOps};

/// Write access to nodes
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn patch_labels(&self, node: &str, patch: &LabelMergePatch) -> Result<()>;
    async fn patch_taints(&self, node: &str, ops: &TaintPatchOps) -> Result<()>;
}

/// [`NodeApi`] backed by the cluster API server
pub struct KubeNodeApi {
    nodes: Api<Node>,
    params: PatchParams,
}

impl KubeNodeApi {
    pub fn new(client: Client, dry_run: bool) -> Self {
        let mut params = PatchParams::apply(FIELD_MANAGER);
        params.dry_run = dry_run;
        Self {
            nodes: Api::all(client),
            params,
        }
    }
}

#[async_trait]
impl NodeApi for KubeNodeApi {
    async fn patch_labels(&self, node: &str, patch: &LabelMergePatch) -> Result<()> {
        let body = label_patch_body(patch);
        self.nodes
            .patch(node, &self.params, &Patch::Merge(&body))
            .await?;
        Ok(())
    }

    async fn patch_taints(&self, node: &str, ops: &TaintPatchOps) -> Result<()> {
        let body = taint_patch_body(ops)?;
        self.nodes
            .patch(node, &self.params, &Patch::Json::<()>(body))
            .await?;
        Ok(())
    }
}

/// Merge patch body setting the given labels
pub fn label_patch_body(patch: &LabelMergePatch) -> Value {
    json!({
        "metadata": {
            "labels": patch.labels
        }
    })
}

/// JSON patch adding the given taints
pub fn taint_patch_body(ops: &TaintPatchOps) -> Result<json_patch::Patch> {
    let operations: Vec<Value> = match ops {
        TaintPatchOps::None => Vec::new(),
        TaintPatchOps::Replace(taints) => {
            let taints: Vec<_> = taints.iter().map(|taint| taint.to_kube()).collect();
            vec![json!({
                "op": "add",
                "path": "/spec/taints",
                "value": taints,
            })]
        }
        TaintPatchOps::Append(taints) => taints
            .iter()
            .map(|taint| {
                json!({
                    "op": "add",
                    "path": "/spec/taints/-",
                    "value": taint.to_kube(),
                })
            })
            .collect(),
    };

    Ok(serde_json::from_value(Value::Array(operations))?)
}
