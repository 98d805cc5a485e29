//! Drift kubehub: cluster client capability, kube-backed client and in-memory cluster

#![forbid(unsafe_code)]

use async_trait::async_trait;
use drift_core::{Delta, GroupKind, LiveResource, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc;

mod kube_cluster;
mod memory;

pub use kube_cluster::KubeCluster;
pub use memory::{MemoryCluster, OpKind, OpRecord};

/// Field manager used for every write the engine issues.
pub const FIELD_MANAGER: &str = "drift";

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("transport: {0}")]
    Transport(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyParams {
    pub dry_run: bool,
    pub force: bool,
    pub field_manager: String,
}

impl Default for ApplyParams {
    fn default() -> Self { Self { dry_run: false, force: true, field_manager: FIELD_MANAGER.to_string() } }
}

impl ApplyParams {
    pub fn dry_run(dry_run: bool) -> Self { Self { dry_run, ..Default::default() } }
}

/// Read/write capability against a target cluster. Writes go through server-side apply,
/// JSON merge patch or delete; everything else is read-only.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> ClusterResult<Option<LiveResource>>;
    /// List objects in one namespace, or everything (namespaced and cluster-scoped) when `None`.
    async fn list(&self, namespace: Option<&str>) -> ClusterResult<Vec<LiveResource>>;
    async fn apply(&self, manifest: &Json, params: &ApplyParams) -> ClusterResult<LiveResource>;
    async fn patch(&self, key: &ResourceKey, patch: &Json, params: &ApplyParams) -> ClusterResult<LiveResource>;
    async fn delete(&self, key: &ResourceKey, dry_run: bool) -> ClusterResult<()>;
    /// Stream deltas for `namespace` into `tx` until the stream ends or the receiver is dropped.
    async fn watch(&self, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> ClusterResult<()>;
    async fn is_namespaced(&self, gk: &GroupKind) -> ClusterResult<bool>;
}

/// Strip the bookkeeping that never matters to watchers.
pub fn strip_managed_fields(v: &mut Json) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}
