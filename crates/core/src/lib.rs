//! Drift core types: resource identity, desired/live documents, status codes and conditions.

#![forbid(unsafe_code)]

pub mod annotations;
mod error;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

pub use annotations::{CompareOptions, HookDeletePolicy, HookType, SyncOptions};
pub use error::{DriftError, DriftResult};

/// API group + kind. The core group is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }

    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, _version) = split_api_version(api_version);
        Self::new(group, kind)
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { write!(f, "{}", self.kind) } else { write!(f, "{}/{}", self.group, self.kind) }
    }
}

/// Split `apps/v1` into (`apps`, `v1`) and `v1` into (``, `v1`).
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Unique identity of a cluster object. Namespace is empty for cluster-scoped objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    pub fn group_kind(&self) -> GroupKind { GroupKind::new(self.group.clone(), self.kind.clone()) }

    pub fn is_namespaced(&self) -> bool { !self.namespace.is_empty() }

    /// Derive the key from `apiVersion`, `kind`, `metadata.namespace` and `metadata.name`.
    pub fn from_manifest(v: &Json) -> Option<Self> {
        let api_version = v.get("apiVersion").and_then(|s| s.as_str())?;
        let kind = v.get("kind").and_then(|s| s.as_str())?;
        let name = meta_str(v, "name")?;
        if name.is_empty() || kind.is_empty() { return None; }
        let (group, _) = split_api_version(api_version);
        let namespace = meta_str(v, "namespace").unwrap_or("");
        Some(Self::new(group, kind, namespace, name))
    }

    /// Short `kind/name` form used in result messages, e.g. `configmap/my-map`.
    pub fn short(&self) -> String { format!("{}/{}", self.kind.to_lowercase(), self.name) }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = if self.group.is_empty() { format!("/{}", self.kind) } else { format!("{}/{}", self.group, self.kind) };
        if self.namespace.is_empty() { write!(f, "{} {}", gk, self.name) } else { write!(f, "{} {}/{}", gk, self.namespace, self.name) }
    }
}

pub fn meta_str<'a>(v: &'a Json, field: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(field)).and_then(|s| s.as_str())
}

fn meta_map(v: &Json, field: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(obj) = v.get("metadata").and_then(|m| m.get(field)).and_then(|m| m.as_object()) {
        for (k, val) in obj.iter() {
            if let Some(s) = val.as_str() { out.insert(k.clone(), s.to_string()); }
        }
    }
    out
}

pub fn labels_of(v: &Json) -> BTreeMap<String, String> { meta_map(v, "labels") }

pub fn annotations_of(v: &Json) -> BTreeMap<String, String> { meta_map(v, "annotations") }

pub fn annotation<'a>(v: &'a Json, key: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|s| s.as_str())
}

/// Set `metadata.<field>.<key> = value`, creating intermediate objects as needed.
pub fn set_meta_entry(v: &mut Json, field: &str, key: &str, value: &str) {
    let Some(root) = v.as_object_mut() else { return };
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
    let Some(meta) = meta.as_object_mut() else { return };
    let map = meta.entry(field).or_insert_with(|| Json::Object(Default::default()));
    if !map.is_object() { *map = Json::Object(Default::default()); }
    if let Some(map) = map.as_object_mut() { map.insert(key.to_string(), Json::String(value.to_string())); }
}

/// A desired manifest as produced by the renderer, with its recognized annotations parsed once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredResource {
    pub key: ResourceKey,
    pub manifest: Json,
    pub hooks: SmallVec<[HookType; 2]>,
    pub hook_delete_policies: SmallVec<[HookDeletePolicy; 2]>,
    pub wave: i32,
    pub options: SyncOptions,
    pub compare: CompareOptions,
}

impl DesiredResource {
    pub fn from_manifest(manifest: Json) -> DriftResult<Self> {
        let key = ResourceKey::from_manifest(&manifest).ok_or_else(|| {
            DriftError::Validation("manifest requires apiVersion, kind and metadata.name".into())
        })?;
        let hooks = match annotation(&manifest, annotations::HOOK) {
            Some(v) => annotations::parse_hooks(v)?,
            None => SmallVec::new(),
        };
        let hook_delete_policies = match annotation(&manifest, annotations::HOOK_DELETE_POLICY) {
            Some(v) => annotations::parse_delete_policies(v)?,
            None => SmallVec::new(),
        };
        let wave = match annotation(&manifest, annotations::SYNC_WAVE) {
            Some(v) => annotations::parse_wave(v)?,
            None => 0,
        };
        let options = annotation(&manifest, annotations::SYNC_OPTIONS).map(SyncOptions::parse).unwrap_or_default();
        let compare = annotation(&manifest, annotations::COMPARE_OPTIONS).map(CompareOptions::parse).unwrap_or_default();
        Ok(Self { key, manifest, hooks, hook_delete_policies, wave, options, compare })
    }

    pub fn is_hook(&self) -> bool { !self.hooks.is_empty() }

    pub fn is_skipped(&self) -> bool { self.hooks.contains(&HookType::Skip) }

    pub fn has_hook(&self, hook: HookType) -> bool { self.hooks.contains(&hook) }

    /// Delete policies in effect; a hook without an explicit policy is recreated on each run.
    pub fn delete_policies(&self) -> SmallVec<[HookDeletePolicy; 2]> {
        if self.hook_delete_policies.is_empty() {
            let mut v = SmallVec::new();
            v.push(HookDeletePolicy::BeforeHookCreation);
            v
        } else {
            self.hook_delete_policies.clone()
        }
    }

    /// Fill in `metadata.namespace` for a namespaced kind that omits it.
    pub fn default_namespace(&mut self, namespace: &str) {
        if !self.key.namespace.is_empty() || namespace.is_empty() { return; }
        self.key.namespace = namespace.to_string();
        if let Some(meta) = self.manifest.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".into(), Json::String(namespace.to_string()));
        }
    }
}

/// One field manager entry of `metadata.managedFields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedFieldsEntry {
    pub manager: String,
    pub operation: String,
    pub time: Option<DateTime<Utc>>,
    /// Raw `fieldsV1` set.
    pub fields: Json,
}

/// A live object as observed on the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveResource {
    pub key: ResourceKey,
    pub object: Json,
}

impl LiveResource {
    pub fn from_object(object: Json) -> Option<Self> {
        let key = ResourceKey::from_manifest(&object)?;
        Some(Self { key, object })
    }

    pub fn labels(&self) -> BTreeMap<String, String> { labels_of(&self.object) }

    pub fn annotations(&self) -> BTreeMap<String, String> { annotations_of(&self.object) }

    pub fn annotation(&self, key: &str) -> Option<&str> { annotation(&self.object, key) }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.object.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.get(key)).and_then(|s| s.as_str())
    }

    pub fn sync_options(&self) -> SyncOptions { self.annotation(annotations::SYNC_OPTIONS).map(SyncOptions::parse).unwrap_or_default() }

    pub fn compare_options(&self) -> CompareOptions { self.annotation(annotations::COMPARE_OPTIONS).map(CompareOptions::parse).unwrap_or_default() }

    pub fn wave(&self) -> i32 { self.annotation(annotations::SYNC_WAVE).and_then(|v| annotations::parse_wave(v).ok()).unwrap_or(0) }

    pub fn is_hook(&self) -> bool { self.annotation(annotations::HOOK).is_some() }

    /// Parsed `metadata.managedFields`; malformed entries are skipped.
    pub fn field_managers(&self) -> Vec<ManagedFieldsEntry> {
        let Some(arr) = self.object.get("metadata").and_then(|m| m.get("managedFields")).and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        arr.iter()
            .filter_map(|e| {
                let manager = e.get("manager")?.as_str()?.to_string();
                let operation = e.get("operation").and_then(|s| s.as_str()).unwrap_or("").to_string();
                let time = e
                    .get("time")
                    .and_then(|s| s.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc));
                let fields = e.get("fieldsV1").cloned().unwrap_or(Json::Null);
                Some(ManagedFieldsEntry { manager, operation, time, fields })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatusCode {
    Synced,
    OutOfSync,
    Unknown,
}

impl fmt::Display for SyncStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatusCode {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    Unknown,
}

impl HealthStatusCode {
    /// Rank used for worst-case roll-up; higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            HealthStatusCode::Healthy => 0,
            HealthStatusCode::Unknown => 1,
            HealthStatusCode::Missing => 2,
            HealthStatusCode::Suspended => 3,
            HealthStatusCode::Progressing => 4,
            HealthStatusCode::Degraded => 5,
        }
    }

    pub fn is_worse(self, other: HealthStatusCode) -> bool { self.severity() > other.severity() }
}

impl fmt::Display for HealthStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatusCode,
    pub message: Option<String>,
}

impl HealthState {
    pub fn new(status: HealthStatusCode) -> Self { Self { status, message: None } }

    pub fn with_message(status: HealthStatusCode, message: impl Into<String>) -> Self {
        Self { status, message: Some(message.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationPhase {
    Running,
    Terminating,
    Succeeded,
    Failed,
    Error,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationPhase::Succeeded | OperationPhase::Failed | OperationPhase::Error)
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionKind {
    InvalidSpecError,
    ComparisonError,
    RenderError,
    SyncError,
    OrphanedResourceWarning,
    ExcludedResourceWarning,
}

impl ConditionKind {
    pub fn is_error(self) -> bool {
        matches!(self, ConditionKind::InvalidSpecError | ConditionKind::ComparisonError | ConditionKind::RenderError | ConditionKind::SyncError)
    }
}

/// Application-level condition; recomputed from scratch on every full reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Condition {
    pub fn new(kind: ConditionKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), timestamp: Utc::now() }
    }
}

/// Per-resource status surfaced with the application status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub key: ResourceKey,
    pub status: SyncStatusCode,
    pub health: Option<HealthState>,
    pub hook: bool,
    pub requires_pruning: bool,
    /// False when the project policy forbids this resource.
    pub permitted: bool,
    /// Extraneous-but-ignored resources never make the application OutOfSync.
    pub ignore_extraneous: bool,
    pub wave: i32,
}

impl ResourceStatus {
    pub fn new(key: ResourceKey, status: SyncStatusCode) -> Self {
        Self { key, status, health: None, hook: false, requires_pruning: false, permitted: true, ignore_extraneous: false, wave: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A single watch observation, keyed by resource identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub key: ResourceKey,
    pub kind: DeltaKind,
    pub raw: Json,
}

/// Built-in cluster-scoped kinds; used when no discovery information is available.
pub fn is_cluster_scoped_builtin(gk: &GroupKind) -> bool {
    const CLUSTER_SCOPED: &[(&str, &str)] = &[
        ("", "Namespace"),
        ("", "Node"),
        ("", "PersistentVolume"),
        ("rbac.authorization.k8s.io", "ClusterRole"),
        ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
        ("apiextensions.k8s.io", "CustomResourceDefinition"),
        ("storage.k8s.io", "StorageClass"),
        ("scheduling.k8s.io", "PriorityClass"),
        ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
        ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
        ("apiregistration.k8s.io", "APIService"),
        ("networking.k8s.io", "IngressClass"),
    ];
    CLUSTER_SCOPED.iter().any(|(g, k)| gk.group == *g && gk.kind == *k)
}

/// 64-bit FNV-1a over the input, rendered as 16 hex chars. Used for content revisions.
pub fn fnv1a_hex(bytes: &[u8]) -> String {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
    format!("{:016x}", h)
}

pub mod prelude {
    pub use super::{
        Condition, ConditionKind, DesiredResource, DriftError, DriftResult, GroupKind, HealthState, HealthStatusCode,
        LiveResource, OperationPhase, ResourceKey, ResourceStatus, SyncStatusCode,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_from_manifest_splits_group() {
        let v = json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "prod"}});
        let k = ResourceKey::from_manifest(&v).unwrap();
        assert_eq!(k, ResourceKey::new("apps", "Deployment", "prod", "web"));
        assert_eq!(k.to_string(), "apps/Deployment prod/web");

        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "my-map"}});
        let k = ResourceKey::from_manifest(&cm).unwrap();
        assert_eq!(k.group, "");
        assert_eq!(k.short(), "configmap/my-map");
    }

    #[test]
    fn desired_parses_recognized_annotations() {
        let v = json!({
            "apiVersion": "batch/v1", "kind": "Job",
            "metadata": {"name": "migrate", "annotations": {
                "drift.dev/hook": "PreSync,PostSync",
                "drift.dev/sync-wave": "-2",
                "drift.dev/sync-options": "Prune=false, Validate=false"
            }}
        });
        let d = DesiredResource::from_manifest(v).unwrap();
        assert!(d.has_hook(HookType::PreSync));
        assert!(d.has_hook(HookType::PostSync));
        assert_eq!(d.wave, -2);
        assert!(!d.options.prune());
        assert!(!d.options.validate());
        assert_eq!(d.delete_policies().as_slice(), &[HookDeletePolicy::BeforeHookCreation]);
    }

    #[test]
    fn desired_rejects_bad_wave() {
        let v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "annotations": {"drift.dev/sync-wave": "soon"}}});
        let err = DesiredResource::from_manifest(v).unwrap_err();
        assert!(matches!(err, DriftError::Validation(_)));
    }

    #[test]
    fn default_namespace_only_fills_empty() {
        let v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}});
        let mut d = DesiredResource::from_manifest(v).unwrap();
        d.default_namespace("team");
        assert_eq!(d.key.namespace, "team");
        assert_eq!(meta_str(&d.manifest, "namespace"), Some("team"));
        d.default_namespace("other");
        assert_eq!(d.key.namespace, "team");
    }

    #[test]
    fn health_severity_orders_worst_first() {
        use HealthStatusCode::*;
        let order = [Degraded, Progressing, Suspended, Missing, Unknown, Healthy];
        for w in order.windows(2) {
            assert!(w[0].is_worse(w[1]), "{:?} should be worse than {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn managed_fields_are_parsed() {
        let v = json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "ns", "managedFields": [
                {"manager": "kubectl", "operation": "Apply", "time": "2024-01-01T00:00:00Z", "fieldsV1": {"f:spec": {"f:replicas": {}}}},
                {"operation": "Update"}
            ]}
        });
        let live = LiveResource::from_object(v).unwrap();
        let mf = live.field_managers();
        assert_eq!(mf.len(), 1);
        assert_eq!(mf[0].manager, "kubectl");
        assert!(mf[0].time.is_some());
    }
}
