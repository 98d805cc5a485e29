use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use drift_core::{is_cluster_scoped_builtin, Delta, DeltaKind, GroupKind, LiveResource, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::{strip_managed_fields, ApplyParams, ClusterClient, ClusterError, ClusterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Apply,
    Patch,
    Delete,
}

/// One write the cluster received, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpRecord {
    pub op: OpKind,
    pub key: ResourceKey,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
struct FailRule {
    key: ResourceKey,
    only_existing: bool,
    error: ClusterError,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceKey, Json>,
    cluster_scoped: BTreeSet<GroupKind>,
    fail: Vec<FailRule>,
    kind_status: BTreeMap<GroupKind, Json>,
    key_status: BTreeMap<ResourceKey, Json>,
    ops: Vec<OpRecord>,
    resource_version: u64,
    require_namespaces: bool,
}

/// In-memory cluster: objects keyed by identity, managed-field bookkeeping per writer,
/// failure injection and an op log. Cheap enough for unit and scenario tests.
pub struct MemoryCluster {
    state: Mutex<State>,
    events: broadcast::Sender<Delta>,
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new() }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { state: Mutex::new(State::default()), events }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register_cluster_scoped(&self, gk: GroupKind) { self.lock().cluster_scoped.insert(gk); }

    /// Reject namespaced writes whose namespace object does not exist.
    pub fn require_namespaces(&self, on: bool) { self.lock().require_namespaces = on; }

    /// Every write to `key` fails with `error` until cleared.
    pub fn fail_on(&self, key: ResourceKey, error: ClusterError) {
        self.lock().fail.push(FailRule { key, only_existing: false, error });
    }

    /// Applies and patches to `key` fail only while the object already exists (rejected updates).
    pub fn fail_updates(&self, key: ResourceKey, error: ClusterError) {
        self.lock().fail.push(FailRule { key, only_existing: true, error });
    }

    pub fn clear_failures(&self) { self.lock().fail.clear(); }

    /// Objects of `gk` receive `status` whenever they are applied.
    pub fn stamp_status(&self, gk: GroupKind, status: Json) { self.lock().kind_status.insert(gk, status); }

    /// Like `stamp_status`, for one object; wins over the per-kind stamp.
    pub fn stamp_status_for(&self, key: ResourceKey, status: Json) { self.lock().key_status.insert(key, status); }

    pub fn set_status(&self, key: &ResourceKey, status: Json) {
        let delta = {
            let mut st = self.lock();
            let Some(obj) = st.objects.get_mut(key) else { return };
            if let Some(m) = obj.as_object_mut() { m.insert("status".into(), status); }
            Delta { key: key.clone(), kind: DeltaKind::Applied, raw: obj.clone() }
        };
        self.publish(delta);
    }

    /// Out-of-band create/replace without manager bookkeeping.
    pub fn insert(&self, object: Json) -> Option<ResourceKey> {
        let key = ResourceKey::from_manifest(&object)?;
        let delta = {
            let mut st = self.lock();
            let mut object = object;
            stamp_server_fields(&mut st, &mut object, None);
            st.objects.insert(key.clone(), object.clone());
            Delta { key: key.clone(), kind: DeltaKind::Applied, raw: object }
        };
        self.publish(delta);
        Some(key)
    }

    /// Out-of-band delete.
    pub fn remove(&self, key: &ResourceKey) -> Option<Json> {
        let removed = self.lock().objects.remove(key);
        if let Some(obj) = removed.as_ref() {
            self.publish(Delta { key: key.clone(), kind: DeltaKind::Deleted, raw: obj.clone() });
        }
        removed
    }

    /// Merge `partial` into an existing object as another field manager (an `Update`).
    pub fn apply_as(&self, manager: &str, partial: &Json) -> ClusterResult<LiveResource> {
        let key = ResourceKey::from_manifest(partial).ok_or_else(|| ClusterError::Invalid("object without name".into()))?;
        let (live, delta) = {
            let mut st = self.lock();
            let Some(old) = st.objects.get(&key).cloned() else {
                return Err(ClusterError::NotFound(key.to_string()));
            };
            let mut next = old.clone();
            merge_patch(&mut next, &strip_identity(partial));
            record_manager(&mut next, manager, "Update", &field_set(partial), true);
            stamp_server_fields(&mut st, &mut next, Some(&old));
            st.objects.insert(key.clone(), next.clone());
            (LiveResource { key: key.clone(), object: next.clone() }, Delta { key, kind: DeltaKind::Applied, raw: next })
        };
        self.publish(delta);
        Ok(live)
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Json> { self.lock().objects.get(key).cloned() }

    pub fn contains(&self, key: &ResourceKey) -> bool { self.lock().objects.contains_key(key) }

    pub fn keys(&self) -> Vec<ResourceKey> { self.lock().objects.keys().cloned().collect() }

    pub fn ops(&self) -> Vec<OpRecord> { self.lock().ops.clone() }

    pub fn clear_ops(&self) { self.lock().ops.clear(); }

    fn publish(&self, mut delta: Delta) {
        strip_managed_fields(&mut delta.raw);
        // No subscribers is fine.
        let _ = self.events.send(delta);
    }

    fn check_write(st: &State, key: &ResourceKey, op: OpKind) -> ClusterResult<()> {
        let exists = st.objects.contains_key(key);
        for rule in st.fail.iter() {
            let applies = if rule.only_existing { exists && op != OpKind::Delete } else { true };
            if rule.key == *key && applies {
                return Err(rule.error.clone());
            }
        }
        if st.require_namespaces && !key.namespace.is_empty() {
            let ns = ResourceKey::new("", "Namespace", "", key.namespace.clone());
            if !st.objects.contains_key(&ns) {
                return Err(ClusterError::NotFound(format!("namespaces \"{}\" not found", key.namespace)));
            }
        }
        Ok(())
    }

    fn namespaced(st: &State, gk: &GroupKind) -> bool { !(is_cluster_scoped_builtin(gk) || st.cluster_scoped.contains(gk)) }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, key: &ResourceKey) -> ClusterResult<Option<LiveResource>> {
        Ok(self.lock().objects.get(key).map(|o| LiveResource { key: key.clone(), object: o.clone() }))
    }

    async fn list(&self, namespace: Option<&str>) -> ClusterResult<Vec<LiveResource>> {
        let st = self.lock();
        Ok(st
            .objects
            .iter()
            .filter(|(k, _)| namespace.map_or(true, |ns| k.namespace == ns))
            .map(|(k, o)| LiveResource { key: k.clone(), object: o.clone() })
            .collect())
    }

    async fn apply(&self, manifest: &Json, params: &ApplyParams) -> ClusterResult<LiveResource> {
        let mut key = ResourceKey::from_manifest(manifest).ok_or_else(|| ClusterError::Invalid("manifest without name".into()))?;
        let (live, delta) = {
            let mut st = self.lock();
            if !Self::namespaced(&st, &key.group_kind()) {
                key.namespace.clear();
            }
            st.ops.push(OpRecord { op: OpKind::Apply, key: key.clone(), dry_run: params.dry_run });
            Self::check_write(&st, &key, OpKind::Apply)?;
            let old = st.objects.get(&key).cloned();
            let mut next = manifest.clone();
            if key.namespace.is_empty() {
                if let Some(meta) = next.get_mut("metadata").and_then(|m| m.as_object_mut()) { meta.remove("namespace"); }
            }
            let fields = field_set(manifest);
            if let Some(old) = old.as_ref() {
                carry_foreign_fields(old, &mut next, &params.field_manager);
                let mf = old.get("metadata").and_then(|m| m.get("managedFields")).cloned();
                if let (Some(mf), Some(meta)) = (mf, next.get_mut("metadata").and_then(|m| m.as_object_mut())) {
                    meta.insert("managedFields".into(), mf);
                }
                if let Some(status) = old.get("status").cloned() {
                    if let Some(m) = next.as_object_mut() { m.insert("status".into(), status); }
                }
            }
            record_manager(&mut next, &params.field_manager, "Apply", &fields, false);
            let stamp = st.key_status.get(&key).or_else(|| st.kind_status.get(&key.group_kind())).cloned();
            if let (Some(status), Some(m)) = (stamp, next.as_object_mut()) {
                m.insert("status".into(), status);
            }
            stamp_server_fields(&mut st, &mut next, old.as_ref());
            let live = LiveResource { key: key.clone(), object: next.clone() };
            if params.dry_run {
                return Ok(live);
            }
            st.objects.insert(key.clone(), next.clone());
            debug!(key = %key, "memory apply");
            (live, Delta { key, kind: DeltaKind::Applied, raw: next })
        };
        self.publish(delta);
        Ok(live)
    }

    async fn patch(&self, key: &ResourceKey, patch: &Json, params: &ApplyParams) -> ClusterResult<LiveResource> {
        let (live, delta) = {
            let mut st = self.lock();
            st.ops.push(OpRecord { op: OpKind::Patch, key: key.clone(), dry_run: params.dry_run });
            Self::check_write(&st, key, OpKind::Patch)?;
            let Some(old) = st.objects.get(key).cloned() else {
                return Err(ClusterError::NotFound(key.to_string()));
            };
            let mut next = old.clone();
            merge_patch(&mut next, patch);
            record_manager(&mut next, &params.field_manager, "Update", &field_set(patch), true);
            stamp_server_fields(&mut st, &mut next, Some(&old));
            let live = LiveResource { key: key.clone(), object: next.clone() };
            if params.dry_run {
                return Ok(live);
            }
            st.objects.insert(key.clone(), next.clone());
            (live, Delta { key: key.clone(), kind: DeltaKind::Applied, raw: next })
        };
        self.publish(delta);
        Ok(live)
    }

    async fn delete(&self, key: &ResourceKey, dry_run: bool) -> ClusterResult<()> {
        let removed = {
            let mut st = self.lock();
            st.ops.push(OpRecord { op: OpKind::Delete, key: key.clone(), dry_run });
            Self::check_write(&st, key, OpKind::Delete)?;
            if !st.objects.contains_key(key) {
                return Err(ClusterError::NotFound(key.to_string()));
            }
            if dry_run {
                return Ok(());
            }
            st.objects.remove(key)
        };
        if let Some(obj) = removed {
            self.publish(Delta { key: key.clone(), kind: DeltaKind::Deleted, raw: obj });
        }
        Ok(())
    }

    async fn watch(&self, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> ClusterResult<()> {
        let mut rx = self.events.subscribe();
        for live in self.list(namespace).await? {
            let mut raw = live.object;
            strip_managed_fields(&mut raw);
            if tx.send(Delta { key: live.key, kind: DeltaKind::Applied, raw }).await.is_err() {
                return Ok(());
            }
        }
        loop {
            match rx.recv().await {
                Ok(d) => {
                    if namespace.map_or(false, |ns| d.key.namespace != ns) {
                        continue;
                    }
                    if tx.send(d).await.is_err() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "memory watch lagged"),
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn is_namespaced(&self, gk: &GroupKind) -> ClusterResult<bool> { Ok(Self::namespaced(&self.lock(), gk)) }
}

fn stamp_server_fields(st: &mut State, obj: &mut Json, old: Option<&Json>) {
    st.resource_version += 1;
    let rv = st.resource_version.to_string();
    let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
    let old_meta = old.and_then(|o| o.get("metadata"));
    let uid = old_meta
        .and_then(|m| m.get("uid"))
        .cloned()
        .unwrap_or_else(|| Json::String(uuid::Uuid::new_v4().to_string()));
    let created = old_meta
        .and_then(|m| m.get("creationTimestamp"))
        .cloned()
        .unwrap_or_else(|| Json::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
    meta.insert("uid".into(), uid);
    meta.insert("creationTimestamp".into(), created);
    meta.insert("resourceVersion".into(), Json::String(rv));
}

fn strip_identity(partial: &Json) -> Json {
    let mut p = partial.clone();
    if let Some(m) = p.as_object_mut() {
        m.remove("apiVersion");
        m.remove("kind");
    }
    if let Some(meta) = p.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("name");
        meta.remove("namespace");
    }
    p
}

/// RFC 7386 JSON merge patch.
pub(crate) fn merge_patch(target: &mut Json, patch: &Json) {
    let Some(patch_obj) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Some(t) = target.as_object_mut() {
        for (k, v) in patch_obj.iter() {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

/// Build a `fieldsV1` set for the fields present in `v`. Lists of named objects are keyed,
/// other lists are owned atomically.
fn field_set(v: &Json) -> Json {
    fn walk(v: &Json) -> Json {
        let mut out = Map::new();
        match v {
            Json::Object(m) => {
                for (k, child) in m.iter() {
                    out.insert(format!("f:{}", k), walk(child));
                }
            }
            Json::Array(items) => {
                for item in items.iter() {
                    if let Some(name) = item.get("name").and_then(|n| n.as_str()) {
                        out.insert(format!("k:{}", json!({"name": name})), walk(item));
                    }
                }
            }
            _ => {}
        }
        Json::Object(out)
    }
    let mut out = Map::new();
    if let Some(m) = v.as_object() {
        for (k, child) in m.iter() {
            match k.as_str() {
                "apiVersion" | "kind" | "status" => {}
                "metadata" => {
                    let mut meta = Map::new();
                    for sub in ["labels", "annotations"] {
                        if let Some(c) = child.get(sub) {
                            meta.insert(format!("f:{}", sub), walk(c));
                        }
                    }
                    if !meta.is_empty() {
                        out.insert("f:metadata".into(), Json::Object(meta));
                    }
                }
                _ => {
                    out.insert(format!("f:{}", k), walk(child));
                }
            }
        }
    }
    Json::Object(out)
}

fn union_fields(a: &mut Json, b: &Json) {
    let (Some(a), Some(b)) = (a.as_object_mut(), b.as_object()) else { return };
    for (k, v) in b.iter() {
        match a.get_mut(k) {
            Some(existing) => union_fields(existing, v),
            None => {
                a.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Replace (or extend, when `merge`) the entry of `manager` and move it to the end of the list.
fn record_manager(obj: &mut Json, manager: &str, operation: &str, fields: &Json, merge: bool) {
    let api_version = obj.get("apiVersion").cloned().unwrap_or(Json::Null);
    let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
    let mut entries: Vec<Json> = meta.get("managedFields").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let mut fields = fields.clone();
    if let Some(pos) = entries.iter().position(|e| e.get("manager").and_then(|m| m.as_str()) == Some(manager)) {
        let prev = entries.remove(pos);
        if merge {
            if let Some(prev_fields) = prev.get("fieldsV1") { union_fields(&mut fields, prev_fields); }
        }
    }
    entries.push(json!({
        "manager": manager,
        "operation": operation,
        "apiVersion": api_version,
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        "fieldsType": "FieldsV1",
        "fieldsV1": fields,
    }));
    meta.insert("managedFields".into(), Json::Array(entries));
}

/// Keep fields owned by other managers that the applied manifest does not mention.
fn carry_foreign_fields(old: &Json, next: &mut Json, applier: &str) {
    fn carry(old: &Json, next: &mut Json, fields: &Json) {
        let (Some(fields), Some(old_obj)) = (fields.as_object(), old.as_object()) else { return };
        let Some(next_obj) = next.as_object_mut() else { return };
        for (fk, sub) in fields.iter() {
            let Some(name) = fk.strip_prefix("f:") else { continue };
            let Some(old_val) = old_obj.get(name) else { continue };
            match next_obj.get_mut(name) {
                None => {
                    next_obj.insert(name.to_string(), old_val.clone());
                }
                Some(existing) => {
                    if sub.as_object().map_or(false, |m| !m.is_empty()) {
                        carry(old_val, existing, sub);
                    }
                }
            }
        }
    }
    let Some(entries) = old.get("metadata").and_then(|m| m.get("managedFields")).and_then(|v| v.as_array()) else { return };
    for e in entries.iter() {
        if e.get("manager").and_then(|m| m.as_str()) == Some(applier) {
            continue;
        }
        if let Some(fields) = e.get("fieldsV1") {
            carry(old, next, fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str, data: Json) -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "default"}, "data": data})
    }

    #[tokio::test]
    async fn apply_records_manager_and_server_fields() {
        let c = MemoryCluster::new();
        let live = c.apply(&cm("a", json!({"k": "v"})), &ApplyParams::default()).await.unwrap();
        let mf = live.field_managers();
        assert_eq!(mf.len(), 1);
        assert_eq!(mf[0].manager, "drift");
        assert!(live.object["metadata"]["uid"].is_string());
        assert_eq!(c.ops().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_does_not_store() {
        let c = MemoryCluster::new();
        c.apply(&cm("a", json!({})), &ApplyParams::dry_run(true)).await.unwrap();
        assert!(c.keys().is_empty());
        assert!(c.ops()[0].dry_run);
    }

    #[tokio::test]
    async fn foreign_fields_survive_reapply() {
        let c = MemoryCluster::new();
        let d = json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "default"}, "spec": {"template": {}}});
        c.apply(&d, &ApplyParams::default()).await.unwrap();
        c.apply_as("hpa", &json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "default"}, "spec": {"replicas": 5}})).unwrap();
        let live = c.apply(&d, &ApplyParams::default()).await.unwrap();
        assert_eq!(live.object["spec"]["replicas"], json!(5));
        let managers: Vec<_> = live.field_managers().into_iter().map(|m| m.manager).collect();
        assert_eq!(managers, vec!["hpa".to_string(), "drift".to_string()]);
    }

    #[tokio::test]
    async fn failure_injection_only_existing() {
        let c = MemoryCluster::new();
        let key = ResourceKey::new("", "ConfigMap", "default", "a");
        c.fail_updates(key.clone(), ClusterError::Invalid("field is immutable".into()));
        c.apply(&cm("a", json!({})), &ApplyParams::default()).await.unwrap();
        let err = c.apply(&cm("a", json!({"x": "y"})), &ApplyParams::default()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Invalid(_)));
        c.delete(&key, false).await.unwrap();
        assert!(!c.contains(&key));
    }

    #[tokio::test]
    async fn cluster_scoped_kinds_drop_namespace() {
        let c = MemoryCluster::new();
        let ns = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "team", "namespace": "ignored"}});
        let live = c.apply(&ns, &ApplyParams::default()).await.unwrap();
        assert_eq!(live.key.namespace, "");
        assert!(!c.is_namespaced(&GroupKind::new("", "Namespace")).await.unwrap());
    }

    #[test]
    fn merge_patch_removes_nulls() {
        let mut t = json!({"a": {"b": 1, "c": 2}, "d": [1]});
        merge_patch(&mut t, &json!({"a": {"b": null}, "d": [2, 3]}));
        assert_eq!(t, json!({"a": {"c": 2}, "d": [2, 3]}));
    }
}
