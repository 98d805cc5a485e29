use std::time::Instant;

use async_trait::async_trait;
use drift_core::{split_api_version, Delta, DeltaKind, GroupKind, LiveResource, ResourceKey};
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{verbs, ApiCapabilities, Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use serde_json::Value as Json;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use crate::{strip_managed_fields, ApplyParams, ClusterClient, ClusterError, ClusterResult};

/// Cluster client over the kube dynamic API. Discovery runs once per client.
pub struct KubeCluster {
    client: Client,
    discovery: OnceCell<Discovery>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client, discovery: OnceCell::new() } }

    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    async fn discovery(&self) -> ClusterResult<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                let t0 = Instant::now();
                let d = Discovery::new(self.client.clone()).run().await.map_err(map_kube_err)?;
                info!(groups = d.groups().count(), took_ms = %t0.elapsed().as_millis(), "discovery complete");
                Ok(d)
            })
            .await
    }

    async fn resolve_gk(&self, gk: &GroupKind) -> ClusterResult<(ApiResource, ApiCapabilities)> {
        let d = self.discovery().await?;
        d.groups()
            .filter(|g| g.name() == gk.group)
            .find_map(|g| g.recommended_kind(&gk.kind))
            .ok_or_else(|| ClusterError::UnknownKind(gk.to_string()))
    }

    async fn resolve_manifest(&self, manifest: &Json) -> ClusterResult<(ApiResource, ApiCapabilities)> {
        let api_version = manifest.get("apiVersion").and_then(|s| s.as_str()).unwrap_or("");
        let kind = manifest.get("kind").and_then(|s| s.as_str()).unwrap_or("");
        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let d = self.discovery().await?;
        match d.resolve_gvk(&gvk) {
            Some(found) => Ok(found),
            None => self.resolve_gk(&GroupKind::new(group, kind)).await,
        }
    }

    fn api_for(&self, ar: &ApiResource, caps: &ApiCapabilities, namespace: &str) -> Api<DynamicObject> {
        if matches!(caps.scope, Scope::Namespaced) && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, ar)
        } else {
            Api::all_with(self.client.clone(), ar)
        }
    }

    async fn listable(&self) -> ClusterResult<Vec<(ApiResource, ApiCapabilities)>> {
        let d = self.discovery().await?;
        let mut out = Vec::new();
        for group in d.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::WATCH) {
                    continue;
                }
                // Events churn constantly and are never desired state.
                if ar.kind == "Event" {
                    continue;
                }
                out.push((ar, caps));
            }
        }
        Ok(out)
    }
}

fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => ClusterError::NotFound(resp.message),
            400 | 422 => ClusterError::Invalid(resp.message),
            409 => ClusterError::Conflict(resp.message),
            401 | 403 => ClusterError::Forbidden(resp.message),
            _ => ClusterError::Transport(format!("{} ({})", resp.message, resp.code)),
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

/// List items omit `apiVersion`/`kind`; restore them from the resolved resource.
fn to_live(ar: &ApiResource, obj: &DynamicObject) -> ClusterResult<LiveResource> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClusterError::Transport(format!("serializing object: {}", e)))?;
    if let Some(m) = raw.as_object_mut() {
        m.insert("apiVersion".into(), Json::String(ar.api_version.clone()));
        m.insert("kind".into(), Json::String(ar.kind.clone()));
    }
    LiveResource::from_object(raw).ok_or_else(|| ClusterError::Invalid("object without name".into()))
}

fn delta_from(ar: &ApiResource, obj: &DynamicObject, kind: DeltaKind) -> ClusterResult<Delta> {
    let live = to_live(ar, obj)?;
    let mut raw = live.object;
    strip_managed_fields(&mut raw);
    Ok(Delta { key: live.key, kind, raw })
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, key: &ResourceKey) -> ClusterResult<Option<LiveResource>> {
        let (ar, caps) = self.resolve_gk(&key.group_kind()).await?;
        let api = self.api_for(&ar, &caps, &key.namespace);
        match api.get_opt(&key.name).await.map_err(map_kube_err)? {
            Some(obj) => Ok(Some(to_live(&ar, &obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, namespace: Option<&str>) -> ClusterResult<Vec<LiveResource>> {
        let t0 = Instant::now();
        let mut out = Vec::new();
        for (ar, caps) in self.listable().await? {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            let api: Api<DynamicObject> = match (namespace, namespaced) {
                (Some(_), false) => continue,
                (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
                (None, _) => Api::all_with(self.client.clone(), &ar),
            };
            match api.list(&ListParams::default()).await {
                Ok(list) => {
                    for obj in list.items.iter() {
                        out.push(to_live(&ar, obj)?);
                    }
                }
                Err(e) => {
                    let e = map_kube_err(e);
                    if matches!(e, ClusterError::Forbidden(_) | ClusterError::NotFound(_)) {
                        debug!(kind = %ar.kind, error = %e, "list skipped");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        info!(ns = ?namespace, count = out.len(), took_ms = %t0.elapsed().as_millis(), "list complete");
        Ok(out)
    }

    async fn apply(&self, manifest: &Json, params: &ApplyParams) -> ClusterResult<LiveResource> {
        let (ar, caps) = self.resolve_manifest(manifest).await?;
        let key = ResourceKey::from_manifest(manifest).ok_or_else(|| ClusterError::Invalid("manifest without name".into()))?;
        let api = self.api_for(&ar, &caps, &key.namespace);
        let mut pp = PatchParams::apply(&params.field_manager);
        pp.force = params.force;
        pp.dry_run = params.dry_run;
        let obj = api.patch(&key.name, &pp, &Patch::Apply(manifest)).await.map_err(map_kube_err)?;
        debug!(key = %key, dry_run = params.dry_run, "applied");
        to_live(&ar, &obj)
    }

    async fn patch(&self, key: &ResourceKey, patch: &Json, params: &ApplyParams) -> ClusterResult<LiveResource> {
        let (ar, caps) = self.resolve_gk(&key.group_kind()).await?;
        let api = self.api_for(&ar, &caps, &key.namespace);
        let mut pp = PatchParams::default();
        pp.field_manager = Some(params.field_manager.clone());
        pp.dry_run = params.dry_run;
        let obj = api.patch(&key.name, &pp, &Patch::Merge(patch)).await.map_err(map_kube_err)?;
        to_live(&ar, &obj)
    }

    async fn delete(&self, key: &ResourceKey, dry_run: bool) -> ClusterResult<()> {
        let (ar, caps) = self.resolve_gk(&key.group_kind()).await?;
        let api = self.api_for(&ar, &caps, &key.namespace);
        let mut dp = DeleteParams::background();
        dp.dry_run = dry_run;
        api.delete(&key.name, &dp).await.map_err(map_kube_err)?;
        Ok(())
    }

    async fn watch(&self, namespace: Option<&str>, tx: mpsc::Sender<Delta>) -> ClusterResult<()> {
        let mut streams = Vec::new();
        for (ar, caps) in self.listable().await? {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            let api: Api<DynamicObject> = match (namespace, namespaced) {
                (Some(_), false) => continue,
                (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
                (None, _) => Api::all_with(self.client.clone(), &ar),
            };
            let stream = watcher::watcher(api, watcher::Config::default()).map(move |ev| (ar.clone(), ev));
            streams.push(stream.boxed());
        }
        let mut merged = futures::stream::select_all(streams);
        info!(ns = ?namespace, "watcher started");
        while let Some((ar, ev)) = merged.next().await {
            let ev = match ev {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(kind = %ar.kind, error = %e, "watch error");
                    continue;
                }
            };
            let deltas = match ev {
                Event::Applied(o) => vec![delta_from(&ar, &o, DeltaKind::Applied)?],
                Event::Deleted(o) => vec![delta_from(&ar, &o, DeltaKind::Deleted)?],
                Event::Restarted(list) => {
                    debug!(kind = %ar.kind, count = list.len(), "watch restart");
                    list.iter().map(|o| delta_from(&ar, o, DeltaKind::Applied)).collect::<ClusterResult<Vec<_>>>()?
                }
            };
            for d in deltas {
                if tx.send(d).await.is_err() {
                    return Ok(());
                }
            }
        }
        warn!("watcher stream ended");
        Ok(())
    }

    async fn is_namespaced(&self, gk: &GroupKind) -> ClusterResult<bool> {
        let (_, caps) = self.resolve_gk(gk).await?;
        Ok(matches!(caps.scope, Scope::Namespaced))
    }
}
