//! In-process engine: one handle per application, each with its own operation slot.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use drift_core::{
    is_cluster_scoped_builtin, Condition, ConditionKind, DesiredResource, DriftError, DriftResult, LiveResource, OperationPhase, ResourceKey,
    SyncOptions,
};
use drift_diff::{render_text_diff, DiffRegistry, IgnoreRule};
use drift_health::HealthRegistry;
use drift_kubehub::{ClusterClient, ClusterError};
use drift_status::{compare_app_state, AppComparison, AppProject, CompareInput, PolicyRequest, ProjectPolicy, ResourceExclusions};
use drift_store::{queue_cap, spawn_ingest, BackendHandle};
use drift_sync::{kind_rank, PlanInput, SyncContext, SyncOperation, SyncPlan, SyncRequest};
use drift_track::ResourceTracker;
use futures::future::join_all;
use metrics::histogram;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::render::{ManifestRenderer, Rendered};
use crate::settings::Settings;
use crate::{AppSpec, AppStatus, DriftApi, HistoryEntry, ResourceDiff, ResourceListing};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

fn cluster_err(e: ClusterError) -> DriftError { DriftError::Internal(e.to_string()) }

/// Condition recorded when a comparison pass cannot complete.
fn failure_condition(e: &DriftError) -> Condition {
    match e {
        DriftError::Render(m) => Condition::new(ConditionKind::RenderError, m.clone()),
        DriftError::Invalid(m) | DriftError::PolicyViolation(m) | DriftError::Validation(m) => Condition::new(ConditionKind::InvalidSpecError, m.clone()),
        other => Condition::new(ConditionKind::ComparisonError, other.to_string()),
    }
}

struct RunningOp {
    id: Uuid,
    cancel: CancellationToken,
    /// `Some` once the operation is terminal and recorded.
    done: watch::Receiver<Option<SyncOperation>>,
}

impl RunningOp {
    /// A dropped sender means the run ended without a result.
    fn is_active(&self) -> bool { self.done.borrow().is_none() && self.done.has_changed().is_ok() }
}

/// Completes an operation. Dropped without `finish` (a panicking run), it records the
/// operation as `Error` so the slot frees up.
struct DoneGuard {
    h: Arc<AppHandle>,
    done: watch::Sender<Option<SyncOperation>>,
    started: SyncOperation,
}

impl DoneGuard {
    fn finish(self, op: SyncOperation) { let _ = self.done.send_replace(Some(op)); }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if self.done.borrow().is_some() {
            return;
        }
        let mut op = self.started.clone();
        op.phase = OperationPhase::Error;
        op.message = "operation aborted unexpectedly".into();
        op.finished_at = Some(Utc::now());
        warn!(app = %op.app, op = %op.id, "operation ended without a result");
        *lock(&self.h.operation) = Some(op.clone());
        self.h.notify();
        let _ = self.done.send_replace(Some(op));
    }
}

#[derive(Default)]
struct History {
    next_id: u64,
    entries: Vec<HistoryEntry>,
}

struct AppHandle {
    spec: ArcSwap<AppSpec>,
    /// Result of the last comparison pass.
    status: ArcSwap<AppStatus>,
    status_tx: watch::Sender<AppStatus>,
    last_good: Mutex<Option<Rendered>>,
    operation: Mutex<Option<SyncOperation>>,
    history: Mutex<History>,
    slot: tokio::sync::Mutex<Option<RunningOp>>,
}

impl AppHandle {
    fn new(spec: AppSpec) -> Self {
        let status = AppStatus::unknown(spec.name.clone());
        let (status_tx, _) = watch::channel(status.clone());
        Self {
            spec: ArcSwap::from_pointee(spec),
            status: ArcSwap::from_pointee(status),
            status_tx,
            last_good: Mutex::new(None),
            operation: Mutex::new(None),
            history: Mutex::new(History::default()),
            slot: tokio::sync::Mutex::new(None),
        }
    }

    fn compose(&self) -> AppStatus {
        let mut st = (**self.status.load()).clone();
        st.operation = lock(&self.operation).clone();
        st.history = lock(&self.history).entries.clone();
        st
    }

    fn publish(&self, status: AppStatus) {
        self.status.store(Arc::new(status));
        self.notify();
    }

    fn notify(&self) { let _ = self.status_tx.send_replace(self.compose()); }

    /// Oldest entries go first once `limit` is exceeded.
    fn record_history(&self, op: &SyncOperation, limit: Option<usize>) {
        let mut h = lock(&self.history);
        let entry = HistoryEntry { id: h.next_id, revision: op.revision.clone(), deployed_at: op.finished_at.unwrap_or_else(Utc::now), operation: op.id };
        h.next_id += 1;
        h.entries.push(entry);
        if let Some(limit) = limit {
            let excess = h.entries.len().saturating_sub(limit);
            h.entries = h.entries.split_off(excess);
        }
    }
}

struct Pass {
    comparison: AppComparison,
    revision: String,
    render_error: Option<String>,
    project: AppProject,
}

struct Inner {
    cluster: Arc<dyn ClusterClient>,
    renderer: Arc<dyn ManifestRenderer>,
    settings: Settings,
    tracker: ResourceTracker,
    exclusions: ResourceExclusions,
    health: Arc<HealthRegistry>,
    diff_registry: DiffRegistry,
    apps: RwLock<FxHashMap<String, Arc<AppHandle>>>,
    shutdown: CancellationToken,
}

/// In-process `DriftApi`. Cheap to clone; clones share every application.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(cluster: Arc<dyn ClusterClient>, renderer: Arc<dyn ManifestRenderer>, settings: Settings) -> Self {
        Self::with_registries(cluster, renderer, settings, HealthRegistry::default(), DiffRegistry::default())
    }

    pub fn with_registries(
        cluster: Arc<dyn ClusterClient>,
        renderer: Arc<dyn ManifestRenderer>,
        settings: Settings,
        health: HealthRegistry,
        diff_registry: DiffRegistry,
    ) -> Self {
        let tracker = settings.tracker();
        let exclusions = settings.resource_exclusions();
        info!(tracking = ?tracker.method, label = %tracker.label_key, projects = settings.projects.len(), "engine ready");
        Self {
            inner: Arc::new(Inner {
                cluster,
                renderer,
                settings,
                tracker,
                exclusions,
                health: Arc::new(health),
                diff_registry,
                apps: RwLock::new(FxHashMap::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &Settings { &self.inner.settings }

    pub fn apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.apps.read().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop background refresh loops.
    pub fn shutdown(&self) { self.inner.shutdown.cancel(); }

    fn handle(&self, app: &str) -> DriftResult<Arc<AppHandle>> {
        self.inner
            .apps
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(app)
            .cloned()
            .ok_or_else(|| DriftError::NotFound(format!("application {} not found", app)))
    }

    fn server(&self, spec: &AppSpec) -> String {
        if spec.destination.server.is_empty() { self.inner.settings.server.clone() } else { spec.destination.server.clone() }
    }

    fn ignore_rules(&self, spec: &AppSpec) -> Vec<IgnoreRule> {
        self.inner.settings.resource_overrides.iter().chain(spec.ignore_differences.iter()).cloned().collect()
    }

    async fn is_namespaced(&self, key: &ResourceKey) -> bool {
        let gk = key.group_kind();
        match self.inner.cluster.is_namespaced(&gk).await {
            Ok(v) => v,
            Err(e) => {
                debug!(kind = %gk.kind, error = %e, "scope lookup failed; using built-in table");
                !is_cluster_scoped_builtin(&gk)
            }
        }
    }

    /// Render, read live state and compare. A render failure falls back to the last
    /// successfully rendered manifests when there are any.
    async fn compare_pass(&self, h: &AppHandle) -> DriftResult<Pass> {
        let spec = h.spec.load_full();
        let project = self
            .inner
            .settings
            .project(spec.project_name())
            .ok_or_else(|| DriftError::Invalid(format!("application references project {} which does not exist", spec.project_name())))?;

        let (rendered, render_error) = match self.inner.renderer.render(&spec.source).await {
            Ok(r) => {
                *lock(&h.last_good) = Some(r.clone());
                (r, None)
            }
            Err(e) => {
                let fallback = lock(&h.last_good).clone();
                match fallback {
                    Some(r) => {
                        warn!(app = %spec.name, error = %e, revision = %r.revision, "render failed; comparing last rendered state");
                        let msg = match e {
                            DriftError::Render(m) => m,
                            other => other.to_string(),
                        };
                        (r, Some(msg))
                    }
                    None => return Err(e),
                }
            }
        };

        let mut desired = Vec::with_capacity(rendered.manifests.len());
        for m in rendered.manifests.iter() {
            let mut d = DesiredResource::from_manifest(m.clone())?;
            if d.key.namespace.is_empty() && self.is_namespaced(&d.key).await {
                d.default_namespace(&spec.destination.namespace);
            }
            desired.push(d);
        }
        let live = self.inner.cluster.list(None).await.map_err(cluster_err)?;
        let rules = self.ignore_rules(&spec);
        let server = self.server(&spec);
        let comparison = compare_app_state(&CompareInput {
            app: &spec.name,
            source_repo: &spec.source.repo_url,
            server: &server,
            cluster: &self.inner.settings.cluster_name,
            namespace: &spec.destination.namespace,
            desired: &desired,
            live: &live,
            tracker: &self.inner.tracker,
            ignore_rules: &rules,
            diff_registry: &self.inner.diff_registry,
            health: &self.inner.health,
            exclusions: &self.inner.exclusions,
            project: &project,
        });
        Ok(Pass { comparison, revision: rendered.revision, render_error, project })
    }

    /// Full reconciliation pass; conditions are replaced wholesale.
    async fn refresh_handle(&self, h: &AppHandle) -> AppStatus {
        let t0 = Instant::now();
        let name = h.spec.load().name.clone();
        let next = match self.compare_pass(h).await {
            Ok(pass) => {
                let cmp = pass.comparison;
                let mut conditions = cmp.conditions;
                if let Some(msg) = pass.render_error {
                    conditions.push(Condition::new(ConditionKind::RenderError, msg));
                }
                AppStatus {
                    sync: cmp.sync,
                    health: cmp.health,
                    revision: Some(pass.revision),
                    conditions,
                    resources: cmp.resources,
                    orphaned: cmp.orphaned,
                    reconciled_at: Some(Utc::now()),
                    ..AppStatus::unknown(name.clone())
                }
            }
            Err(e) => {
                warn!(app = %name, error = %e, "comparison failed");
                let prev = h.status.load_full();
                AppStatus {
                    revision: prev.revision.clone(),
                    conditions: vec![failure_condition(&e)],
                    resources: prev.resources.clone(),
                    orphaned: prev.orphaned.clone(),
                    reconciled_at: Some(Utc::now()),
                    ..AppStatus::unknown(name.clone())
                }
            }
        };
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(app = %name, sync = %next.sync, health = %next.health, conditions = next.conditions.len(), took_ms = %t0.elapsed().as_millis(), "reconciled");
        h.publish(next);
        h.compose()
    }

    async fn refresh_all(&self) {
        let handles: Vec<Arc<AppHandle>> = self.inner.apps.read().unwrap_or_else(|p| p.into_inner()).values().cloned().collect();
        join_all(handles.iter().map(|h| self.refresh_handle(h))).await;
    }

    async fn run_operation(
        self,
        h: Arc<AppHandle>,
        plan: SyncPlan,
        op: SyncOperation,
        cancel: CancellationToken,
        updates: watch::Sender<SyncOperation>,
        done: watch::Sender<Option<SyncOperation>>,
    ) {
        let guard = DoneGuard { h: h.clone(), done, started: op.clone() };
        let spec = h.spec.load_full();
        let mut rx = updates.subscribe();
        let forward = {
            let h = h.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let current = rx.borrow_and_update().clone();
                    *lock(&h.operation) = Some(current);
                    h.notify();
                }
            })
        };
        let ctx = SyncContext::new(spec.name.clone(), self.inner.cluster.clone(), self.inner.health.clone()).with_settings(self.inner.settings.sync.clone());
        let finished = ctx.execute(&plan, op, cancel, &updates).await;
        drop(updates);
        let _ = forward.await;

        if finished.phase == OperationPhase::Succeeded && !finished.request.dry_run {
            h.record_history(&finished, spec.revision_history_limit.or(self.inner.settings.history_limit));
        }
        *lock(&h.operation) = Some(finished.clone());
        self.refresh_handle(&h).await;
        guard.finish(finished);
    }

    /// Refresh every application whenever `store` publishes a new snapshot.
    pub fn attach_store(&self, store: BackendHandle) -> JoinHandle<()> {
        let engine = self.clone();
        let mut epochs = store.subscribe_epoch();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = epochs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let epoch = *epochs.borrow_and_update();
                        debug!(epoch, "live state changed; refreshing applications");
                        engine.refresh_all().await;
                    }
                }
            }
        })
    }

    /// Watch the cluster into a live-state cache and refresh on every change.
    pub fn watch_live(&self, namespace: Option<String>) -> (BackendHandle, JoinHandle<()>) {
        let (tx, backend) = spawn_ingest(queue_cap());
        let cluster = self.inner.cluster.clone();
        let shutdown = self.inner.shutdown.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                res = cluster.watch(namespace.as_deref(), tx) => {
                    if let Err(e) = res {
                        warn!(error = %e, "live watch ended");
                    }
                }
            }
        });
        self.attach_store(backend.clone());
        (backend, watcher)
    }
}

#[async_trait]
impl DriftApi for Engine {
    async fn register_app(&self, spec: AppSpec) -> DriftResult<AppStatus> {
        if spec.name.trim().is_empty() {
            return Err(DriftError::Invalid("application name is required".into()));
        }
        let name = spec.name.clone();
        let h = {
            let mut apps = self.inner.apps.write().unwrap_or_else(|p| p.into_inner());
            match apps.get(&name) {
                Some(h) => {
                    h.spec.store(Arc::new(spec));
                    h.clone()
                }
                None => {
                    let h = Arc::new(AppHandle::new(spec));
                    apps.insert(name.clone(), h.clone());
                    h
                }
            }
        };
        info!(app = %name, "application registered");
        Ok(self.refresh_handle(&h).await)
    }

    async fn get_status(&self, app: &str) -> DriftResult<AppStatus> { Ok(self.handle(app)?.compose()) }

    async fn refresh(&self, app: &str) -> DriftResult<AppStatus> {
        let h = self.handle(app)?;
        Ok(self.refresh_handle(&h).await)
    }

    async fn request_sync(&self, app: &str, request: SyncRequest) -> DriftResult<Uuid> {
        let h = self.handle(app)?;
        let mut slot = h.slot.lock().await;
        if slot.as_ref().map_or(false, |r| r.is_active()) {
            return Err(DriftError::AlreadyRunning);
        }
        let spec = h.spec.load_full();
        let pass = self.compare_pass(&h).await?;
        if let Some(msg) = pass.render_error {
            return Err(DriftError::Render(msg));
        }
        let server = self.server(&spec);
        let app_request = PolicyRequest { source_repo: &spec.source.repo_url, server: &server, namespace: &spec.destination.namespace, resource: None };
        if let Some(v) = pass.project.check(&app_request) {
            return Err(DriftError::PolicyViolation(v.to_string()));
        }
        if pass.comparison.resources.iter().any(|r| !r.permitted) {
            let msgs: Vec<&str> =
                pass.comparison.conditions.iter().filter(|c| c.kind == ConditionKind::InvalidSpecError).map(|c| c.message.as_str()).collect();
            return Err(DriftError::PolicyViolation(msgs.join("; ")));
        }

        let app_options = SyncOptions::parse_list(&spec.sync_options);
        let rules = self.ignore_rules(&spec);
        let plan = SyncPlan::build(&PlanInput {
            comparison: &pass.comparison,
            request: &request,
            app_options: &app_options,
            ignore_rules: &rules,
            namespace: &spec.destination.namespace,
        })?;

        let op = SyncOperation::new(app, pass.revision, request);
        let id = op.id;
        let cancel = CancellationToken::new();
        let (updates_tx, _) = watch::channel(op.clone());
        let (done_tx, done_rx) = watch::channel(None);
        *lock(&h.operation) = Some(op.clone());
        h.notify();
        *slot = Some(RunningOp { id, cancel: cancel.clone(), done: done_rx });
        drop(slot);

        info!(app = %app, op = %id, revision = %op.revision, tasks = plan.tasks.len(), "sync requested");
        tokio::spawn(self.clone().run_operation(h, plan, op, cancel, updates_tx, done_tx));
        Ok(id)
    }

    async fn wait_operation(&self, app: &str, id: Uuid) -> DriftResult<SyncOperation> {
        let h = self.handle(app)?;
        let mut done = {
            let slot = h.slot.lock().await;
            match slot.as_ref() {
                Some(r) if r.id == id => r.done.clone(),
                _ => return Err(DriftError::NotFound(format!("operation {} not found", id))),
            }
        };
        loop {
            let current = done.borrow_and_update().clone();
            if let Some(op) = current {
                return Ok(op);
            }
            done.changed().await.map_err(|_| DriftError::Internal("operation ended without a result".into()))?;
        }
    }

    async fn terminate(&self, app: &str) -> DriftResult<()> {
        let h = self.handle(app)?;
        let slot = h.slot.lock().await;
        match slot.as_ref() {
            Some(r) if r.is_active() => {
                info!(app = %app, op = %r.id, "terminating operation");
                r.cancel.cancel();
                Ok(())
            }
            _ => Err(DriftError::Invalid("no operation is in progress".into())),
        }
    }

    async fn delete_app(&self, app: &str, cascade: bool) -> DriftResult<Vec<ResourceKey>> {
        let h = self.handle(app)?;
        let running = {
            let slot = h.slot.lock().await;
            slot.as_ref().filter(|r| r.is_active()).map(|r| {
                r.cancel.cancel();
                r.done.clone()
            })
        };
        if let Some(mut done) = running {
            while done.borrow().is_none() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }

        let mut deleted = Vec::new();
        if cascade {
            let spec = h.spec.load_full();
            let auto_namespace = SyncOptions::parse_list(&spec.sync_options).create_namespace();
            let cluster_name = &self.inner.settings.cluster_name;
            let live = self.inner.cluster.list(None).await.map_err(cluster_err)?;
            let mut owned: Vec<LiveResource> = live
                .into_iter()
                .filter(|l| self.inner.tracker.is_owned_by(l, &spec.name))
                .filter(|l| !self.inner.exclusions.is_excluded(&l.key.group_kind(), cluster_name))
                .filter(|l| !(auto_namespace && l.key.group.is_empty() && l.key.kind == "Namespace" && l.key.name == spec.destination.namespace))
                .collect();
            owned.sort_by(|a, b| kind_rank(&b.key.kind).cmp(&kind_rank(&a.key.kind)).then_with(|| a.key.cmp(&b.key)));
            for l in owned {
                match self.inner.cluster.delete(&l.key, false).await {
                    Ok(()) | Err(ClusterError::NotFound(_)) => deleted.push(l.key),
                    Err(e) => return Err(DriftError::Apply(format!("{}: {}", l.key, e))),
                }
            }
        }
        self.inner.apps.write().unwrap_or_else(|p| p.into_inner()).remove(app);
        info!(app = %app, cascade, deleted = deleted.len(), "application deleted");
        Ok(deleted)
    }

    async fn resources(&self, app: &str) -> DriftResult<ResourceListing> {
        let st = self.handle(app)?.compose();
        Ok(ResourceListing { managed: st.resources, orphaned: st.orphaned })
    }

    async fn diff(&self, app: &str) -> DriftResult<Vec<ResourceDiff>> {
        let h = self.handle(app)?;
        let pass = self.compare_pass(&h).await?;
        Ok(pass
            .comparison
            .diffs
            .values()
            .filter(|d| !d.equal)
            .map(|d| ResourceDiff { key: d.key.clone(), state: d.state, text: render_text_diff(d) })
            .collect())
    }

    fn watch_status(&self, app: &str) -> DriftResult<watch::Receiver<AppStatus>> { Ok(self.handle(app)?.status_tx.subscribe()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::{HealthStatusCode, SyncStatusCode};

    #[test]
    fn history_is_trimmed_oldest_first() {
        let h = AppHandle::new(AppSpec::new("guestbook", "guestbook", "prod"));
        for rev in ["a", "b", "c"] {
            let mut op = SyncOperation::new("guestbook", rev, SyncRequest::default());
            op.phase = OperationPhase::Succeeded;
            h.record_history(&op, Some(2));
        }
        let st = h.compose();
        let revs: Vec<&str> = st.history.iter().map(|e| e.revision.as_str()).collect();
        assert_eq!(revs, vec!["b", "c"]);
        assert_eq!(st.history[1].id, 2);
        assert_eq!(st.health, HealthStatusCode::Unknown);
        assert_eq!(st.sync, SyncStatusCode::Unknown);
    }

    #[test]
    fn failure_conditions_by_error() {
        assert_eq!(failure_condition(&DriftError::Render("boom".into())).kind, ConditionKind::RenderError);
        assert_eq!(failure_condition(&DriftError::Invalid("no project".into())).message, "no project");
        assert_eq!(failure_condition(&DriftError::Internal("x".into())).kind, ConditionKind::ComparisonError);
    }

    #[test]
    fn aborted_run_frees_the_slot() {
        let h = Arc::new(AppHandle::new(AppSpec::new("guestbook", "guestbook", "prod")));
        let op = SyncOperation::new("guestbook", "rev-1", SyncRequest::default());
        let (done_tx, done_rx) = watch::channel(None);
        let running = RunningOp { id: op.id, cancel: CancellationToken::new(), done: done_rx };
        assert!(running.is_active());

        drop(DoneGuard { h: h.clone(), done: done_tx, started: op.clone() });
        assert!(!running.is_active());
        let recorded = running.done.borrow().clone().unwrap();
        assert_eq!(recorded.phase, OperationPhase::Error);
        assert_eq!(h.compose().operation.map(|o| o.phase), Some(OperationPhase::Error));
    }

    #[test]
    fn dropped_sender_is_inactive() {
        let (done_tx, done_rx) = watch::channel::<Option<SyncOperation>>(None);
        let running = RunningOp { id: Uuid::new_v4(), cancel: CancellationToken::new(), done: done_rx };
        drop(done_tx);
        assert!(!running.is_active());
    }

    #[test]
    fn finished_run_keeps_its_result() {
        let h = Arc::new(AppHandle::new(AppSpec::new("guestbook", "guestbook", "prod")));
        let mut op = SyncOperation::new("guestbook", "rev-1", SyncRequest::default());
        let (done_tx, done_rx) = watch::channel(None);
        DoneGuard { h, done: done_tx, started: op.clone() }.finish({
            op.phase = OperationPhase::Succeeded;
            op
        });
        assert_eq!(done_rx.borrow().as_ref().map(|o| o.phase), Some(OperationPhase::Succeeded));
    }
}
