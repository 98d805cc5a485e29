#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use drift_api::{AppSpec, DriftApi, Engine, Settings, StaticRenderer, SyncOperation, SyncRequest, TrackingSettings};
use drift_core::{ConditionKind, DriftError, OperationPhase, ResourceKey, SyncStatusCode};
use drift_kubehub::{ClusterError, MemoryCluster};
use drift_status::{AppProject, ExclusionRule, OrphanPolicy};
use drift_sync::{Backoff, LabelSelector, ResultCode, RetryPolicy, SyncScope, SyncSettings};
use drift_track::TrackingMethod;
use serde_json::{json, Value as Json};

const APP: &str = "guestbook";

struct Env {
    cluster: Arc<MemoryCluster>,
    renderer: Arc<StaticRenderer>,
    engine: Engine,
}

fn fast(mut settings: Settings) -> Settings {
    settings.sync = SyncSettings { health_poll: Duration::from_millis(10), hook_timeout: Duration::from_secs(5), health_timeout: Duration::from_secs(5) };
    settings
}

impl Env {
    fn new() -> Self { Self::with_settings(Settings::default()) }

    fn with_settings(settings: Settings) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        let renderer = Arc::new(StaticRenderer::new());
        let engine = Engine::new(cluster.clone(), renderer.clone(), fast(settings));
        Self { cluster, renderer, engine }
    }

    /// Second engine over the same cluster and renderer.
    fn engine_with(&self, settings: Settings) -> Engine { Engine::new(self.cluster.clone(), self.renderer.clone(), fast(settings)) }

    async fn sync(&self, req: SyncRequest) -> SyncOperation {
        let id = self.engine.request_sync(APP, req).await.unwrap();
        self.engine.wait_operation(APP, id).await.unwrap()
    }
}

fn spec() -> AppSpec { AppSpec::new(APP, "guestbook", "prod").repo("https://example.com/guestbook.git") }

fn cm(name: &str, annotations: Json) -> Json {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "annotations": annotations}, "data": {"k": "v"}})
}

fn job(name: &str, annotations: Json) -> Json {
    json!({"apiVersion": "batch/v1", "kind": "Job", "metadata": {"name": name, "annotations": annotations}, "spec": {"template": {"spec": {"containers": []}}}})
}

fn cm_key(name: &str) -> ResourceKey { ResourceKey::new("", "ConfigMap", "prod", name) }

fn labelled(mut v: Json) -> Json {
    v["metadata"]["namespace"] = json!("prod");
    v["metadata"]["labels"] = json!({"app.kubernetes.io/instance": APP});
    v
}

#[tokio::test]
async fn sync_refresh_and_history() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    let st = env.engine.register_app(spec()).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::OutOfSync);

    let op = env.sync(SyncRequest::default()).await;
    assert_eq!(op.phase, OperationPhase::Succeeded);
    let st = env.engine.get_status(APP).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::Synced);
    assert_eq!(st.revision.as_deref(), Some("rev-1"));
    assert_eq!(st.history.len(), 1);
    assert_eq!(st.operation.as_ref().map(|o| o.id), Some(op.id));

    env.cluster.remove(&cm_key("a"));
    let st = env.engine.refresh(APP).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::OutOfSync);
    assert_eq!(st.resource(&cm_key("a")).unwrap().status, SyncStatusCode::OutOfSync);

    env.renderer.set("guestbook", "rev-2", vec![cm("a", json!({}))]);
    let op = env.sync(SyncRequest::default()).await;
    assert_eq!(op.phase, OperationPhase::Succeeded);
    let st = env.engine.get_status(APP).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::Synced);
    let revs: Vec<&str> = st.history.iter().map(|h| h.revision.as_str()).collect();
    assert_eq!(revs, vec!["rev-1", "rev-2"]);
}

#[tokio::test]
async fn history_limit_drops_oldest() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    env.engine.register_app(spec().history_limit(1)).await.unwrap();
    env.sync(SyncRequest::default()).await;
    env.cluster.remove(&cm_key("a"));
    env.renderer.set("guestbook", "rev-2", vec![cm("a", json!({}))]);
    env.sync(SyncRequest::default()).await;
    let st = env.engine.get_status(APP).await.unwrap();
    assert_eq!(st.history.len(), 1);
    assert_eq!(st.history[0].revision, "rev-2");
    assert_eq!(st.history[0].id, 1);
}

#[tokio::test]
async fn dry_run_records_no_history() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    let op = env.sync(SyncRequest::default().dry_run(true)).await;
    assert_eq!(op.phase, OperationPhase::Succeeded);
    let st = env.engine.get_status(APP).await.unwrap();
    assert!(st.history.is_empty());
    assert_eq!(st.sync, SyncStatusCode::OutOfSync);
}

#[tokio::test]
async fn prune_false_survives_pruning_sync() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({})), cm("b", json!({"drift.dev/sync-options": "Prune=false"}))]);
    env.engine.register_app(spec()).await.unwrap();
    env.sync(SyncRequest::default()).await;

    env.renderer.set("guestbook", "rev-2", vec![cm("a", json!({}))]);
    let op = env.sync(SyncRequest::default().prune(true)).await;
    assert_eq!(op.phase, OperationPhase::Succeeded);
    let b = op.resource(&cm_key("b")).unwrap();
    assert_eq!(b.status, ResultCode::PruneSkipped);
    assert_eq!(b.message, "ignored (no prune)");
    assert!(env.cluster.contains(&cm_key("b")));

    let st = env.engine.get_status(APP).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::OutOfSync);
    let b = st.resource(&cm_key("b")).unwrap();
    assert_eq!(b.status, SyncStatusCode::OutOfSync);
    assert!(b.requires_pruning);
}

#[tokio::test]
async fn tracking_switch_changes_ownership() {
    let annotation = Settings { tracking: TrackingSettings { method: Some(TrackingMethod::Annotation), label: None }, ..Settings::default() };
    let env = Env::with_settings(annotation);
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    env.sync(SyncRequest::default()).await;
    assert!(env.cluster.object(&cm_key("a")).unwrap()["metadata"]["annotations"].get("drift.dev/tracking-id").is_some());

    env.renderer.set("guestbook", "rev-2", vec![]);
    let st = env.engine.refresh(APP).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::OutOfSync);

    let label = Settings { tracking: TrackingSettings { method: Some(TrackingMethod::Label), label: None }, ..Settings::default() };
    let switched = env.engine_with(label);
    let st = switched.register_app(spec()).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::Synced);
    assert!(st.resource(&cm_key("a")).is_none());

    env.cluster.insert(labelled(cm("b", json!({}))));
    let st = switched.refresh(APP).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::OutOfSync);
    assert!(st.resource(&cm_key("b")).unwrap().requires_pruning);
}

#[tokio::test]
async fn orphan_warning_is_single_and_stable() {
    let project = AppProject { orphaned_resources: Some(OrphanPolicy::warn()), ..AppProject::permissive("default") };
    let env = Env::with_settings(Settings { projects: vec![project], ..Settings::default() });
    env.cluster.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "stray", "namespace": "prod"}}));
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    env.sync(SyncRequest::default()).await;

    for _ in 0..3 {
        let st = env.engine.refresh(APP).await.unwrap();
        let warnings: Vec<_> = st.conditions.iter().filter(|c| c.kind == ConditionKind::OrphanedResourceWarning).collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "Application has 1 orphaned resources");
        assert_eq!(st.sync, SyncStatusCode::Synced);
    }
    let listing = env.engine.resources(APP).await.unwrap();
    assert_eq!(listing.orphaned, vec![cm_key("stray")]);
    assert!(listing.managed.iter().any(|r| r.key == cm_key("a")));
}

#[tokio::test]
async fn failing_hook_retried_once() {
    let env = Env::new();
    env.cluster.stamp_status_for(
        ResourceKey::new("batch", "Job", "prod", "migrate"),
        json!({"conditions": [{"type": "Failed", "status": "True", "message": "BackoffLimitExceeded"}]}),
    );
    env.renderer.set("guestbook", "rev-1", vec![job("migrate", json!({"drift.dev/hook": "PreSync"})), cm("a", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    let req = SyncRequest::default().retry(RetryPolicy::new(2, Backoff::fixed(Duration::from_secs(1))));
    let op = env.sync(req).await;
    assert_eq!(op.phase, OperationPhase::Failed);
    assert_eq!(op.retry_count, 1);
    assert_eq!(op.attempts.len(), 2);
    assert!(!env.cluster.contains(&cm_key("a")));
    assert!(env.engine.get_status(APP).await.unwrap().history.is_empty());
}

#[tokio::test]
async fn wave_failure_blocks_next_wave() {
    let env = Env::new();
    env.cluster.fail_on(cm_key("first"), ClusterError::Transport("connection reset".into()));
    env.renderer.set("guestbook", "rev-1", vec![cm("first", json!({"drift.dev/sync-wave": "0"})), cm("second", json!({"drift.dev/sync-wave": "1"}))]);
    env.engine.register_app(spec()).await.unwrap();
    let op = env.sync(SyncRequest::default()).await;
    assert_eq!(op.phase, OperationPhase::Failed);
    assert!(env.cluster.ops().iter().all(|o| o.key != cm_key("second")));
}

#[tokio::test]
async fn replace_reports_created_then_replaced() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({"drift.dev/sync-options": "Replace=true"}))]);
    env.engine.register_app(spec()).await.unwrap();
    let first = env.sync(SyncRequest::default()).await;
    assert_eq!(first.resource(&cm_key("a")).unwrap().message, "configmap/a created");
    let second = env.sync(SyncRequest::default()).await;
    assert_eq!(second.resource(&cm_key("a")).unwrap().message, "configmap/a replaced");
}

#[tokio::test]
async fn second_request_is_rejected_and_terminate_fails_op() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![job("wait", json!({"drift.dev/hook": "PreSync"})), cm("a", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    let id = env.engine.request_sync(APP, SyncRequest::default()).await.unwrap();
    assert_eq!(env.engine.request_sync(APP, SyncRequest::default()).await.unwrap_err(), DriftError::AlreadyRunning);

    tokio::time::sleep(Duration::from_millis(50)).await;
    env.engine.terminate(APP).await.unwrap();
    let op = env.engine.wait_operation(APP, id).await.unwrap();
    assert_eq!(op.phase, OperationPhase::Failed);
    assert_eq!(op.message, "Operation terminated");
    assert!(!env.cluster.contains(&cm_key("a")));
    assert!(env.engine.terminate(APP).await.is_err());
}

#[tokio::test]
async fn secret_values_never_surface() {
    let env = Env::new();
    env.cluster.insert(labelled(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "db"}, "data": {"password": "b2xk"}})));
    env.renderer.set(
        "guestbook",
        "rev-1",
        vec![json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "db"}, "stringData": {"password": "hunter2"}})],
    );
    let st = env.engine.register_app(spec()).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::OutOfSync);
    let diffs = env.engine.diff(APP).await.unwrap();
    assert_eq!(diffs.len(), 1);
    assert!(!diffs[0].text.contains("hunter2"));
    assert!(!diffs[0].text.contains("b2xk"));
    assert!(!serde_json::to_string(&st).unwrap().contains("b2xk"));
}

#[tokio::test]
async fn invalid_manifest_rejects_sync_unless_validation_disabled() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("Bad_Name", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    let err = env.engine.request_sync(APP, SyncRequest::default()).await.unwrap_err();
    assert!(matches!(err, DriftError::Validation(ref m) if m.starts_with("error validating data")));
    assert!(env.cluster.ops().is_empty());

    env.renderer.set("guestbook", "rev-2", vec![cm("Bad_Name", json!({"drift.dev/sync-options": "Validate=false"}))]);
    let op = env.sync(SyncRequest::default()).await;
    assert_eq!(op.phase, OperationPhase::Succeeded);
}

#[tokio::test]
async fn empty_selector_match_is_rejected() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    let req = SyncRequest::default().scope(SyncScope::Selector(LabelSelector::parse("tier=db").unwrap()));
    let err = env.engine.request_sync(APP, req).await.unwrap_err();
    assert!(matches!(err, DriftError::Invalid(_)));
}

#[tokio::test]
async fn cascade_delete_spares_excluded_and_created_namespace() {
    let settings = Settings {
        exclusions: vec![ExclusionRule { api_groups: vec!["example.com".into()], kinds: vec!["Widget".into()], clusters: vec![] }],
        ..Settings::default()
    };
    let env = Env::with_settings(settings);
    env.cluster.insert(labelled(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}})));
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    env.engine.register_app(spec().sync_option("CreateNamespace=true")).await.unwrap();
    let op = env.sync(SyncRequest::default()).await;
    assert_eq!(op.phase, OperationPhase::Succeeded);
    let ns = ResourceKey::new("", "Namespace", "", "prod");
    assert!(env.cluster.contains(&ns));

    let deleted = env.engine.delete_app(APP, true).await.unwrap();
    assert_eq!(deleted, vec![cm_key("a")]);
    assert!(env.cluster.contains(&ns));
    assert!(env.cluster.contains(&ResourceKey::new("example.com", "Widget", "prod", "w")));
    assert!(matches!(env.engine.get_status(APP).await.unwrap_err(), DriftError::NotFound(_)));
}

#[tokio::test]
async fn render_failure_keeps_last_good_state() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    env.sync(SyncRequest::default()).await;

    env.renderer.fail("guestbook", "kustomize build failed");
    let st = env.engine.refresh(APP).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::Synced);
    assert_eq!(st.revision.as_deref(), Some("rev-1"));
    assert!(st.conditions.iter().any(|c| c.kind == ConditionKind::RenderError && c.message == "kustomize build failed"));

    let fresh = Env::new();
    fresh.renderer.fail("guestbook", "no such path");
    let st = fresh.engine.register_app(spec()).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::Unknown);
    assert_eq!(st.conditions.len(), 1);
    assert_eq!(st.conditions[0].kind, ConditionKind::RenderError);
}

#[tokio::test]
async fn unknown_project_is_invalid_spec() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    let st = env.engine.register_app(spec().project("missing")).await.unwrap();
    assert_eq!(st.sync, SyncStatusCode::Unknown);
    assert_eq!(st.conditions[0].kind, ConditionKind::InvalidSpecError);
    assert!(matches!(env.engine.request_sync(APP, SyncRequest::default()).await.unwrap_err(), DriftError::Invalid(_)));
}

#[tokio::test]
async fn forbidden_kind_rejects_sync() {
    let project = AppProject { namespace_resource_blacklist: vec![drift_status::GroupKindPattern { group: "".into(), kind: "Secret".into() }], ..AppProject::permissive("default") };
    let env = Env::with_settings(Settings { projects: vec![project], ..Settings::default() });
    env.renderer.set(
        "guestbook",
        "rev-1",
        vec![cm("a", json!({})), json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "db"}, "stringData": {"k": "v"}})],
    );
    let st = env.engine.register_app(spec()).await.unwrap();
    assert_eq!(st.resource(&ResourceKey::new("", "Secret", "prod", "db")).unwrap().status, SyncStatusCode::Unknown);
    assert_eq!(st.sync, SyncStatusCode::OutOfSync);
    assert!(matches!(env.engine.request_sync(APP, SyncRequest::default()).await.unwrap_err(), DriftError::PolicyViolation(_)));
}

#[tokio::test]
async fn live_watch_triggers_refresh() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    env.sync(SyncRequest::default()).await;
    let mut status = env.engine.watch_status(APP).unwrap();

    let (backend, _watcher) = env.engine.watch_live(Some("prod".into()));
    let mut epochs = backend.subscribe_epoch();
    tokio::time::timeout(Duration::from_secs(2), epochs.changed()).await.unwrap().unwrap();
    assert!(backend.current().get(&cm_key("a")).is_some());

    env.cluster.remove(&cm_key("a"));
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if status.borrow_and_update().sync == SyncStatusCode::OutOfSync {
                break;
            }
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    env.engine.shutdown();
}

#[tokio::test]
async fn sync_is_refused_while_rendering_fails() {
    let env = Env::new();
    env.renderer.set("guestbook", "rev-1", vec![cm("a", json!({}))]);
    env.engine.register_app(spec()).await.unwrap();
    env.sync(SyncRequest::default()).await;
    env.cluster.remove(&cm_key("a"));
    env.cluster.clear_ops();

    env.renderer.fail("guestbook", "kustomize build failed");
    let err = env.engine.request_sync(APP, SyncRequest::default()).await.unwrap_err();
    assert_eq!(err, DriftError::Render("kustomize build failed".into()));
    assert!(env.cluster.ops().is_empty());
    assert!(!env.cluster.contains(&cm_key("a")));
    let st = env.engine.get_status(APP).await.unwrap();
    assert_eq!(st.history.len(), 1);
    assert_eq!(st.operation.map(|o| o.phase), Some(OperationPhase::Succeeded));
}
