//! Drift application API façade (in-process).
//!
//! Frontends depend on the `DriftApi` trait and the types here; `Engine` is the in-process
//! implementation wiring renderer, cluster client, comparison and sync together.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use drift_core::{Condition, DriftResult, HealthStatusCode, ResourceKey, ResourceStatus, SyncStatusCode};
use drift_diff::{DiffState, IgnoreRule};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

mod engine;
pub mod render;
pub mod settings;

pub use drift_sync::{SyncOperation, SyncRequest};
pub use engine::Engine;
pub use render::{DirectoryRenderer, ManifestRenderer, Rendered, SourceRef, StaticRenderer};
pub use settings::{Settings, TrackingSettings, DEFAULT_CLUSTER, DEFAULT_PROJECT, DEFAULT_SERVER};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Destination {
    /// Empty means the engine's configured server.
    pub server: String,
    pub namespace: String,
}

/// Registered application: where manifests come from and where they go.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSpec {
    pub name: String,
    /// Empty means the `default` project.
    pub project: String,
    pub source: SourceRef,
    pub destination: Destination,
    /// Application-level sync options, e.g. `CreateNamespace=true`.
    pub sync_options: Vec<String>,
    pub ignore_differences: Vec<IgnoreRule>,
    /// Overrides the engine-wide history limit.
    pub revision_history_limit: Option<usize>,
}

impl AppSpec {
    pub fn new(name: impl Into<String>, path: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: SourceRef::new("", path),
            destination: Destination { server: String::new(), namespace: namespace.into() },
            ..Default::default()
        }
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn repo(mut self, repo_url: impl Into<String>) -> Self {
        self.source.repo_url = repo_url.into();
        self
    }

    pub fn sync_option(mut self, option: impl Into<String>) -> Self {
        self.sync_options.push(option.into());
        self
    }

    pub fn ignore(mut self, rule: IgnoreRule) -> Self {
        self.ignore_differences.push(rule);
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.revision_history_limit = Some(limit);
        self
    }

    pub fn project_name(&self) -> &str { if self.project.is_empty() { DEFAULT_PROJECT } else { &self.project } }
}

/// One successful, non-dry-run sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub revision: String,
    pub deployed_at: DateTime<Utc>,
    pub operation: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub app: String,
    pub sync: SyncStatusCode,
    pub health: HealthStatusCode,
    /// Revision of the desired state last compared.
    pub revision: Option<String>,
    pub conditions: Vec<Condition>,
    pub resources: Vec<ResourceStatus>,
    pub orphaned: Vec<ResourceKey>,
    /// The running operation, or the last finished one.
    pub operation: Option<SyncOperation>,
    pub history: Vec<HistoryEntry>,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl AppStatus {
    pub fn unknown(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            sync: SyncStatusCode::Unknown,
            health: HealthStatusCode::Unknown,
            revision: None,
            conditions: Vec::new(),
            resources: Vec::new(),
            orphaned: Vec::new(),
            operation: None,
            history: Vec::new(),
            reconciled_at: None,
        }
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<&ResourceStatus> { self.resources.iter().find(|r| &r.key == key) }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceListing {
    pub managed: Vec<ResourceStatus>,
    pub orphaned: Vec<ResourceKey>,
}

/// Text diff of one resource that is not in sync; Secret values are masked.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    pub key: ResourceKey,
    pub state: DiffState,
    pub text: String,
}

/// Application surface.
#[async_trait::async_trait]
pub trait DriftApi: Send + Sync {
    /// Register (or update) an application and run a first comparison.
    async fn register_app(&self, spec: AppSpec) -> DriftResult<AppStatus>;

    async fn get_status(&self, app: &str) -> DriftResult<AppStatus>;

    /// Re-render and re-compare now.
    async fn refresh(&self, app: &str) -> DriftResult<AppStatus>;

    /// Start a sync operation. Rejected with `AlreadyRunning` while another is in flight,
    /// and with a render, validation or policy error before anything is issued.
    async fn request_sync(&self, app: &str, request: SyncRequest) -> DriftResult<Uuid>;

    /// Block until the operation is terminal and its bookkeeping recorded.
    async fn wait_operation(&self, app: &str, id: Uuid) -> DriftResult<SyncOperation>;

    async fn terminate(&self, app: &str) -> DriftResult<()>;

    /// Unregister; with `cascade`, delete every owned live object first.
    async fn delete_app(&self, app: &str, cascade: bool) -> DriftResult<Vec<ResourceKey>>;

    async fn resources(&self, app: &str) -> DriftResult<ResourceListing>;

    async fn diff(&self, app: &str) -> DriftResult<Vec<ResourceDiff>>;

    /// Status updates, one per comparison pass or operation change.
    fn watch_status(&self, app: &str) -> DriftResult<watch::Receiver<AppStatus>>;
}
