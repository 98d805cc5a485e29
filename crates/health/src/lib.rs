//! Drift health: per-kind health checks and worst-case roll-up.

#![forbid(unsafe_code)]

use std::sync::Arc;

use drift_core::{GroupKind, HealthState, HealthStatusCode};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

pub mod builtin;

/// Health evaluation for one live object.
pub trait HealthCheck: Send + Sync {
    fn check(&self, live: &Json) -> anyhow::Result<HealthState>;
}

impl<F> HealthCheck for F
where
    F: Fn(&Json) -> anyhow::Result<HealthState> + Send + Sync,
{
    fn check(&self, live: &Json) -> anyhow::Result<HealthState> { self(live) }
}

/// Checks keyed by (group, kind). Caller overrides win over built-ins; lookup tries the exact
/// kind, then `(group, *)`.
#[derive(Clone)]
pub struct HealthRegistry {
    builtins: FxHashMap<GroupKind, Arc<dyn HealthCheck>>,
    overrides: FxHashMap<GroupKind, Arc<dyn HealthCheck>>,
}

impl Default for HealthRegistry {
    fn default() -> Self { Self::with_builtins() }
}

impl HealthRegistry {
    pub fn empty() -> Self { Self { builtins: FxHashMap::default(), overrides: FxHashMap::default() } }

    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        let mut add = |g: &str, k: &str, c: Arc<dyn HealthCheck>| {
            r.builtins.insert(GroupKind::new(g, k), c);
        };
        add("apps", "Deployment", Arc::new(builtin::deployment));
        add("apps", "StatefulSet", Arc::new(builtin::stateful_set));
        add("apps", "DaemonSet", Arc::new(builtin::daemon_set));
        add("apps", "ReplicaSet", Arc::new(builtin::replica_set));
        add("", "Pod", Arc::new(builtin::pod));
        add("batch", "Job", Arc::new(builtin::job));
        add("", "Service", Arc::new(builtin::service));
        add("", "PersistentVolumeClaim", Arc::new(builtin::persistent_volume_claim));
        add("networking.k8s.io", "Ingress", Arc::new(builtin::ingress));
        add("apiextensions.k8s.io", "CustomResourceDefinition", Arc::new(builtin::custom_resource_definition));
        add("", "Namespace", Arc::new(builtin::namespace));
        r
    }

    pub fn register(&mut self, gk: GroupKind, check: Arc<dyn HealthCheck>) { self.overrides.insert(gk, check); }

    pub fn lookup(&self, gk: &GroupKind) -> Option<Arc<dyn HealthCheck>> {
        let wildcard = GroupKind::new(gk.group.clone(), "*");
        self.overrides
            .get(gk)
            .or_else(|| self.overrides.get(&wildcard))
            .or_else(|| self.builtins.get(gk))
            .or_else(|| self.builtins.get(&wildcard))
            .cloned()
    }

    pub fn has_check(&self, gk: &GroupKind) -> bool { self.lookup(gk).is_some() }

    /// `None` when the kind has no check. Absent live objects are `Missing`; evaluation errors
    /// become `Unknown` with the error text.
    pub fn evaluate(&self, gk: &GroupKind, live: Option<&Json>) -> Option<HealthState> {
        let Some(live) = live else {
            return Some(HealthState::new(HealthStatusCode::Missing));
        };
        let check = self.lookup(gk)?;
        if live.pointer("/metadata/deletionTimestamp").map_or(false, |t| !t.is_null()) {
            return Some(HealthState::with_message(HealthStatusCode::Progressing, "Pending deletion"));
        }
        match check.check(live) {
            Ok(h) => Some(h),
            Err(e) => {
                debug!(kind = %gk, error = %e, "health check failed");
                Some(HealthState::with_message(HealthStatusCode::Unknown, format!("{:#}", e)))
            }
        }
    }
}

/// Worst status wins (Degraded > Progressing > Suspended > Missing > Unknown > Healthy);
/// no resources means Healthy.
pub fn aggregate_health(statuses: impl IntoIterator<Item = HealthStatusCode>) -> HealthStatusCode {
    statuses.into_iter().fold(HealthStatusCode::Healthy, |acc, s| if s.is_worse(acc) { s } else { acc })
}
