//! One comparison pass: tracker, diff, filter, health and aggregation wired together.

use std::collections::{BTreeMap, BTreeSet};

use drift_core::{Condition, ConditionKind, DesiredResource, HealthStatusCode, LiveResource, ResourceKey, ResourceStatus, SyncStatusCode};
use drift_diff::{compare, DiffRegistry, DiffResult, IgnoreRule};
use drift_health::{aggregate_health, HealthRegistry};
use drift_track::ResourceTracker;
use serde::Serialize;
use tracing::debug;

use crate::aggregate::{aggregate, ResourceVerdict};
use crate::filter::{classify, excluded_condition, orphan_condition, ResourceExclusions};
use crate::policy::{PolicyRequest, ProjectPolicy};

/// Inputs of one pass. `desired` must already carry defaulted namespaces.
pub struct CompareInput<'a> {
    pub app: &'a str,
    pub source_repo: &'a str,
    pub server: &'a str,
    pub cluster: &'a str,
    pub namespace: &'a str,
    pub desired: &'a [DesiredResource],
    pub live: &'a [LiveResource],
    pub tracker: &'a ResourceTracker,
    pub ignore_rules: &'a [IgnoreRule],
    pub diff_registry: &'a DiffRegistry,
    pub health: &'a HealthRegistry,
    pub exclusions: &'a ResourceExclusions,
    pub project: &'a dyn ProjectPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppComparison {
    pub sync: SyncStatusCode,
    pub health: HealthStatusCode,
    pub conditions: Vec<Condition>,
    pub resources: Vec<ResourceStatus>,
    pub diffs: BTreeMap<ResourceKey, DiffResult>,
    /// Desired resources after tracking stamps, excluded and skipped ones removed; hooks kept.
    pub targets: Vec<DesiredResource>,
    /// Live objects for desired keys plus owned extras.
    pub live: BTreeMap<ResourceKey, LiveResource>,
    pub orphaned: Vec<ResourceKey>,
}

impl AppComparison {
    fn invalid(message: String) -> Self {
        Self {
            sync: SyncStatusCode::Unknown,
            health: HealthStatusCode::Unknown,
            conditions: vec![Condition::new(ConditionKind::InvalidSpecError, message)],
            resources: Vec::new(),
            diffs: BTreeMap::new(),
            targets: Vec::new(),
            live: BTreeMap::new(),
            orphaned: Vec::new(),
        }
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<&ResourceStatus> { self.resources.iter().find(|r| &r.key == key) }
}

pub fn compare_app_state(input: &CompareInput<'_>) -> AppComparison {
    let app_req = PolicyRequest { source_repo: input.source_repo, server: input.server, namespace: input.namespace, resource: None };
    if let Some(v) = input.project.check(&app_req) {
        return AppComparison::invalid(v.to_string());
    }

    let mut conditions = Vec::new();
    let mut targets = Vec::new();
    for d in input.desired {
        if d.is_skipped() {
            continue;
        }
        if input.exclusions.is_excluded(&d.key.group_kind(), input.cluster) {
            conditions.push(excluded_condition(&d.key));
            continue;
        }
        let mut d = d.clone();
        if let Err(e) = input.tracker.stamp(&mut d.manifest, input.app) {
            conditions.push(Condition::new(ConditionKind::ComparisonError, e.to_string()));
            continue;
        }
        targets.push(d);
    }

    let live_by_key: BTreeMap<&ResourceKey, &LiveResource> = input
        .live
        .iter()
        .filter(|l| !input.exclusions.is_excluded(&l.key.group_kind(), input.cluster))
        .map(|l| (&l.key, l))
        .collect();
    let desired_keys: BTreeSet<ResourceKey> = input.desired.iter().map(|d| d.key.clone()).collect();

    let mut verdicts = Vec::new();
    let mut diffs = BTreeMap::new();
    let mut live_out = BTreeMap::new();
    let mut health = Vec::new();

    let mut record = |key: &ResourceKey, desired: Option<&DesiredResource>, live: Option<&LiveResource>, conditions: &mut Vec<Condition>| {
        let mut st = ResourceStatus::new(key.clone(), SyncStatusCode::Unknown);
        st.hook = desired.map_or_else(|| live.map_or(false, |l| l.is_hook()), |d| d.is_hook());
        st.wave = desired.map(|d| d.wave).or_else(|| live.map(|l| l.wave())).unwrap_or(0);
        match compare(desired.map(|d| &d.manifest), live.map(|l| &l.object), input.ignore_rules, input.diff_registry) {
            Ok(r) => {
                st.status = if r.equal { SyncStatusCode::Synced } else { SyncStatusCode::OutOfSync };
                diffs.insert(key.clone(), r);
            }
            Err(e) => conditions.push(Condition::new(ConditionKind::ComparisonError, format!("{}: {}", key, e))),
        }
        if desired.is_none() {
            st.requires_pruning = true;
            st.ignore_extraneous = live.map_or(false, |l| l.compare_options().ignore_extraneous);
        }
        st.health = input.health.evaluate(&key.group_kind(), live.map(|l| &l.object));
        if let (Some(h), false) = (st.health.as_ref(), st.hook) {
            health.push(h.status);
        }
        if let Some(l) = live {
            live_out.insert(key.clone(), l.clone());
        }
        let req = PolicyRequest { resource: Some(key), ..app_req };
        verdicts.push(ResourceVerdict { violation: input.project.check(&req), status: st });
    };

    for d in targets.iter() {
        record(&d.key, Some(d), live_by_key.get(&d.key).copied(), &mut conditions);
    }
    for (&key, &l) in live_by_key.iter() {
        if desired_keys.contains(key) || !input.tracker.is_owned_by(l, input.app) {
            continue;
        }
        // Finished hooks linger; they are not prune candidates.
        if l.is_hook() {
            continue;
        }
        record(key, None, Some(l), &mut conditions);
    }

    let (sync, mut policy_conditions) = aggregate(&mut verdicts);
    conditions.append(&mut policy_conditions);

    let orphan_policy = input.project.orphan_policy();
    let classified = classify(
        input.live,
        &desired_keys,
        input.tracker,
        input.app,
        input.exclusions,
        input.cluster,
        orphan_policy,
        input.namespace,
    );
    if let Some(c) = orphan_condition(classified.orphaned.len(), orphan_policy) {
        conditions.push(c);
    }

    let mut resources: Vec<ResourceStatus> = verdicts.into_iter().map(|v| v.status).collect();
    resources.sort_by(|a, b| a.key.cmp(&b.key));
    debug!(app = input.app, sync = %sync, resources = resources.len(), orphaned = classified.orphaned.len(), "comparison done");
    AppComparison {
        sync,
        health: aggregate_health(health),
        conditions,
        resources,
        diffs,
        targets,
        live: live_out,
        orphaned: classified.orphaned,
    }
}
