//! Turning one comparison into ordered sync tasks.

use std::collections::BTreeMap;

use drift_core::annotations::{HookDeletePolicy, HookType, SyncOptions};
use drift_core::{labels_of, DriftError, DriftResult, ResourceKey};
use drift_diff::{ignored_pointers_for, IgnoreRule};
use drift_status::AppComparison;
use serde_json::{json, Value as Json};
use smallvec::SmallVec;

use crate::options::SyncRequest;
use crate::result::SyncPhase;
use crate::validate::validate_manifest;

/// Apply order of well-known kinds inside one wave; anything else goes last.
const KIND_ORDER: &[&str] = &[
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "IngressClass",
    "Ingress",
    "APIService",
];

pub fn kind_rank(kind: &str) -> usize { KIND_ORDER.iter().position(|k| *k == kind).unwrap_or(KIND_ORDER.len()) }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Apply,
    Prune,
}

#[derive(Debug, Clone)]
pub struct SyncTask {
    pub key: ResourceKey,
    pub phase: SyncPhase,
    pub wave: i32,
    pub action: TaskAction,
    pub hook: Option<HookType>,
    /// Stamped desired manifest (apply tasks only).
    pub manifest: Option<Json>,
    /// Live object when the comparison ran.
    pub live: Option<Json>,
    /// Resource options layered over the application and request options.
    pub options: SyncOptions,
    pub delete_policies: SmallVec<[HookDeletePolicy; 2]>,
    pub ignored: Vec<String>,
    pub in_sync: bool,
}

impl SyncTask {
    pub fn is_hook(&self) -> bool { self.hook.is_some() }

    pub fn kind_rank(&self) -> usize { kind_rank(&self.key.kind) }
}

/// Everything one operation will do, in execution order.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub tasks: Vec<SyncTask>,
    /// Destination namespace to create before anything else.
    pub namespace: Option<Json>,
}

pub struct PlanInput<'a> {
    pub comparison: &'a AppComparison,
    pub request: &'a SyncRequest,
    pub app_options: &'a SyncOptions,
    pub ignore_rules: &'a [IgnoreRule],
    pub namespace: &'a str,
}

impl SyncPlan {
    /// Build and validate the plan. Fails when a scoped request selects nothing or a
    /// manifest is rejected by client-side validation.
    pub fn build(input: &PlanInput<'_>) -> DriftResult<SyncPlan> {
        let req = input.request;
        let base = req.sync_options.overlay(input.app_options);
        let cmp = input.comparison;
        let mut tasks = Vec::new();
        let mut problems = Vec::new();

        for d in cmp.targets.iter() {
            if d.is_skipped() || !req.scope.includes(&d.key, &labels_of(&d.manifest)) {
                continue;
            }
            let options = d.options.overlay(&base);
            if options.validate() {
                for p in validate_manifest(&d.manifest) {
                    problems.push(format!("{}: {}", d.key, p));
                }
            }
            let live = cmp.live.get(&d.key).map(|l| l.object.clone());
            let diff = cmp.diffs.get(&d.key);
            let ignored = live.as_ref().map(|l| ignored_pointers_for(&d.key, l, input.ignore_rules)).unwrap_or_default();
            let task = SyncTask {
                key: d.key.clone(),
                phase: SyncPhase::Sync,
                wave: d.wave,
                action: TaskAction::Apply,
                hook: None,
                manifest: Some(d.manifest.clone()),
                live,
                options,
                delete_policies: d.delete_policies(),
                ignored,
                in_sync: diff.map_or(false, |r| r.equal),
            };
            if d.is_hook() {
                for h in d.hooks.iter() {
                    let Some(phase) = SyncPhase::of_hook(*h) else { continue };
                    tasks.push(SyncTask { phase, hook: Some(*h), ..task.clone() });
                }
            } else {
                tasks.push(task);
            }
        }

        for st in cmp.resources.iter().filter(|r| r.requires_pruning && !r.hook) {
            let Some(live) = cmp.live.get(&st.key) else { continue };
            if !req.scope.includes(&st.key, &live.labels()) {
                continue;
            }
            tasks.push(SyncTask {
                key: st.key.clone(),
                phase: SyncPhase::Sync,
                wave: live.wave(),
                action: TaskAction::Prune,
                hook: None,
                manifest: None,
                live: Some(live.object.clone()),
                options: live.sync_options().overlay(&base),
                delete_policies: SmallVec::new(),
                ignored: Vec::new(),
                in_sync: false,
            });
        }

        if !problems.is_empty() {
            return Err(DriftError::Validation(format!("error validating data: {}", problems.join("; "))));
        }
        if !req.scope.is_all() && tasks.is_empty() {
            return Err(DriftError::Invalid("sync scope matches no resources".into()));
        }

        tasks.sort_by(|a, b| {
            let order = |t: &SyncTask| match t.action {
                TaskAction::Apply => (0, t.kind_rank()),
                TaskAction::Prune => (1, usize::MAX - t.kind_rank()),
            };
            (a.phase, a.wave, order(a), &a.key).cmp(&(b.phase, b.wave, order(b), &b.key))
        });

        let namespace = (base.create_namespace() && !input.namespace.is_empty())
            .then(|| json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": input.namespace}}));
        Ok(SyncPlan { tasks, namespace })
    }

    pub fn phase(&self, phase: SyncPhase) -> impl Iterator<Item = &SyncTask> { self.tasks.iter().filter(move |t| t.phase == phase) }

    pub fn has_phase(&self, phase: SyncPhase) -> bool { self.tasks.iter().any(|t| t.phase == phase) }

    /// Tasks of `phase` grouped by wave, ascending.
    pub fn waves(&self, phase: SyncPhase) -> BTreeMap<i32, Vec<&SyncTask>> {
        let mut out: BTreeMap<i32, Vec<&SyncTask>> = BTreeMap::new();
        for t in self.phase(phase) {
            out.entry(t.wave).or_default().push(t);
        }
        out
    }
}

/// Split one wave into consecutive groups that may run concurrently: applies by kind class,
/// then prunes in reverse kind class.
pub fn kind_groups<'a>(wave: &[&'a SyncTask]) -> Vec<Vec<&'a SyncTask>> {
    let mut groups: Vec<Vec<&SyncTask>> = Vec::new();
    let mut last: Option<(TaskAction, usize)> = None;
    for t in wave.iter().copied() {
        let class = (t.action, t.kind_rank());
        if last == Some(class) {
            if let Some(g) = groups.last_mut() {
                g.push(t);
            }
        } else {
            groups.push(vec![t]);
            last = Some(class);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{LabelSelector, SyncScope};
    use drift_core::{DesiredResource, HealthStatusCode, LiveResource, ResourceStatus, SyncStatusCode};

    fn comparison(targets: Vec<Json>, extras: Vec<Json>) -> AppComparison {
        let targets: Vec<DesiredResource> = targets.into_iter().map(|m| DesiredResource::from_manifest(m).unwrap()).collect();
        let mut resources = Vec::new();
        let mut live = BTreeMap::new();
        for e in extras {
            let l = LiveResource::from_object(e).unwrap();
            let mut st = ResourceStatus::new(l.key.clone(), SyncStatusCode::OutOfSync);
            st.requires_pruning = true;
            resources.push(st);
            live.insert(l.key.clone(), l);
        }
        AppComparison {
            sync: SyncStatusCode::OutOfSync,
            health: HealthStatusCode::Healthy,
            conditions: Vec::new(),
            resources,
            diffs: BTreeMap::new(),
            targets,
            live,
            orphaned: Vec::new(),
        }
    }

    fn obj(api: &str, kind: &str, name: &str, ann: Json) -> Json {
        json!({"apiVersion": api, "kind": kind, "metadata": {"name": name, "namespace": "prod", "annotations": ann, "labels": {"tier": name}}})
    }

    fn build(cmp: &AppComparison, req: &SyncRequest) -> DriftResult<SyncPlan> {
        SyncPlan::build(&PlanInput { comparison: cmp, request: req, app_options: &SyncOptions::default(), ignore_rules: &[], namespace: "prod" })
    }

    #[test]
    fn waves_then_kind_order_then_prunes() {
        let cmp = comparison(
            vec![
                obj("apps/v1", "Deployment", "web", json!({})),
                obj("v1", "ConfigMap", "cfg", json!({})),
                obj("v1", "Service", "late", json!({"drift.dev/sync-wave": "1"})),
                obj("v1", "ServiceAccount", "early", json!({"drift.dev/sync-wave": "-1"})),
            ],
            vec![obj("v1", "ConfigMap", "stale", json!({})), obj("apps/v1", "Deployment", "old", json!({}))],
        );
        let plan = build(&cmp, &SyncRequest::default()).unwrap();
        let names: Vec<&str> = plan.tasks.iter().map(|t| t.key.name.as_str()).collect();
        assert_eq!(names, vec!["early", "cfg", "web", "old", "stale", "late"]);
        let waves = plan.waves(SyncPhase::Sync);
        assert_eq!(waves.keys().copied().collect::<Vec<_>>(), vec![-1, 0, 1]);
        assert_eq!(kind_groups(&waves[&0]).len(), 4);
    }

    #[test]
    fn hooks_fan_out_and_skip_drops() {
        let cmp = comparison(
            vec![
                obj("batch/v1", "Job", "migrate", json!({"drift.dev/hook": "PreSync,PostSync"})),
                obj("v1", "ConfigMap", "ignored", json!({"drift.dev/hook": "Skip"})),
            ],
            vec![],
        );
        let plan = build(&cmp, &SyncRequest::default()).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert!(plan.has_phase(SyncPhase::PreSync));
        assert!(plan.has_phase(SyncPhase::PostSync));
        assert!(!plan.has_phase(SyncPhase::Sync));
    }

    #[test]
    fn empty_selector_scope_is_rejected() {
        let cmp = comparison(vec![obj("v1", "ConfigMap", "cfg", json!({}))], vec![]);
        let req = SyncRequest::default().scope(SyncScope::Selector(LabelSelector::parse("tier=nothing").unwrap()));
        assert!(matches!(build(&cmp, &req), Err(DriftError::Invalid(_))));
        let req = SyncRequest::default().scope(SyncScope::Selector(LabelSelector::parse("tier=cfg").unwrap()));
        assert_eq!(build(&cmp, &req).unwrap().tasks.len(), 1);
    }

    #[test]
    fn validation_respects_opt_out() {
        let bad = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg", "namespace": "prod"}, "data": {"n": 1}});
        let cmp = comparison(vec![bad.clone()], vec![]);
        match build(&cmp, &SyncRequest::default()) {
            Err(DriftError::Validation(m)) => assert!(m.starts_with("error validating data: ")),
            other => panic!("unexpected {:?}", other.map(|p| p.tasks.len())),
        }
        let mut skipped = bad;
        skipped["metadata"]["annotations"] = json!({"drift.dev/sync-options": "Validate=false"});
        assert!(build(&comparison(vec![skipped], vec![]), &SyncRequest::default()).is_ok());
    }

    #[test]
    fn create_namespace_option() {
        let cmp = comparison(vec![obj("v1", "ConfigMap", "cfg", json!({}))], vec![]);
        let app = SyncOptions::parse("CreateNamespace=true");
        let req = SyncRequest::default();
        let plan = SyncPlan::build(&PlanInput { comparison: &cmp, request: &req, app_options: &app, ignore_rules: &[], namespace: "prod" }).unwrap();
        assert_eq!(plan.namespace.unwrap()["metadata"]["name"], "prod");
    }
}
