//! Orphan and exclusion classification of live objects.

use std::collections::BTreeSet;

use drift_core::{Condition, ConditionKind, GroupKind, LiveResource, ResourceKey};
use drift_track::ResourceTracker;
use serde::{Deserialize, Serialize};

use crate::glob_match;

/// Administrative exclusion: matching kinds are invisible to diffing and never deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExclusionRule {
    pub api_groups: Vec<String>,
    pub kinds: Vec<String>,
    /// Empty means every cluster.
    pub clusters: Vec<String>,
}

impl ExclusionRule {
    pub fn matches(&self, gk: &GroupKind, cluster: &str) -> bool {
        self.api_groups.iter().any(|g| glob_match(g, &gk.group))
            && self.kinds.iter().any(|k| glob_match(k, &gk.kind))
            && (self.clusters.is_empty() || self.clusters.iter().any(|c| glob_match(c, cluster)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceExclusions {
    pub rules: Vec<ExclusionRule>,
}

impl ResourceExclusions {
    pub fn new(rules: Vec<ExclusionRule>) -> Self { Self { rules } }

    pub fn is_excluded(&self, gk: &GroupKind, cluster: &str) -> bool { self.rules.iter().any(|r| r.matches(gk, cluster)) }
}

/// Orphan-ignore entry; `group` defaults to the core group, `name` may be a glob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanIgnore {
    pub group: String,
    pub kind: String,
    pub name: Option<String>,
}

impl OrphanIgnore {
    pub fn matches(&self, key: &ResourceKey) -> bool {
        self.group == key.group && self.kind == key.kind && self.name.as_deref().map_or(true, |n| glob_match(n, &key.name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanPolicy {
    pub warn: bool,
    pub ignore: Vec<OrphanIgnore>,
}

impl OrphanPolicy {
    pub fn warn() -> Self { Self { warn: true, ignore: Vec::new() } }

    /// Namespace plumbing every namespace carries.
    fn ignored_by_default(key: &ResourceKey) -> bool {
        (key.group.is_empty() && key.kind == "ServiceAccount" && key.name == "default")
            || (key.group.is_empty() && key.kind == "ConfigMap" && key.name == "kube-root-ca.crt")
    }

    pub fn is_ignored(&self, key: &ResourceKey) -> bool { Self::ignored_by_default(key) || self.ignore.iter().any(|i| i.matches(key)) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub orphaned: Vec<ResourceKey>,
    pub excluded: Vec<ResourceKey>,
}

/// Orphans are namespaced objects in `namespace` that are neither desired, owned, excluded,
/// controller-created nor ignored. Without an orphan policy nothing is reported as orphaned.
#[allow(clippy::too_many_arguments)]
pub fn classify(
    live: &[LiveResource],
    desired_keys: &BTreeSet<ResourceKey>,
    tracker: &ResourceTracker,
    app: &str,
    exclusions: &ResourceExclusions,
    cluster: &str,
    orphan_policy: Option<&OrphanPolicy>,
    namespace: &str,
) -> Classified {
    let mut out = Classified::default();
    for l in live {
        if exclusions.is_excluded(&l.key.group_kind(), cluster) {
            out.excluded.push(l.key.clone());
            continue;
        }
        let Some(policy) = orphan_policy else { continue };
        if namespace.is_empty() || l.key.namespace != namespace || desired_keys.contains(&l.key) {
            continue;
        }
        if tracker.is_owned_by(l, app) || has_owner_references(l) || policy.is_ignored(&l.key) {
            continue;
        }
        out.orphaned.push(l.key.clone());
    }
    out.orphaned.sort();
    out.excluded.sort();
    out
}

fn has_owner_references(l: &LiveResource) -> bool {
    l.object.pointer("/metadata/ownerReferences").and_then(|o| o.as_array()).map_or(false, |a| !a.is_empty())
}

/// At most one warning for the whole application.
pub fn orphan_condition(count: usize, policy: Option<&OrphanPolicy>) -> Option<Condition> {
    match policy {
        Some(p) if p.warn && count > 0 => Some(Condition::new(ConditionKind::OrphanedResourceWarning, format!("Application has {} orphaned resources", count))),
        _ => None,
    }
}

pub fn excluded_condition(key: &ResourceKey) -> Condition {
    Condition::new(
        ConditionKind::ExcludedResourceWarning,
        format!("Resource {}/{} {} is excluded in the settings", key.group, key.kind, key.name),
    )
}
