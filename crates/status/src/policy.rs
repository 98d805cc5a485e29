//! Project permission checks.

use std::fmt;

use drift_core::{is_cluster_scoped_builtin, GroupKind, ResourceKey};
use serde::{Deserialize, Serialize};

use crate::filter::OrphanPolicy;
use crate::glob_match;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyViolation {
    SourceRepoNotPermitted { repo: String },
    DestinationNotPermitted { server: String, namespace: String },
    KindBlacklisted { group: String, kind: String, namespaced: bool },
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyViolation::SourceRepoNotPermitted { repo } => write!(f, "application repo {} is not permitted in project", repo),
            PolicyViolation::DestinationNotPermitted { server, namespace } => {
                write!(f, "application destination server '{}' and namespace '{}' do not match any of the allowed destinations in project", server, namespace)
            }
            PolicyViolation::KindBlacklisted { group, kind, namespaced } => {
                let scope = if *namespaced { "namespaced" } else { "cluster-scoped" };
                write!(f, "resource {}:{} is not permitted in project ({})", group, kind, scope)
            }
        }
    }
}

/// What a permission check is asked about. `resource` is `None` for application-level checks.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    pub source_repo: &'a str,
    pub server: &'a str,
    pub namespace: &'a str,
    pub resource: Option<&'a ResourceKey>,
}

pub trait ProjectPolicy: Send + Sync {
    fn check(&self, req: &PolicyRequest<'_>) -> Option<PolicyViolation>;

    fn is_permitted(&self, req: &PolicyRequest<'_>) -> bool { self.check(req).is_none() }

    /// Orphan monitoring settings; `None` disables it.
    fn orphan_policy(&self) -> Option<&OrphanPolicy> { None }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectDestination {
    pub server: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupKindPattern {
    pub group: String,
    pub kind: String,
}

impl GroupKindPattern {
    pub fn any() -> Self { Self { group: "*".into(), kind: "*".into() } }

    fn matches(&self, gk: &GroupKind) -> bool { glob_match(&self.group, &gk.group) && glob_match(&self.kind, &gk.kind) }
}

/// Glob-based project: source repos and destinations accept `!` negation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppProject {
    pub name: String,
    pub source_repos: Vec<String>,
    pub destinations: Vec<ProjectDestination>,
    pub cluster_resource_whitelist: Vec<GroupKindPattern>,
    pub namespace_resource_blacklist: Vec<GroupKindPattern>,
    pub orphaned_resources: Option<OrphanPolicy>,
}

impl AppProject {
    /// Permits every source, destination and kind; orphan monitoring off.
    pub fn permissive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_repos: vec!["*".into()],
            destinations: vec![ProjectDestination { server: "*".into(), namespace: "*".into() }],
            cluster_resource_whitelist: vec![GroupKindPattern::any()],
            namespace_resource_blacklist: Vec::new(),
            orphaned_resources: None,
        }
    }

    fn repo_permitted(&self, repo: &str) -> bool { negatable_match(self.source_repos.iter().map(|s| s.as_str()), repo) }

    fn destination_permitted(&self, server: &str, namespace: &str) -> bool {
        let mut allowed = false;
        let mut any_positive = false;
        for d in self.destinations.iter() {
            let (s_neg, s_pat) = split_negation(&d.server);
            let (n_neg, n_pat) = split_negation(&d.namespace);
            let hit = glob_match(s_pat, server) && glob_match(n_pat, namespace);
            if s_neg || n_neg {
                if hit {
                    return false;
                }
            } else {
                any_positive = true;
                allowed |= hit;
            }
        }
        allowed || !any_positive && !self.destinations.is_empty()
    }
}

impl ProjectPolicy for AppProject {
    fn check(&self, req: &PolicyRequest<'_>) -> Option<PolicyViolation> {
        let Some(key) = req.resource else {
            if !self.repo_permitted(req.source_repo) {
                return Some(PolicyViolation::SourceRepoNotPermitted { repo: req.source_repo.to_string() });
            }
            if !self.destination_permitted(req.server, req.namespace) {
                return Some(PolicyViolation::DestinationNotPermitted { server: req.server.to_string(), namespace: req.namespace.to_string() });
            }
            return None;
        };
        let gk = key.group_kind();
        let namespaced = !key.namespace.is_empty() && !is_cluster_scoped_builtin(&gk);
        if namespaced {
            if self.namespace_resource_blacklist.iter().any(|p| p.matches(&gk)) {
                return Some(PolicyViolation::KindBlacklisted { group: gk.group, kind: gk.kind, namespaced: true });
            }
            if !self.destination_permitted(req.server, &key.namespace) {
                return Some(PolicyViolation::DestinationNotPermitted { server: req.server.to_string(), namespace: key.namespace.clone() });
            }
        } else if !self.cluster_resource_whitelist.iter().any(|p| p.matches(&gk)) {
            return Some(PolicyViolation::KindBlacklisted { group: gk.group, kind: gk.kind, namespaced: false });
        }
        None
    }

    fn orphan_policy(&self) -> Option<&OrphanPolicy> { self.orphaned_resources.as_ref() }
}

fn split_negation(p: &str) -> (bool, &str) {
    match p.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, p),
    }
}

/// Allowed when a positive pattern matches (or only negations exist) and no negation matches.
fn negatable_match<'a>(patterns: impl Iterator<Item = &'a str>, value: &str) -> bool {
    let mut allowed = false;
    let mut any_positive = false;
    for p in patterns {
        let (neg, pat) = split_negation(p);
        if neg {
            if glob_match(pat, value) {
                return false;
            }
        } else {
            any_positive = true;
            allowed |= glob_match(pat, value);
        }
    }
    allowed || !any_positive
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_req<'a>(repo: &'a str, ns: &'a str) -> PolicyRequest<'a> {
        PolicyRequest { source_repo: repo, server: "https://kubernetes.default.svc", namespace: ns, resource: None }
    }

    #[test]
    fn repos_with_negation() {
        let mut p = AppProject::permissive("p");
        p.source_repos = vec!["https://github.com/acme/*".into(), "!https://github.com/acme/secret*".into()];
        assert!(p.is_permitted(&app_req("https://github.com/acme/guestbook", "prod")));
        assert_eq!(
            p.check(&app_req("https://github.com/acme/secret-stuff", "prod")),
            Some(PolicyViolation::SourceRepoNotPermitted { repo: "https://github.com/acme/secret-stuff".into() })
        );
        assert!(!p.is_permitted(&app_req("https://gitlab.com/x", "prod")));
    }

    #[test]
    fn destinations_with_negation() {
        let mut p = AppProject::permissive("p");
        p.destinations = vec![
            ProjectDestination { server: "*".into(), namespace: "*".into() },
            ProjectDestination { server: "*".into(), namespace: "!kube-system".into() },
        ];
        assert!(p.is_permitted(&app_req("r", "prod")));
        assert!(!p.is_permitted(&app_req("r", "kube-system")));
    }

    #[test]
    fn kinds_are_checked_by_scope() {
        let mut p = AppProject::permissive("p");
        p.cluster_resource_whitelist = vec![GroupKindPattern { group: "".into(), kind: "Namespace".into() }];
        p.namespace_resource_blacklist = vec![GroupKindPattern { group: "".into(), kind: "ResourceQuota".into() }];
        let ns = ResourceKey::new("", "Namespace", "", "team");
        let role = ResourceKey::new("rbac.authorization.k8s.io", "ClusterRole", "", "admin");
        let quota = ResourceKey::new("", "ResourceQuota", "team", "q");
        let cm = ResourceKey::new("", "ConfigMap", "team", "c");
        fn req(k: &ResourceKey) -> PolicyRequest<'_> { PolicyRequest { resource: Some(k), ..app_req("r", "team") } }
        assert!(p.is_permitted(&req(&ns)));
        assert!(matches!(p.check(&req(&role)), Some(PolicyViolation::KindBlacklisted { namespaced: false, .. })));
        assert!(matches!(p.check(&req(&quota)), Some(PolicyViolation::KindBlacklisted { namespaced: true, .. })));
        assert!(p.is_permitted(&req(&cm)));
    }
}
