//! Drift diff engine: normalized desired/live comparison under ignore rules.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use drift_core::{DriftError, DriftResult, LiveResource, ResourceKey};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::trace;

mod customize;
pub mod managed;
mod normalize;
pub mod pointer;
mod rules;

pub use customize::{DiffCustomizer, DiffRegistry, StaticCustomizer};
pub use normalize::{normalize, MASK};
pub use rules::{IgnoreRule, IgnoreSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffState {
    Equal,
    Modified,
    /// Desired but not live.
    Missing,
    /// Live but not desired.
    Extra,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Outcome of one comparison. Surfaced documents and `patch` are masked for Secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    pub key: ResourceKey,
    pub state: DiffState,
    pub equal: bool,
    pub normalized_desired: Option<Json>,
    pub normalized_live: Option<Json>,
    /// JSON merge patch turning normalized live into normalized desired.
    pub patch: Json,
    pub summary: DiffSummary,
    /// Pointers excluded from the live document (rules, customizers and field managers).
    pub ignored_paths: Vec<String>,
    #[serde(skip)]
    raw_patch: Json,
}

impl DiffResult {
    /// Unmasked merge patch; only for sending to the cluster.
    pub fn unmasked_patch(&self) -> &Json { &self.raw_patch }
}

/// Compare one desired/live pair. Exactly one side may be absent.
pub fn compare(desired: Option<&Json>, live: Option<&Json>, rules: &[IgnoreRule], registry: &DiffRegistry) -> DriftResult<DiffResult> {
    let key = desired
        .or(live)
        .ok_or_else(|| DriftError::Invalid("compare needs a desired or a live document".into()))
        .and_then(|d| ResourceKey::from_manifest(d).ok_or_else(|| DriftError::Invalid("document without identity".into())))?;
    counter!("diff_compare_total", 1);

    let ignore = IgnoreSet::for_key(&key, rules);
    let customizer = registry.lookup(&key.group_kind());
    let managed_paths = match (live, ignore.managers.is_empty()) {
        (Some(l), false) => LiveResource::from_object(l.clone())
            .map(|lr| managed::last_written_by(&lr.field_managers(), &ignore.managers))
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    let unordered = customizer.as_ref().map(|c| c.unordered_lists()).unwrap_or_default();

    let prepare = |doc: &Json| -> (Json, Vec<String>) {
        let mut n = normalize(doc);
        let mut ptrs: Vec<String> = ignore.pointers.iter().cloned().collect();
        if let Some(c) = customizer.as_ref() {
            ptrs.extend(c.ignored_paths(&n));
        }
        ptrs.extend(managed_paths.iter().filter_map(|p| managed::resolve(&n, p)).map(|t| pointer::join(&t)));
        let removed = normalize::remove_all(&mut n, &ptrs);
        for u in unordered.iter() {
            normalize::sort_list(&mut n, u);
        }
        (n, removed)
    };

    let nd = desired.map(|d| prepare(d).0);
    let (nl, ignored_paths) = match live.map(|l| prepare(l)) {
        Some((n, removed)) => (Some(n), removed),
        None => (None, Vec::new()),
    };

    let (state, equal) = match (&nd, &nl) {
        (Some(d), Some(l)) if d == l => (DiffState::Equal, true),
        (Some(_), Some(_)) => (DiffState::Modified, false),
        (Some(_), None) => (DiffState::Missing, false),
        (None, _) => (DiffState::Extra, false),
    };
    let raw_patch = match (&nd, &nl) {
        (Some(d), Some(l)) => create_merge_patch(l, d),
        (Some(d), None) => d.clone(),
        (None, _) => Json::Null,
    };
    let empty = Json::Object(Map::new());
    let summary = diff_summary(nd.as_ref().unwrap_or(&empty), nl.as_ref().unwrap_or(&empty));

    let secret = nd.as_ref().or(nl.as_ref()).map_or(false, normalize::is_secret);
    let (mut md, mut ml, mut patch) = (nd, nl, raw_patch.clone());
    if secret {
        normalize::mask_secret_pair(md.as_mut(), ml.as_mut());
        normalize::mask_patch(&mut patch);
    }
    trace!(key = %key, ?state, "compared");
    Ok(DiffResult { key, state, equal, normalized_desired: md, normalized_live: ml, patch, summary, ignored_paths, raw_patch })
}

/// RFC 7386 merge patch from `from` to `to`.
pub fn create_merge_patch(from: &Json, to: &Json) -> Json {
    match (from, to) {
        (Json::Object(fo), Json::Object(to_obj)) => {
            let mut out = Map::new();
            for (k, tv) in to_obj.iter() {
                match fo.get(k) {
                    Some(fv) if fv == tv => {}
                    Some(fv) if fv.is_object() && tv.is_object() => {
                        out.insert(k.clone(), create_merge_patch(fv, tv));
                    }
                    _ => {
                        out.insert(k.clone(), tv.clone());
                    }
                }
            }
            for k in fo.keys() {
                if !to_obj.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            Json::Object(out)
        }
        (_, to) => to.clone(),
    }
}

/// Count field-level adds/updates/removes of `target` relative to `base`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Copy live values at `pointers` into `desired`; pointers absent live are removed from desired.
pub fn preserve_ignored(desired: &mut Json, live: &Json, pointers: &[String]) {
    for p in pointers {
        match live.pointer(p) {
            Some(v) => pointer::set(desired, p, v.clone()),
            None => {
                pointer::remove(desired, p);
            }
        }
    }
}

/// Pointers that `RespectIgnoreDifferences` keeps at their live values for `key`.
pub fn ignored_pointers_for(key: &ResourceKey, live: &Json, rules: &[IgnoreRule]) -> Vec<String> {
    let ignore = IgnoreSet::for_key(key, rules);
    let mut out: BTreeSet<String> = ignore.pointers.iter().cloned().collect();
    if let Some(lr) = LiveResource::from_object(live.clone()) {
        for p in managed::last_written_by(&lr.field_managers(), &ignore.managers) {
            if let Some(t) = managed::resolve(live, &p) {
                out.insert(pointer::join(&t));
            }
        }
    }
    out.into_iter().collect()
}

/// Unified YAML diff (live → desired) under a `===== key ======` header. Secret values are masked.
pub fn render_text_diff(result: &DiffResult) -> String {
    let to_yaml = |v: Option<&Json>| v.and_then(|v| serde_yaml::to_string(v).ok()).unwrap_or_default();
    let live = to_yaml(result.normalized_live.as_ref());
    let desired = to_yaml(result.normalized_desired.as_ref());
    let diff = similar::TextDiff::from_lines(&live, &desired);
    let mut out = format!("===== {} ======\n", result.key);
    out.push_str(&diff.unified_diff().context_radius(3).header("live", "desired").to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deploy(replicas: i64) -> Json {
        json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod"},
            "spec": {"replicas": replicas, "template": {"spec": {"containers": [{"name": "app", "image": "nginx"}]}}}
        })
    }

    #[test]
    fn identical_canonical_trees_are_equal() {
        let mut live = deploy(2);
        live["metadata"]["resourceVersion"] = json!("9");
        live["status"] = json!({"readyReplicas": 2});
        let r = compare(Some(&deploy(2)), Some(&live), &[], &DiffRegistry::default()).unwrap();
        assert!(r.equal);
        assert_eq!(r.state, DiffState::Equal);
        assert_eq!(r.patch, json!({}));
    }

    #[test]
    fn ignore_rule_hides_difference_and_missing_path_is_noop() {
        let rules = vec![IgnoreRule::new("apps", "Deployment").pointer("/spec/replicas").pointer("/spec/not/there")];
        let r = compare(Some(&deploy(2)), Some(&deploy(5)), &rules, &DiffRegistry::default()).unwrap();
        assert!(r.equal);
        assert_eq!(r.ignored_paths, vec!["/spec/replicas".to_string()]);
        let r = compare(Some(&deploy(2)), Some(&deploy(5)), &[], &DiffRegistry::default()).unwrap();
        assert!(!r.equal);
        assert_eq!(r.patch, json!({"spec": {"replicas": 2}}));
        assert_eq!(r.summary.updates, 1);
    }

    #[test]
    fn one_side_absent() {
        let reg = DiffRegistry::default();
        assert_eq!(compare(Some(&deploy(1)), None, &[], &reg).unwrap().state, DiffState::Missing);
        assert_eq!(compare(None, Some(&deploy(1)), &[], &reg).unwrap().state, DiffState::Extra);
        assert!(compare(None, None, &[], &reg).is_err());
    }

    #[test]
    fn manager_exclusion_needs_latest_writer() {
        let mut live = deploy(5);
        live["metadata"]["managedFields"] = json!([
            {"manager": "drift", "operation": "Apply", "time": "2024-01-01T00:00:00Z", "fieldsV1": {"f:spec": {"f:replicas": {}}}},
            {"manager": "hpa", "operation": "Update", "time": "2024-01-02T00:00:00Z", "fieldsV1": {"f:spec": {"f:replicas": {}}}}
        ]);
        let rules = vec![IgnoreRule::new("apps", "Deployment").manager("hpa")];
        assert!(compare(Some(&deploy(2)), Some(&live), &rules, &DiffRegistry::default()).unwrap().equal);

        let other = vec![IgnoreRule::new("apps", "Deployment").manager("kubectl")];
        assert!(!compare(Some(&deploy(2)), Some(&live), &other, &DiffRegistry::default()).unwrap().equal);

        live["metadata"]["managedFields"][1]["time"] = json!("2023-01-01T00:00:00Z");
        assert!(!compare(Some(&deploy(2)), Some(&live), &rules, &DiffRegistry::default()).unwrap().equal);
    }

    #[test]
    fn secrets_are_masked_but_still_compared() {
        let desired = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "db", "namespace": "prod"}, "stringData": {"password": "hunter2"}});
        let live = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "db", "namespace": "prod"}, "data": {"password": "b2xk"}});
        let r = compare(Some(&desired), Some(&live), &[], &DiffRegistry::default()).unwrap();
        assert!(!r.equal);
        assert_eq!(r.normalized_desired.as_ref().unwrap()["data"]["password"], json!(MASK));
        assert_ne!(r.normalized_live.as_ref().unwrap()["data"]["password"], json!("b2xk"));
        assert_eq!(r.patch["data"]["password"], json!(MASK));
        assert_ne!(r.unmasked_patch()["data"]["password"], json!(MASK));
        let text = render_text_diff(&r);
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("aHVudGVyMg=="));
        assert!(!text.contains("b2xk"));
        assert!(text.starts_with("===== /Secret prod/db ======"));
    }

    #[test]
    fn unordered_lists_compare_as_multisets() {
        let mut reg = DiffRegistry::empty();
        reg.register(
            drift_core::GroupKind::new("example.com", "Widget"),
            std::sync::Arc::new(StaticCustomizer { ignored: vec![], unordered: vec!["/spec/items".into()] }),
        );
        let a = json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}, "spec": {"items": ["a", "b", "c"]}});
        let b = json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}, "spec": {"items": ["c", "a", "b"]}});
        assert!(compare(Some(&a), Some(&b), &[], &reg).unwrap().equal);
        assert!(!compare(Some(&a), Some(&b), &[], &DiffRegistry::empty()).unwrap().equal);
    }

    #[test]
    fn service_account_secrets_are_ignored() {
        let d = json!({"apiVersion": "v1", "kind": "ServiceAccount", "metadata": {"name": "sa", "namespace": "prod"}});
        let l = json!({"apiVersion": "v1", "kind": "ServiceAccount", "metadata": {"name": "sa", "namespace": "prod"}, "secrets": [{"name": "sa-token"}]});
        assert!(compare(Some(&d), Some(&l), &[], &DiffRegistry::default()).unwrap().equal);
    }

    #[test]
    fn preserve_ignored_copies_live_values() {
        let mut desired = deploy(2);
        preserve_ignored(&mut desired, &deploy(7), &["/spec/replicas".into(), "/spec/paused".into()]);
        assert_eq!(desired["spec"]["replicas"], json!(7));
        assert!(desired["spec"].get("paused").is_none());
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn merge_patch_nulls_removed_fields() {
        let p = create_merge_patch(&json!({"a": 1, "b": {"c": 1, "d": 2}}), &json!({"b": {"c": 1, "d": 3}}));
        assert_eq!(p, json!({"a": null, "b": {"d": 3}}));
    }
}
