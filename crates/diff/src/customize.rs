use std::sync::Arc;

use drift_core::GroupKind;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

/// Per-kind comparison tweaks.
pub trait DiffCustomizer: Send + Sync {
    /// Concrete JSON pointers to drop from `doc` before comparing.
    fn ignored_paths(&self, _doc: &Json) -> Vec<String> { Vec::new() }
    /// Pointers to lists compared as multisets.
    fn unordered_lists(&self) -> Vec<String> { Vec::new() }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCustomizer {
    pub ignored: Vec<String>,
    pub unordered: Vec<String>,
}

impl DiffCustomizer for StaticCustomizer {
    fn ignored_paths(&self, _doc: &Json) -> Vec<String> { self.ignored.clone() }
    fn unordered_lists(&self) -> Vec<String> { self.unordered.clone() }
}

/// Token secrets are appended by the control plane.
struct ServiceAccountSecrets;

impl DiffCustomizer for ServiceAccountSecrets {
    fn ignored_paths(&self, _doc: &Json) -> Vec<String> { vec!["/secrets".into()] }
}

/// CA bundles are injected by cert controllers.
struct WebhookCaBundle;

impl DiffCustomizer for WebhookCaBundle {
    fn ignored_paths(&self, doc: &Json) -> Vec<String> {
        let n = doc.get("webhooks").and_then(|w| w.as_array()).map(|a| a.len()).unwrap_or(0);
        (0..n).map(|i| format!("/webhooks/{}/clientConfig/caBundle", i)).collect()
    }
}

/// Registry keyed by (group, kind); exact match first, then `(group, *)`.
#[derive(Clone)]
pub struct DiffRegistry {
    map: FxHashMap<GroupKind, Arc<dyn DiffCustomizer>>,
}

impl Default for DiffRegistry {
    fn default() -> Self { Self::with_builtins() }
}

impl DiffRegistry {
    pub fn empty() -> Self { Self { map: FxHashMap::default() } }

    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register(GroupKind::new("", "ServiceAccount"), Arc::new(ServiceAccountSecrets));
        let webhook: Arc<dyn DiffCustomizer> = Arc::new(WebhookCaBundle);
        r.register(GroupKind::new("admissionregistration.k8s.io", "MutatingWebhookConfiguration"), webhook.clone());
        r.register(GroupKind::new("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"), webhook);
        r
    }

    pub fn register(&mut self, gk: GroupKind, c: Arc<dyn DiffCustomizer>) { self.map.insert(gk, c); }

    pub fn lookup(&self, gk: &GroupKind) -> Option<Arc<dyn DiffCustomizer>> {
        self.map
            .get(gk)
            .or_else(|| self.map.get(&GroupKind::new(gk.group.clone(), "*")))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcard_kind_is_a_fallback() {
        let mut r = DiffRegistry::empty();
        r.register(GroupKind::new("example.com", "*"), Arc::new(StaticCustomizer { ignored: vec!["/spec/a".into()], unordered: vec![] }));
        r.register(GroupKind::new("example.com", "Widget"), Arc::new(StaticCustomizer { ignored: vec!["/spec/b".into()], unordered: vec![] }));
        let exact = r.lookup(&GroupKind::new("example.com", "Widget")).unwrap();
        assert_eq!(exact.ignored_paths(&json!({})), vec!["/spec/b".to_string()]);
        let wild = r.lookup(&GroupKind::new("example.com", "Gadget")).unwrap();
        assert_eq!(wild.ignored_paths(&json!({})), vec!["/spec/a".to_string()]);
        assert!(r.lookup(&GroupKind::new("other.com", "Gadget")).is_none());
    }

    #[test]
    fn webhook_paths_follow_document() {
        let r = DiffRegistry::with_builtins();
        let c = r.lookup(&GroupKind::new("admissionregistration.k8s.io", "MutatingWebhookConfiguration")).unwrap();
        let doc = json!({"webhooks": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(c.ignored_paths(&doc).len(), 2);
    }
}
