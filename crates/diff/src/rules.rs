use std::collections::BTreeSet;

use drift_core::ResourceKey;
use serde::{Deserialize, Serialize};

/// Selector + paths + field managers whose differences are not reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IgnoreRule {
    /// `*` matches any group.
    pub group: String,
    /// `*` matches any kind.
    pub kind: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub json_pointers: Vec<String>,
    pub managed_fields_managers: Vec<String>,
}

impl IgnoreRule {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into(), ..Default::default() }
    }

    pub fn pointer(mut self, p: impl Into<String>) -> Self {
        self.json_pointers.push(p.into());
        self
    }

    pub fn manager(mut self, m: impl Into<String>) -> Self {
        self.managed_fields_managers.push(m.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        (self.group == "*" || self.group == key.group)
            && (self.kind == "*" || self.kind == key.kind)
            && self.name.as_deref().map_or(true, |n| n == key.name)
            && self.namespace.as_deref().map_or(true, |ns| ns == key.namespace)
    }
}

/// Union of every rule matching one resource; rule order never matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSet {
    pub pointers: BTreeSet<String>,
    pub managers: BTreeSet<String>,
}

impl IgnoreSet {
    pub fn for_key<'a>(key: &ResourceKey, rules: impl IntoIterator<Item = &'a IgnoreRule>) -> Self {
        let mut out = Self::default();
        for r in rules.into_iter().filter(|r| r.matches(key)) {
            out.pointers.extend(r.json_pointers.iter().cloned());
            out.managers.extend(r.managed_fields_managers.iter().cloned());
        }
        out
    }

    pub fn is_empty(&self) -> bool { self.pointers.is_empty() && self.managers.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_is_order_independent() {
        let key = ResourceKey::new("apps", "Deployment", "prod", "web");
        let a = IgnoreRule::new("apps", "Deployment").pointer("/spec/replicas");
        let b = IgnoreRule::new("*", "*").pointer("/metadata/labels").manager("hpa");
        let c = IgnoreRule::new("apps", "StatefulSet").pointer("/spec/x");
        let ab = IgnoreSet::for_key(&key, [&a, &b, &c]);
        let ba = IgnoreSet::for_key(&key, [&c, &b, &a]);
        assert_eq!(ab, ba);
        assert_eq!(ab.pointers.len(), 2);
        assert!(ab.managers.contains("hpa"));
    }

    #[test]
    fn name_and_namespace_narrow_the_selector() {
        let key = ResourceKey::new("", "ConfigMap", "prod", "cfg");
        assert!(IgnoreRule::new("", "ConfigMap").named("cfg").in_namespace("prod").matches(&key));
        assert!(!IgnoreRule::new("", "ConfigMap").named("other").matches(&key));
        assert!(!IgnoreRule::new("", "ConfigMap").in_namespace("dev").matches(&key));
    }
}
