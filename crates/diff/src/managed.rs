//! `fieldsV1` decoding and most-recent-writer resolution.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use drift_core::ManagedFieldsEntry;
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, PartialEq)]
pub enum PathSeg {
    /// `f:<name>`
    Field(String),
    /// `k:<json object>` list item selected by key fields
    Key(Map<String, Json>),
    /// `v:<json value>` set member
    Value(Json),
    /// `i:<index>`
    Index(usize),
}

impl PathSeg {
    fn parse(raw: &str) -> Option<Self> {
        let (prefix, rest) = raw.split_once(':')?;
        match prefix {
            "f" => Some(PathSeg::Field(rest.to_string())),
            "k" => serde_json::from_str::<Json>(rest).ok().and_then(|v| v.as_object().cloned()).map(PathSeg::Key),
            "v" => serde_json::from_str::<Json>(rest).ok().map(PathSeg::Value),
            "i" => rest.parse().ok().map(PathSeg::Index),
            _ => None,
        }
    }
}

/// Leaf paths of a field set. Nodes carrying only the `.` marker are leaves.
pub fn decode(fields: &Json) -> Vec<Vec<PathSeg>> {
    fn walk(node: &Json, prefix: &mut Vec<PathSeg>, out: &mut Vec<Vec<PathSeg>>) {
        let Some(m) = node.as_object() else { return };
        let children: Vec<_> = m.iter().filter(|(k, _)| k.as_str() != ".").collect();
        if children.is_empty() {
            if !prefix.is_empty() {
                out.push(prefix.clone());
            }
            return;
        }
        for (k, child) in children {
            let Some(seg) = PathSeg::parse(k) else { continue };
            prefix.push(seg);
            walk(child, prefix, out);
            prefix.pop();
        }
    }
    let mut out = Vec::new();
    walk(fields, &mut Vec::new(), &mut out);
    out
}

/// Resolve a decoded path against `doc` into JSON pointer tokens; `None` when absent.
pub fn resolve(doc: &Json, path: &[PathSeg]) -> Option<Vec<String>> {
    let mut cur = doc;
    let mut tokens = Vec::with_capacity(path.len());
    for seg in path {
        match seg {
            PathSeg::Field(name) => {
                cur = cur.as_object()?.get(name)?;
                tokens.push(name.clone());
            }
            PathSeg::Key(keys) => {
                let items = cur.as_array()?;
                let idx = items.iter().position(|item| keys.iter().all(|(k, v)| item.get(k) == Some(v)))?;
                cur = &items[idx];
                tokens.push(idx.to_string());
            }
            PathSeg::Value(v) => {
                let items = cur.as_array()?;
                let idx = items.iter().position(|item| item == v)?;
                cur = &items[idx];
                tokens.push(idx.to_string());
            }
            PathSeg::Index(i) => {
                cur = cur.as_array()?.get(*i)?;
                tokens.push(i.to_string());
            }
        }
    }
    Some(tokens)
}

/// Paths whose most recent writer (latest `time`, later list position on ties) is one of `managers`.
pub fn last_written_by(entries: &[ManagedFieldsEntry], managers: &BTreeSet<String>) -> Vec<Vec<PathSeg>> {
    if managers.is_empty() {
        return Vec::new();
    }
    let mut writers: HashMap<String, (Vec<PathSeg>, &str, Option<DateTime<Utc>>)> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for e in entries {
        for path in decode(&e.fields) {
            let id = format!("{:?}", path);
            match writers.get_mut(&id) {
                Some(slot) => {
                    if e.time >= slot.2 {
                        slot.1 = e.manager.as_str();
                        slot.2 = e.time;
                    }
                }
                None => {
                    order.push(id.clone());
                    writers.insert(id, (path, e.manager.as_str(), e.time));
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| writers.remove(&id))
        .filter(|(_, m, _)| managers.contains(*m))
        .map(|(p, _, _)| p)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn entry(manager: &str, secs: i64, fields: Json) -> ManagedFieldsEntry {
        ManagedFieldsEntry {
            manager: manager.into(),
            operation: "Update".into(),
            time: Some(Utc.timestamp_opt(secs, 0).unwrap()),
            fields,
        }
    }

    #[test]
    fn decodes_keyed_and_set_items() {
        let fs = json!({
            "f:spec": {"f:replicas": {}, "f:containers": {"k:{\"name\":\"app\"}": {".": {}, "f:image": {}}}},
            "f:metadata": {"f:finalizers": {"v:\"x\"": {}}}
        });
        let paths = decode(&fs);
        assert_eq!(paths.len(), 3);
        let doc = json!({
            "spec": {"replicas": 2, "containers": [{"name": "side"}, {"name": "app", "image": "nginx"}]},
            "metadata": {"finalizers": ["y", "x"]}
        });
        let mut resolved: Vec<_> = paths.iter().filter_map(|p| resolve(&doc, p)).map(|t| t.join("/")).collect();
        resolved.sort();
        assert_eq!(resolved, vec!["metadata/finalizers/1", "spec/containers/1/image", "spec/replicas"]);
    }

    #[test]
    fn latest_writer_wins_even_if_others_touched() {
        let entries = vec![
            entry("drift", 10, json!({"f:spec": {"f:replicas": {}, "f:paused": {}}})),
            entry("hpa", 20, json!({"f:spec": {"f:replicas": {}}})),
        ];
        let managers: BTreeSet<String> = ["hpa".to_string()].into();
        let owned = last_written_by(&entries, &managers);
        assert_eq!(owned, vec![vec![PathSeg::Field("spec".into()), PathSeg::Field("replicas".into())]]);

        let older = vec![
            entry("hpa", 5, json!({"f:spec": {"f:replicas": {}}})),
            entry("drift", 10, json!({"f:spec": {"f:replicas": {}}})),
        ];
        assert!(last_written_by(&older, &managers).is_empty());
    }

    #[test]
    fn ties_resolved_by_list_order() {
        let entries = vec![
            entry("hpa", 10, json!({"f:spec": {"f:replicas": {}}})),
            entry("drift", 10, json!({"f:spec": {"f:replicas": {}}})),
        ];
        let managers: BTreeSet<String> = ["hpa".to_string()].into();
        assert!(last_written_by(&entries, &managers).is_empty());
    }
}
