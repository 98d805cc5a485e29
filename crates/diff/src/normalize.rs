use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value as Json};

use crate::pointer;

pub const MASK: &str = "++++++++";
const MASK_CHANGED: &str = "+++++++++";
const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub fn is_secret(doc: &Json) -> bool {
    doc.get("kind").and_then(|k| k.as_str()) == Some("Secret") && doc.get("apiVersion").and_then(|v| v.as_str()) == Some("v1")
}

/// Drop server-populated metadata and `status`; fold Secret `stringData` into `data`.
pub fn normalize(doc: &Json) -> Json {
    let mut v = doc.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for f in ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp", "selfLink"] {
            meta.remove(f);
        }
        if let Some(ann) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            ann.remove(LAST_APPLIED);
        }
        for f in ["annotations", "labels"] {
            if meta.get(f).map_or(false, |m| m.as_object().map_or(false, |o| o.is_empty()) || m.is_null()) {
                meta.remove(f);
            }
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    if is_secret(&v) {
        fold_string_data(&mut v);
    }
    v
}

fn fold_string_data(v: &mut Json) {
    let Some(obj) = v.as_object_mut() else { return };
    let Some(Json::Object(string_data)) = obj.remove("stringData") else { return };
    let data = obj.entry("data").or_insert_with(|| Json::Object(Map::new()));
    if !data.is_object() {
        *data = Json::Object(Map::new());
    }
    if let Some(data) = data.as_object_mut() {
        for (k, val) in string_data {
            let raw = match val {
                Json::String(s) => s,
                other => other.to_string(),
            };
            data.insert(k, Json::String(STANDARD.encode(raw.as_bytes())));
        }
    }
}

/// Sort the list at `pointer` by canonical serialization so it compares as a multiset.
pub fn sort_list(doc: &mut Json, ptr: &str) {
    let Some(Json::Array(items)) = doc.pointer_mut(ptr) else { return };
    items.sort_by_cached_key(|v| v.to_string());
}

/// Remove every pointer, children and higher indices first so earlier removals never shift later ones.
pub fn remove_all(doc: &mut Json, pointers: &[String]) -> Vec<String> {
    let mut toks: Vec<Vec<String>> = pointers.iter().map(|p| pointer::tokens(p)).filter(|t| !t.is_empty()).collect();
    toks.sort_by(|a, b| cmp_tokens(b, a));
    toks.dedup();
    let mut removed = Vec::new();
    for t in toks {
        let p = pointer::join(&t);
        if pointer::remove(doc, &p) {
            removed.push(p);
        }
    }
    removed
}

fn cmp_tokens(a: &[String], b: &[String]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x.parse::<usize>(), y.parse::<usize>()) {
            (Ok(i), Ok(j)) => i.cmp(&j),
            _ => x.cmp(y),
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Mask Secret `data` values in both documents; changed values get a distinct marker on the live side.
pub fn mask_secret_pair(desired: Option<&mut Json>, live: Option<&mut Json>) {
    let d_data = desired.as_ref().and_then(|d| d.get("data")).and_then(|d| d.as_object()).cloned().unwrap_or_default();
    let l_data = live.as_ref().and_then(|l| l.get("data")).and_then(|d| d.as_object()).cloned().unwrap_or_default();
    if let Some(d) = desired {
        mask_values(d, |_| MASK);
    }
    if let Some(l) = live {
        mask_values(l, |k| match d_data.get(k) {
            Some(dv) if l_data.get(k) != Some(dv) => MASK_CHANGED,
            _ => MASK,
        });
    }
}

fn mask_values(doc: &mut Json, marker: impl Fn(&str) -> &'static str) {
    if let Some(data) = doc.get_mut("data").and_then(|d| d.as_object_mut()) {
        for (k, v) in data.iter_mut() {
            *v = Json::String(marker(k).to_string());
        }
    }
}

/// Mask every value of a Secret merge patch's `data`.
pub fn mask_patch(patch: &mut Json) {
    if let Some(data) = patch.get_mut("data").and_then(|d| d.as_object_mut()) {
        for (_, v) in data.iter_mut() {
            if !v.is_null() {
                *v = Json::String(MASK.to_string());
            }
        }
    }
    if let Some(obj) = patch.as_object_mut() {
        obj.remove("stringData");
    }
}
