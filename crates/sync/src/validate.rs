//! Client-side manifest validation run before an operation starts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;

static DNS_SUBDOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex"));
static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));
static QUALIFIED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("static regex"));

/// Every problem found in `manifest`, formatted `ValidationError(Kind.path): reason`.
pub fn validate_manifest(manifest: &Json) -> Vec<String> {
    let kind = manifest.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    let mut errs = Vec::new();
    let mut err = |path: &str, reason: String| {
        let kind = if kind.is_empty() { "Object" } else { kind };
        errs.push(format!("ValidationError({}.{}): {}", kind, path, reason));
    };

    match manifest.get("apiVersion") {
        Some(Json::String(s)) if !s.is_empty() => {}
        _ => err("apiVersion", "missing required field \"apiVersion\"".into()),
    }
    if kind.is_empty() {
        err("kind", "missing required field \"kind\"".into());
    }
    let name = manifest.pointer("/metadata/name").and_then(|n| n.as_str()).unwrap_or("");
    if name.is_empty() {
        err("metadata.name", "missing required field \"name\"".into());
    } else if name.len() > 253 || !DNS_SUBDOMAIN.is_match(name) {
        err("metadata.name", format!("invalid name {:?}: must be a lowercase RFC 1123 subdomain", name));
    }
    if let Some(ns) = manifest.pointer("/metadata/namespace") {
        match ns.as_str() {
            Some(ns) if ns.len() <= 63 && DNS_LABEL.is_match(ns) => {}
            Some(ns) => err("metadata.namespace", format!("invalid namespace {:?}: must be a lowercase RFC 1123 label", ns)),
            None => err("metadata.namespace", type_reason(ns, "string")),
        }
    }
    if let Some(labels) = manifest.pointer("/metadata/labels").and_then(|l| l.as_object()) {
        for (k, v) in labels {
            if !valid_label_key(k) {
                err("metadata.labels", format!("invalid label key {:?}", k));
            }
            match v.as_str() {
                Some(s) if s.is_empty() || (s.len() <= 63 && QUALIFIED_NAME.is_match(s)) => {}
                Some(s) => err("metadata.labels", format!("invalid label value {:?} for key {:?}", s, k)),
                None => err(&format!("metadata.labels.{}", k), type_reason(v, "string")),
            }
        }
    }
    if let Some(ann) = manifest.pointer("/metadata/annotations").and_then(|a| a.as_object()) {
        for (k, v) in ann {
            if !v.is_string() {
                err(&format!("metadata.annotations.{}", k), type_reason(v, "string"));
            }
        }
    }

    match kind {
        "ConfigMap" | "Secret" => {
            for field in ["data", "stringData"] {
                if let Some(data) = manifest.get(field).and_then(|d| d.as_object()) {
                    for (k, v) in data {
                        if !v.is_string() {
                            err(&format!("{}.{}", field, k), type_reason(v, "string"));
                        }
                    }
                }
            }
        }
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            if let Some(r) = manifest.pointer("/spec/replicas") {
                if !r.is_i64() && !r.is_u64() {
                    err("spec.replicas", type_reason(r, "integer"));
                }
            }
            if let Some(c) = manifest.pointer("/spec/template/spec/containers") {
                if !c.is_array() {
                    err("spec.template.spec.containers", type_reason(c, "array"));
                }
            }
        }
        "Pod" => {
            if let Some(c) = manifest.pointer("/spec/containers") {
                if !c.is_array() {
                    err("spec.containers", type_reason(c, "array"));
                }
            }
        }
        _ => {}
    }
    errs
}

fn valid_label_key(k: &str) -> bool {
    let (prefix, name) = match k.rsplit_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, k),
    };
    if let Some(p) = prefix {
        if p.is_empty() || p.len() > 253 || !DNS_SUBDOMAIN.is_match(p) {
            return false;
        }
    }
    !name.is_empty() && name.len() <= 63 && QUALIFIED_NAME.is_match(name)
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(n) if n.is_f64() => "number",
        Json::Number(_) => "integer",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn type_reason(v: &Json, expected: &str) -> String { format!("invalid type: got {:?}, expected {:?}", type_name(v), expected) }
