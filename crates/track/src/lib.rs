//! Drift resource tracker: stamps and resolves ownership markers on cluster objects.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use drift_core::annotations::{DEFAULT_TRACKING_LABEL, TRACKING_ID};
use drift_core::{set_meta_entry, DriftError, DriftResult, LiveResource, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

const LABEL_VALUE_MAX: usize = 63;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMethod {
    #[default]
    Label,
    Annotation,
}

impl FromStr for TrackingMethod {
    type Err = DriftError;

    fn from_str(s: &str) -> DriftResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "label" => Ok(TrackingMethod::Label),
            "annotation" => Ok(TrackingMethod::Annotation),
            other => Err(DriftError::Invalid(format!("unknown tracking method {:?}", other))),
        }
    }
}

/// `<app>:<group>/<kind>:<namespace>/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingValue {
    pub app: String,
    pub key: ResourceKey,
}

impl fmt::Display for TrackingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}:{}/{}", self.app, self.key.group, self.key.kind, self.key.namespace, self.key.name)
    }
}

impl TrackingValue {
    pub fn parse(s: &str) -> Option<Self> {
        let (app, rest) = s.split_once(':')?;
        let (gk, nn) = rest.split_once(':')?;
        let (group, kind) = gk.split_once('/')?;
        let (namespace, name) = nn.split_once('/')?;
        if app.is_empty() || kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self { app: app.to_string(), key: ResourceKey::new(group, kind, namespace, name) })
    }
}

/// Coerce `name` into a legal label value: illegal characters dropped, truncated to 63,
/// trimmed to alphanumeric ends. Distinct names may collapse to the same value.
pub fn sanitize_label_value(name: &str) -> String {
    let mut v: String = name.chars().filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')).collect();
    v.truncate(LABEL_VALUE_MAX);
    v.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

/// The single tracking configuration consulted by every reader and writer of ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTracker {
    pub method: TrackingMethod,
    pub label_key: String,
}

impl Default for ResourceTracker {
    fn default() -> Self { Self { method: TrackingMethod::Label, label_key: DEFAULT_TRACKING_LABEL.to_string() } }
}

impl ResourceTracker {
    pub fn new(method: TrackingMethod) -> Self { Self { method, ..Default::default() } }

    pub fn with_label_key(mut self, key: impl Into<String>) -> Self {
        self.label_key = key.into();
        self
    }

    /// `DRIFT_TRACKING_METHOD` / `DRIFT_TRACKING_LABEL`, defaults otherwise.
    pub fn from_env() -> Self {
        let method = std::env::var("DRIFT_TRACKING_METHOD").ok().and_then(|s| s.parse().ok()).unwrap_or_default();
        let label_key = std::env::var("DRIFT_TRACKING_LABEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TRACKING_LABEL.to_string());
        Self { method, label_key }
    }

    pub fn assign(&self, key: &ResourceKey, app: &str) -> TrackingValue { TrackingValue { app: app.to_string(), key: key.clone() } }

    /// Write the marker for `app` into a desired manifest.
    pub fn stamp(&self, manifest: &mut Json, app: &str) -> DriftResult<()> {
        let key = ResourceKey::from_manifest(manifest).ok_or_else(|| DriftError::Validation("manifest without identity".into()))?;
        match self.method {
            TrackingMethod::Label => set_meta_entry(manifest, "labels", &self.label_key, &sanitize_label_value(app)),
            TrackingMethod::Annotation => set_meta_entry(manifest, "annotations", TRACKING_ID, &self.assign(&key, app).to_string()),
        }
        Ok(())
    }

    /// Owner recorded under the active method, if any. Never inspects the other method.
    pub fn resolve(&self, live: &LiveResource) -> Option<String> {
        match self.method {
            TrackingMethod::Label => live.label(&self.label_key).filter(|v| !v.is_empty()).map(|v| v.to_string()),
            TrackingMethod::Annotation => {
                let raw = live.annotation(TRACKING_ID)?;
                let tv = TrackingValue::parse(raw)?;
                if !same_identity(&tv.key, &live.key) {
                    debug!(key = %live.key, value = raw, "tracking id refers to a different resource");
                    return None;
                }
                Some(tv.app)
            }
        }
    }

    pub fn is_owned_by(&self, live: &LiveResource, app: &str) -> bool {
        match (self.method, self.resolve(live)) {
            (_, None) => false,
            (TrackingMethod::Label, Some(owner)) => owner == sanitize_label_value(app),
            (TrackingMethod::Annotation, Some(owner)) => owner == app,
        }
    }
}

/// The encoded namespace may be empty for namespaced objects applied without one.
fn same_identity(encoded: &ResourceKey, actual: &ResourceKey) -> bool {
    encoded.group == actual.group
        && encoded.kind == actual.kind
        && encoded.name == actual.name
        && (encoded.namespace == actual.namespace || encoded.namespace.is_empty())
}
