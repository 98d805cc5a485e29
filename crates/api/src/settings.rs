//! Engine settings: environment variables plus an optional YAML file.

use std::path::Path;

use anyhow::{Context, Result};
use drift_diff::IgnoreRule;
use drift_status::{AppProject, ExclusionRule, ResourceExclusions};
use drift_sync::SyncSettings;
use drift_track::{ResourceTracker, TrackingMethod};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROJECT: &str = "default";
pub const DEFAULT_SERVER: &str = "https://kubernetes.default.svc";
pub const DEFAULT_CLUSTER: &str = "in-cluster";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackingSettings {
    pub method: Option<TrackingMethod>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub tracking: TrackingSettings,
    pub exclusions: Vec<ExclusionRule>,
    /// Ignore rules applied to every application.
    pub resource_overrides: Vec<IgnoreRule>,
    pub projects: Vec<AppProject>,
    /// Retained history entries per application; `None` keeps everything.
    pub history_limit: Option<usize>,
    pub cluster_name: String,
    pub server: String,
    #[serde(skip)]
    pub sync: SyncSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tracking: TrackingSettings::default(),
            exclusions: Vec::new(),
            resource_overrides: Vec::new(),
            projects: Vec::new(),
            history_limit: None,
            cluster_name: DEFAULT_CLUSTER.into(),
            server: DEFAULT_SERVER.into(),
            sync: SyncSettings::default(),
        }
    }
}

impl Settings {
    /// Defaults overridden by `DRIFT_*` environment variables.
    pub fn from_env() -> Self {
        let mut s = Self::default();
        s.apply_env();
        s
    }

    /// YAML settings file, then `DRIFT_*` environment variables on top.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading settings {}", path.display()))?;
        let mut s = Self::from_yaml(&text).with_context(|| format!("parsing settings {}", path.display()))?;
        s.apply_env();
        Ok(s)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    fn apply_env(&mut self) {
        if let Some(m) = std::env::var("DRIFT_TRACKING_METHOD").ok().and_then(|s| s.parse().ok()) {
            self.tracking.method = Some(m);
        }
        if let Some(l) = std::env::var("DRIFT_TRACKING_LABEL").ok().filter(|s| !s.trim().is_empty()) {
            self.tracking.label = Some(l);
        }
        if let Some(n) = std::env::var("DRIFT_HISTORY_LIMIT").ok().and_then(|s| s.parse::<usize>().ok()) {
            self.history_limit = Some(n);
        }
        self.sync = SyncSettings::from_env();
    }

    pub fn tracker(&self) -> ResourceTracker {
        let base = ResourceTracker::new(self.tracking.method.unwrap_or_default());
        match &self.tracking.label {
            Some(l) => base.with_label_key(l.clone()),
            None => base,
        }
    }

    pub fn resource_exclusions(&self) -> ResourceExclusions { ResourceExclusions::new(self.exclusions.clone()) }

    /// The `default` project exists implicitly (permissive) unless configured.
    pub fn project(&self, name: &str) -> Option<AppProject> {
        match self.projects.iter().find(|p| p.name == name) {
            Some(p) => Some(p.clone()),
            None if name == DEFAULT_PROJECT => Some(AppProject::permissive(DEFAULT_PROJECT)),
            None => None,
        }
    }
}
