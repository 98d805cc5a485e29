//! Recognized annotation/label vocabulary and option parsing.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{DriftError, DriftResult};

pub const SYNC_WAVE: &str = "drift.dev/sync-wave";
pub const HOOK: &str = "drift.dev/hook";
pub const HOOK_DELETE_POLICY: &str = "drift.dev/hook-delete-policy";
pub const SYNC_OPTIONS: &str = "drift.dev/sync-options";
pub const COMPARE_OPTIONS: &str = "drift.dev/compare-options";
pub const TRACKING_ID: &str = "drift.dev/tracking-id";
pub const DEFAULT_TRACKING_LABEL: &str = "app.kubernetes.io/instance";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookType {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
    Skip,
}

impl std::str::FromStr for HookType {
    type Err = DriftError;

    fn from_str(s: &str) -> DriftResult<Self> {
        match s.trim() {
            "PreSync" => Ok(HookType::PreSync),
            "Sync" => Ok(HookType::Sync),
            "PostSync" => Ok(HookType::PostSync),
            "SyncFail" => Ok(HookType::SyncFail),
            "Skip" => Ok(HookType::Skip),
            other => Err(DriftError::Validation(format!("unknown hook type {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookDeletePolicy {
    BeforeHookCreation,
    HookSucceeded,
    HookFailed,
}

impl std::str::FromStr for HookDeletePolicy {
    type Err = DriftError;

    fn from_str(s: &str) -> DriftResult<Self> {
        match s.trim() {
            "BeforeHookCreation" => Ok(HookDeletePolicy::BeforeHookCreation),
            "HookSucceeded" => Ok(HookDeletePolicy::HookSucceeded),
            "HookFailed" => Ok(HookDeletePolicy::HookFailed),
            other => Err(DriftError::Validation(format!("unknown hook delete policy {:?}", other))),
        }
    }
}

pub fn parse_hooks(v: &str) -> DriftResult<SmallVec<[HookType; 2]>> {
    let mut out = SmallVec::new();
    for part in v.split(',').filter(|p| !p.trim().is_empty()) {
        let h: HookType = part.parse()?;
        if !out.contains(&h) { out.push(h); }
    }
    Ok(out)
}

pub fn parse_delete_policies(v: &str) -> DriftResult<SmallVec<[HookDeletePolicy; 2]>> {
    let mut out = SmallVec::new();
    for part in v.split(',').filter(|p| !p.trim().is_empty()) {
        let p: HookDeletePolicy = part.parse()?;
        if !out.contains(&p) { out.push(p); }
    }
    Ok(out)
}

pub fn parse_wave(v: &str) -> DriftResult<i32> {
    v.trim().parse::<i32>().map_err(|_| DriftError::Validation(format!("invalid sync wave {:?}", v)))
}

/// `Key=value` options from `drift.dev/sync-options` (or the application sync policy).
/// Unset fields fall back to the next layer, then to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub prune: Option<bool>,
    pub validate: Option<bool>,
    pub replace: Option<bool>,
    pub create_namespace: Option<bool>,
    pub respect_ignore_differences: Option<bool>,
}

impl SyncOptions {
    /// Unrecognized entries are ignored.
    pub fn parse(v: &str) -> Self {
        let mut out = Self::default();
        for entry in v.split(',') {
            let Some((k, val)) = entry.trim().split_once('=') else { continue };
            let b = match val.trim() {
                "true" => true,
                "false" => false,
                _ => continue,
            };
            match k.trim() {
                "Prune" => out.prune = Some(b),
                "Validate" => out.validate = Some(b),
                "Replace" => out.replace = Some(b),
                "CreateNamespace" => out.create_namespace = Some(b),
                "RespectIgnoreDifferences" => out.respect_ignore_differences = Some(b),
                _ => {}
            }
        }
        out
    }

    pub fn parse_list<S: AsRef<str>>(items: &[S]) -> Self {
        items.iter().fold(Self::default(), |acc, s| Self::parse(s.as_ref()).overlay(&acc))
    }

    /// Fields set on `self` win over `base`.
    pub fn overlay(&self, base: &SyncOptions) -> SyncOptions {
        SyncOptions {
            prune: self.prune.or(base.prune),
            validate: self.validate.or(base.validate),
            replace: self.replace.or(base.replace),
            create_namespace: self.create_namespace.or(base.create_namespace),
            respect_ignore_differences: self.respect_ignore_differences.or(base.respect_ignore_differences),
        }
    }

    pub fn prune(&self) -> bool { self.prune.unwrap_or(true) }
    pub fn validate(&self) -> bool { self.validate.unwrap_or(true) }
    pub fn replace(&self) -> bool { self.replace.unwrap_or(false) }
    pub fn create_namespace(&self) -> bool { self.create_namespace.unwrap_or(false) }
    pub fn respect_ignore_differences(&self) -> bool { self.respect_ignore_differences.unwrap_or(false) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareOptions {
    pub ignore_extraneous: bool,
}

impl CompareOptions {
    pub fn parse(v: &str) -> Self {
        Self { ignore_extraneous: v.split(',').any(|p| p.trim() == "IgnoreExtraneous") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_options_overlay_prefers_resource() {
        let app = SyncOptions::parse("Replace=true,CreateNamespace=true");
        let res = SyncOptions::parse("Replace=false");
        let eff = res.overlay(&app);
        assert!(!eff.replace());
        assert!(eff.create_namespace());
        assert!(eff.prune());
    }

    #[test]
    fn unknown_options_are_ignored() {
        let o = SyncOptions::parse("Foo=bar,Prune=maybe,Validate=false");
        assert_eq!(o, SyncOptions { validate: Some(false), ..Default::default() });
    }

    #[test]
    fn hooks_parse_and_dedupe() {
        let h = parse_hooks("PreSync, PreSync,SyncFail").unwrap();
        assert_eq!(h.as_slice(), &[HookType::PreSync, HookType::SyncFail]);
        assert!(parse_hooks("Later").is_err());
    }

    #[test]
    fn compare_options_detect_ignore_extraneous() {
        assert!(CompareOptions::parse("IgnoreExtraneous").ignore_extraneous);
        assert!(!CompareOptions::parse("ServerSideDiff=true").ignore_extraneous);
    }
}
