//! Drift status: orphan/exclusion filter, project policy and sync-status aggregation.

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod compare;
pub mod filter;
pub mod policy;

pub use aggregate::{aggregate, ResourceVerdict};
pub use compare::{compare_app_state, AppComparison, CompareInput};
pub use filter::{classify, Classified, ExclusionRule, OrphanIgnore, OrphanPolicy, ResourceExclusions};
pub use policy::{AppProject, GroupKindPattern, PolicyRequest, PolicyViolation, ProjectDestination, ProjectPolicy};

/// Shell-style glob; an invalid pattern only matches itself.
pub(crate) fn glob_match(pattern: &str, value: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => pattern == value,
    }
}
