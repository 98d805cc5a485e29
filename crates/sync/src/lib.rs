//! Drift sync: ordered, hook-aware, retryable apply/prune operations.
//!
//! An operation is planned from one comparison (`SyncPlan::build`) and then executed by a
//! `SyncContext`. Execution walks PreSync hooks, the main waves (applies by kind class, then
//! prunes in reverse) and PostSync hooks; a failed attempt is retried as a whole.

#![forbid(unsafe_code)]

use std::time::Duration;

mod executor;
pub mod options;
pub mod plan;
pub mod result;
pub mod validate;

pub use executor::SyncContext;
pub use options::{Backoff, LabelSelector, RetryPolicy, SyncRequest, SyncScope};
pub use plan::{kind_rank, PlanInput, SyncPlan, SyncTask, TaskAction};
pub use result::{AttemptResult, HookPhase, ResourceResult, ResultCode, SyncOperation, SyncPhase};
pub use validate::validate_manifest;

/// Executor timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub health_poll: Duration,
    pub hook_timeout: Duration,
    pub health_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { health_poll: Duration::from_millis(500), hook_timeout: Duration::from_secs(300), health_timeout: Duration::from_secs(300) }
    }
}

impl SyncSettings {
    /// `DRIFT_HEALTH_POLL_MS`, `DRIFT_HOOK_TIMEOUT_SECS`, `DRIFT_HEALTH_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            health_poll: env_u64("DRIFT_HEALTH_POLL_MS").map(Duration::from_millis).unwrap_or(d.health_poll),
            hook_timeout: env_u64("DRIFT_HOOK_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.hook_timeout),
            health_timeout: env_u64("DRIFT_HEALTH_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.health_timeout),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> { std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()) }
