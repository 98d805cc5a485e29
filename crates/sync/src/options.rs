use std::collections::BTreeMap;
use std::time::Duration;

use drift_core::{DriftError, DriftResult, ResourceKey, SyncOptions};
use serde::{Deserialize, Serialize};

/// Exponential backoff between whole-operation attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Backoff {
    pub duration_ms: u64,
    pub factor: u32,
    pub max_duration_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self { Self { duration_ms: 5_000, factor: 2, max_duration_ms: 180_000 } }
}

impl Backoff {
    pub fn fixed(d: Duration) -> Self {
        let ms = d.as_millis() as u64;
        Self { duration_ms: ms, factor: 1, max_duration_ms: ms }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let mut ms = self.duration_ms;
        for _ in 1..retry {
            ms = ms.saturating_mul(self.factor.max(1) as u64);
            if ms >= self.max_duration_ms {
                break;
            }
        }
        Duration::from_millis(ms.min(self.max_duration_ms.max(self.duration_ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_attempts: 1, backoff: Backoff::default() } }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self { Self { max_attempts: max_attempts.max(1), backoff } }
}

/// Equality-based label selector (`a=b,c=d`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn parse(s: &str) -> DriftResult<Self> {
        let mut match_labels = BTreeMap::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once("==")
                .or_else(|| part.split_once('='))
                .ok_or_else(|| DriftError::Invalid(format!("invalid label selector term {:?}", part)))?;
            match_labels.insert(k.trim().to_string(), v.trim().to_string());
        }
        if match_labels.is_empty() {
            return Err(DriftError::Invalid("empty label selector".into()));
        }
        Ok(Self { match_labels })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Which resources an operation touches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncScope {
    #[default]
    All,
    Selector(LabelSelector),
    Resources(Vec<ResourceKey>),
}

impl SyncScope {
    pub fn is_all(&self) -> bool { matches!(self, SyncScope::All) }

    pub fn includes(&self, key: &ResourceKey, labels: &BTreeMap<String, String>) -> bool {
        match self {
            SyncScope::All => true,
            SyncScope::Selector(sel) => sel.matches(labels),
            SyncScope::Resources(keys) => keys.contains(key),
        }
    }
}

/// Caller-supplied knobs for one sync operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncRequest {
    pub scope: SyncScope,
    pub dry_run: bool,
    pub prune: bool,
    pub force: bool,
    pub replace: bool,
    pub retry: RetryPolicy,
    /// PreSync hook failures do not block the main phase.
    pub async_hooks: bool,
    pub timeout_secs: Option<u64>,
    pub wait_for_health: bool,
    /// Overlaid on the application's sync options; resource annotations still win.
    pub sync_options: SyncOptions,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self {
            scope: SyncScope::All,
            dry_run: false,
            prune: false,
            force: false,
            replace: false,
            retry: RetryPolicy::default(),
            async_hooks: false,
            timeout_secs: None,
            wait_for_health: true,
            sync_options: SyncOptions::default(),
        }
    }
}

impl SyncRequest {
    pub fn timeout(&self) -> Option<Duration> { self.timeout_secs.map(Duration::from_secs) }

    pub fn prune(mut self, on: bool) -> Self {
        self.prune = on;
        self
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    pub fn scope(mut self, scope: SyncScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let b = Backoff { duration_ms: 1_000, factor: 2, max_duration_ms: 5_000 };
        assert_eq!(b.delay(1), Duration::from_secs(1));
        assert_eq!(b.delay(2), Duration::from_secs(2));
        assert_eq!(b.delay(3), Duration::from_secs(4));
        assert_eq!(b.delay(4), Duration::from_secs(5));
        assert_eq!(Backoff::fixed(Duration::from_secs(1)).delay(7), Duration::from_secs(1));
    }

    #[test]
    fn selector_parse_and_match() {
        let sel = LabelSelector::parse("tier=web, team==a").unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "web".to_string());
        assert!(!sel.matches(&labels));
        labels.insert("team".to_string(), "a".to_string());
        assert!(sel.matches(&labels));
        assert!(LabelSelector::parse("nonsense").is_err());
        assert!(LabelSelector::parse("").is_err());
    }
}
