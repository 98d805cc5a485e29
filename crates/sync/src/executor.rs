//! Operation executor: phases, waves, hooks, prune, retry and cancellation.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use drift_core::annotations::HookDeletePolicy;
use drift_core::{HealthStatusCode, OperationPhase, ResourceKey};
use drift_diff::preserve_ignored;
use drift_health::HealthRegistry;
use drift_kubehub::{ApplyParams, ClusterClient, ClusterError, ClusterResult};
use futures::future::join_all;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::options::SyncRequest;
use crate::plan::{kind_groups, SyncPlan, SyncTask, TaskAction};
use crate::result::{AttemptResult, HookPhase, ResourceResult, ResultCode, SyncOperation, SyncPhase};
use crate::SyncSettings;

const SUCCESS_MESSAGE: &str = "successfully synced (all tasks run)";
const FAILURE_MESSAGE: &str = "one or more synchronization tasks completed unsuccessfully";

enum Outcome {
    Succeeded,
    Failed(String),
    Terminated,
    Error(String),
}

impl Outcome {
    fn summary(&self) -> (OperationPhase, String) {
        match self {
            Outcome::Succeeded => (OperationPhase::Succeeded, SUCCESS_MESSAGE.to_string()),
            Outcome::Failed(m) => (OperationPhase::Failed, m.clone()),
            Outcome::Terminated => (OperationPhase::Failed, "Operation terminated".to_string()),
            Outcome::Error(m) => (OperationPhase::Error, m.clone()),
        }
    }
}

enum HookVerdict {
    Succeeded(String),
    Failed(String),
    Terminated,
}

/// Collaborators one application's operations run against.
pub struct SyncContext {
    pub app: String,
    pub cluster: Arc<dyn ClusterClient>,
    pub health: Arc<HealthRegistry>,
    pub settings: SyncSettings,
}

impl SyncContext {
    pub fn new(app: impl Into<String>, cluster: Arc<dyn ClusterClient>, health: Arc<HealthRegistry>) -> Self {
        Self { app: app.into(), cluster, health, settings: SyncSettings::from_env() }
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run `plan` to a terminal phase. Every state change is published on `updates`;
    /// cancelling `cancel` terminates cooperatively.
    pub async fn execute(
        &self,
        plan: &SyncPlan,
        mut op: SyncOperation,
        cancel: CancellationToken,
        updates: &watch::Sender<SyncOperation>,
    ) -> SyncOperation {
        let t0 = Instant::now();
        counter!("sync_operations_total", 1);
        info!(app = %self.app, op = %op.id, tasks = plan.tasks.len(), dry_run = op.request.dry_run, "sync started");
        self.publish(updates, &mut op, &cancel);

        let limit = op.request.timeout();
        let outcome = {
            let run = self.run_attempts(plan, &mut op, &cancel, updates);
            match limit {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(o) => o,
                    Err(_) => Outcome::Error(format!("operation timed out after {}s", limit.as_secs())),
                },
                None => run.await,
            }
        };
        let (phase, mut message) = outcome.summary();
        if let Some(last) = op.attempts.last_mut() {
            if last.phase == OperationPhase::Running {
                last.phase = phase;
                last.message = message.clone();
                last.resources = op.result.clone();
                last.finished_at = Utc::now();
            }
        }

        if matches!(outcome, Outcome::Failed(_)) && plan.has_phase(SyncPhase::SyncFail) {
            // SyncFail results are informational; the verdict stays Failed.
            let _ = self.run_phase(plan, SyncPhase::SyncFail, &mut op, &cancel, updates).await;
        }
        if op.retry_count > 0 {
            message = format!("{} (retried {} times)", message, op.retry_count);
        }
        op.phase = phase;
        op.message = message;
        op.finished_at = Some(Utc::now());
        histogram!("sync_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(app = %self.app, op = %op.id, phase = %op.phase, retries = op.retry_count, took_ms = %t0.elapsed().as_millis(), "sync finished");
        let _ = updates.send_replace(op.clone());
        op
    }

    fn publish(&self, updates: &watch::Sender<SyncOperation>, op: &mut SyncOperation, cancel: &CancellationToken) {
        if cancel.is_cancelled() && !op.phase.is_terminal() {
            op.phase = OperationPhase::Terminating;
        }
        let _ = updates.send_replace(op.clone());
    }

    async fn run_attempts(
        &self,
        plan: &SyncPlan,
        op: &mut SyncOperation,
        cancel: &CancellationToken,
        updates: &watch::Sender<SyncOperation>,
    ) -> Outcome {
        let retry = op.request.retry.clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            counter!("sync_attempts_total", 1);
            op.result.clear();
            op.attempts.push(AttemptResult {
                attempt,
                phase: OperationPhase::Running,
                message: String::new(),
                resources: Vec::new(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
            });
            let outcome = self.run_attempt(plan, op, cancel, updates).await;
            let (phase, message) = outcome.summary();
            let resources = op.result.clone();
            if let Some(a) = op.attempts.last_mut() {
                a.phase = phase;
                a.message = message;
                a.resources = resources;
                a.finished_at = Utc::now();
            }
            match outcome {
                Outcome::Failed(ref m) if attempt < retry.max_attempts && !cancel.is_cancelled() => {
                    let delay = retry.backoff.delay(attempt);
                    op.retry_count += 1;
                    warn!(app = %self.app, attempt, delay_ms = delay.as_millis() as u64, error = %m, "sync attempt failed; retrying");
                    self.publish(updates, op, cancel);
                    tokio::select! {
                        _ = cancel.cancelled() => return Outcome::Terminated,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn run_attempt(
        &self,
        plan: &SyncPlan,
        op: &mut SyncOperation,
        cancel: &CancellationToken,
        updates: &watch::Sender<SyncOperation>,
    ) -> Outcome {
        if let Some(ns) = plan.namespace.as_ref() {
            if let Some(r) = self.ensure_namespace(ns, op.request.dry_run).await {
                let failure = r.is_failed().then(|| format!("{} ({}: {})", FAILURE_MESSAGE, r.key, r.message));
                op.result.push(r);
                if let Some(m) = failure {
                    return Outcome::Failed(m);
                }
            }
        }
        match self.run_phase(plan, SyncPhase::PreSync, op, cancel, updates).await {
            Outcome::Succeeded => {}
            Outcome::Failed(m) if op.request.async_hooks => debug!(app = %self.app, error = %m, "presync hook failed; continuing"),
            other => return other,
        }
        match self.run_phase(plan, SyncPhase::Sync, op, cancel, updates).await {
            Outcome::Succeeded => {}
            other => return other,
        }
        self.run_phase(plan, SyncPhase::PostSync, op, cancel, updates).await
    }

    async fn run_phase(
        &self,
        plan: &SyncPlan,
        phase: SyncPhase,
        op: &mut SyncOperation,
        cancel: &CancellationToken,
        updates: &watch::Sender<SyncOperation>,
    ) -> Outcome {
        let waves = plan.waves(phase);
        let last_wave = waves.keys().next_back().copied();
        let await_health = phase == SyncPhase::Sync && op.request.wait_for_health && !op.request.dry_run;
        let post_sync = plan.has_phase(SyncPhase::PostSync);
        for (wave, tasks) in waves.iter() {
            let mut failed = Vec::new();
            let mut applied = Vec::new();
            for group in kind_groups(tasks) {
                if cancel.is_cancelled() {
                    return Outcome::Terminated;
                }
                let results = join_all(group.iter().map(|t| self.run_task(t, &op.request, cancel))).await;
                for r in results {
                    if r.is_failed() {
                        failed.push(format!("{}: {}", r.key, r.message));
                    } else if r.status == ResultCode::Synced && r.hook_type.is_none() {
                        applied.push(r.key.clone());
                    }
                    op.result.push(r);
                }
                self.publish(updates, op, cancel);
            }
            if cancel.is_cancelled() {
                return Outcome::Terminated;
            }
            if !failed.is_empty() {
                counter!("sync_resource_errors_total", failed.len() as u64);
                warn!(app = %self.app, ?phase, wave, failures = failed.len(), "wave failed");
                return Outcome::Failed(format!("{} ({})", FAILURE_MESSAGE, failed.join("; ")));
            }
            if await_health && (Some(*wave) != last_wave || post_sync) {
                if let Err(o) = self.wait_healthy(&applied, cancel).await {
                    return o;
                }
            }
        }
        Outcome::Succeeded
    }

    async fn run_task(&self, task: &SyncTask, req: &SyncRequest, cancel: &CancellationToken) -> ResourceResult {
        match (task.action, task.hook) {
            (TaskAction::Prune, _) => self.prune(task, req).await,
            (TaskAction::Apply, Some(_)) => self.run_hook(task, req, cancel).await,
            (TaskAction::Apply, None) => self.apply(task, req).await,
        }
    }

    async fn apply(&self, task: &SyncTask, req: &SyncRequest) -> ResourceResult {
        let Some(manifest) = task.manifest.as_ref() else {
            return task_result(task, ResultCode::SyncFailed, "no manifest to apply");
        };
        // Ignored paths keep their live values.
        let prepared = match task.live.as_ref() {
            Some(live) if task.options.respect_ignore_differences() && !task.ignored.is_empty() => {
                let mut m = manifest.clone();
                preserve_ignored(&mut m, live, &task.ignored);
                Cow::Owned(m)
            }
            _ => Cow::Borrowed(manifest),
        };
        let manifest: &Json = &prepared;
        let params = ApplyParams::dry_run(req.dry_run);
        let exists = task.live.is_some();
        let outcome = if exists && (task.options.replace() || req.replace) {
            self.recreate(&task.key, manifest, &params).await.map(|_| "replaced")
        } else {
            let verb = match (exists, task.in_sync) {
                (false, _) => "created",
                (true, true) => "unchanged",
                (true, false) => "configured",
            };
            self.cluster.apply(manifest, &params).await.map(|_| verb)
        };
        match outcome {
            Ok(verb) => task_result(task, ResultCode::Synced, format!("{} {}", task.key.short(), verb)),
            Err(ClusterError::Invalid(m)) if req.force && exists => {
                debug!(key = %task.key, error = %m, "update rejected; forcing recreate");
                match self.recreate(&task.key, manifest, &params).await {
                    Ok(_) => task_result(task, ResultCode::Synced, format!("{} replaced", task.key.short())),
                    Err(e) => task_result(task, ResultCode::SyncFailed, e.to_string()),
                }
            }
            Err(e) => {
                warn!(key = %task.key, error = %e, "apply failed");
                task_result(task, ResultCode::SyncFailed, e.to_string())
            }
        }
    }

    async fn recreate(&self, key: &ResourceKey, manifest: &Json, params: &ApplyParams) -> ClusterResult<()> {
        match self.cluster.delete(key, params.dry_run).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.cluster.apply(manifest, params).await.map(|_| ())
    }

    async fn prune(&self, task: &SyncTask, req: &SyncRequest) -> ResourceResult {
        if !task.options.prune() {
            return task_result(task, ResultCode::PruneSkipped, "ignored (no prune)");
        }
        if !req.prune {
            return task_result(task, ResultCode::PruneSkipped, "ignored (requires pruning)");
        }
        match self.cluster.delete(&task.key, req.dry_run).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => task_result(task, ResultCode::Pruned, format!("{} pruned", task.key.short())),
            Err(e) => {
                warn!(key = %task.key, error = %e, "prune failed");
                task_result(task, ResultCode::SyncFailed, e.to_string())
            }
        }
    }

    async fn run_hook(&self, task: &SyncTask, req: &SyncRequest, cancel: &CancellationToken) -> ResourceResult {
        let Some(manifest) = task.manifest.as_ref() else {
            return self.finish_hook(task, req, HookVerdict::Failed("no manifest to apply".into())).await;
        };
        if task.delete_policies.contains(&HookDeletePolicy::BeforeHookCreation) {
            let existing = match self.cluster.get(&task.key).await {
                Ok(l) => l,
                Err(e) => return self.finish_hook(task, req, HookVerdict::Failed(e.to_string())).await,
            };
            if existing.is_some() {
                match self.cluster.delete(&task.key, req.dry_run).await {
                    Ok(()) | Err(ClusterError::NotFound(_)) => {}
                    Err(e) => return self.finish_hook(task, req, HookVerdict::Failed(e.to_string())).await,
                }
            }
        }
        if let Err(e) = self.cluster.apply(manifest, &ApplyParams::dry_run(req.dry_run)).await {
            return self.finish_hook(task, req, HookVerdict::Failed(e.to_string())).await;
        }
        let verdict = if req.dry_run {
            HookVerdict::Succeeded(format!("{} created", task.key.short()))
        } else {
            self.wait_hook(task, cancel).await
        };
        self.finish_hook(task, req, verdict).await
    }

    /// Completion is decided by health: Healthy succeeds, Degraded fails, kinds without a
    /// check succeed once applied.
    async fn wait_hook(&self, task: &SyncTask, cancel: &CancellationToken) -> HookVerdict {
        let gk = task.key.group_kind();
        let short = task.key.short();
        if !self.health.has_check(&gk) {
            return HookVerdict::Succeeded(format!("{} created", short));
        }
        let deadline = Instant::now() + self.settings.hook_timeout;
        loop {
            let live = match self.cluster.get(&task.key).await {
                Ok(l) => l,
                Err(e) => return HookVerdict::Failed(e.to_string()),
            };
            match self.health.evaluate(&gk, live.as_ref().map(|l| &l.object)) {
                Some(h) if h.status == HealthStatusCode::Healthy => {
                    return HookVerdict::Succeeded(h.message.unwrap_or_else(|| format!("{} completed", short)))
                }
                Some(h) if h.status == HealthStatusCode::Degraded => {
                    return HookVerdict::Failed(h.message.unwrap_or_else(|| format!("{} failed", short)))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return HookVerdict::Failed(format!("timed out waiting for hook {}", short));
            }
            tokio::select! {
                _ = cancel.cancelled() => return HookVerdict::Terminated,
                _ = tokio::time::sleep(self.settings.health_poll) => {}
            }
        }
    }

    async fn finish_hook(&self, task: &SyncTask, req: &SyncRequest, verdict: HookVerdict) -> ResourceResult {
        let (status, phase, message, policy) = match verdict {
            HookVerdict::Succeeded(m) => (ResultCode::Synced, HookPhase::Succeeded, m, Some(HookDeletePolicy::HookSucceeded)),
            HookVerdict::Failed(m) => (ResultCode::SyncFailed, HookPhase::Failed, m, Some(HookDeletePolicy::HookFailed)),
            HookVerdict::Terminated => (ResultCode::SyncFailed, HookPhase::Terminating, "terminated".to_string(), None),
        };
        if let Some(policy) = policy.filter(|p| !req.dry_run && task.delete_policies.contains(p)) {
            match self.cluster.delete(&task.key, false).await {
                Ok(()) | Err(ClusterError::NotFound(_)) => debug!(key = %task.key, ?policy, "hook deleted"),
                Err(e) => warn!(key = %task.key, error = %e, "hook cleanup failed"),
            }
        }
        ResourceResult { hook_phase: Some(phase), ..task_result(task, status, message) }
    }

    /// Wait until no resource in `keys` is Progressing or Missing. Degraded fails the wave.
    async fn wait_healthy(&self, keys: &[ResourceKey], cancel: &CancellationToken) -> Result<(), Outcome> {
        let deadline = Instant::now() + self.settings.health_timeout;
        loop {
            let mut pending = Vec::new();
            for key in keys {
                let gk = key.group_kind();
                if !self.health.has_check(&gk) {
                    continue;
                }
                let live = self.cluster.get(key).await.map_err(|e| Outcome::Error(format!("{}: {}", key, e)))?;
                match self.health.evaluate(&gk, live.as_ref().map(|l| &l.object)) {
                    Some(h) if h.status == HealthStatusCode::Degraded => {
                        let why = h.message.map(|m| format!(": {}", m)).unwrap_or_default();
                        return Err(Outcome::Failed(format!("{} ({} is Degraded{})", FAILURE_MESSAGE, key, why)));
                    }
                    Some(h) if matches!(h.status, HealthStatusCode::Progressing | HealthStatusCode::Missing) => pending.push(key),
                    _ => {}
                }
            }
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let names: Vec<String> = pending.iter().map(|k| k.to_string()).collect();
                return Err(Outcome::Error(format!("timed out waiting for healthy state of {}", names.join(", "))));
            }
            debug!(app = %self.app, pending = pending.len(), "waiting for wave health");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Outcome::Terminated),
                _ = tokio::time::sleep(self.settings.health_poll) => {}
            }
        }
    }

    async fn ensure_namespace(&self, manifest: &Json, dry_run: bool) -> Option<ResourceResult> {
        let key = ResourceKey::from_manifest(manifest)?;
        let (status, message) = match self.cluster.get(&key).await {
            Ok(Some(_)) => return None,
            Ok(None) => match self.cluster.apply(manifest, &ApplyParams::dry_run(dry_run)).await {
                Ok(_) => (ResultCode::Synced, format!("{} created", key.short())),
                Err(e) => (ResultCode::SyncFailed, e.to_string()),
            },
            Err(e) => (ResultCode::SyncFailed, e.to_string()),
        };
        info!(app = %self.app, namespace = %key.name, ?status, "destination namespace");
        Some(ResourceResult { key, status, message, hook_type: None, hook_phase: None, sync_phase: SyncPhase::PreSync, wave: 0 })
    }
}

fn task_result(task: &SyncTask, status: ResultCode, message: impl Into<String>) -> ResourceResult {
    ResourceResult {
        key: task.key.clone(),
        status,
        message: message.into(),
        hook_type: task.hook,
        hook_phase: None,
        sync_phase: task.phase,
        wave: task.wave,
    }
}
