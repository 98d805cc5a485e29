use chrono::{DateTime, Utc};
use drift_core::{annotations::HookType, OperationPhase, ResourceKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::options::SyncRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
}

impl SyncPhase {
    pub fn of_hook(h: HookType) -> Option<SyncPhase> {
        match h {
            HookType::PreSync => Some(SyncPhase::PreSync),
            HookType::Sync => Some(SyncPhase::Sync),
            HookType::PostSync => Some(SyncPhase::PostSync),
            HookType::SyncFail => Some(SyncPhase::SyncFail),
            HookType::Skip => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Synced,
    SyncFailed,
    Pruned,
    PruneSkipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookPhase {
    Running,
    Succeeded,
    Failed,
    Terminating,
}

/// Outcome of one task within one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub key: ResourceKey,
    pub status: ResultCode,
    pub message: String,
    pub hook_type: Option<HookType>,
    pub hook_phase: Option<HookPhase>,
    pub sync_phase: SyncPhase,
    pub wave: i32,
}

impl ResourceResult {
    pub fn is_failed(&self) -> bool { self.status == ResultCode::SyncFailed }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub attempt: u32,
    pub phase: OperationPhase,
    pub message: String,
    pub resources: Vec<ResourceResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One sync operation; `result` holds the authoritative (latest) attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: Uuid,
    pub app: String,
    pub revision: String,
    pub request: SyncRequest,
    pub phase: OperationPhase,
    pub message: String,
    pub result: Vec<ResourceResult>,
    pub attempts: Vec<AttemptResult>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    pub fn new(app: impl Into<String>, revision: impl Into<String>, request: SyncRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            app: app.into(),
            revision: revision.into(),
            request,
            phase: OperationPhase::Running,
            message: String::new(),
            result: Vec::new(),
            attempts: Vec::new(),
            retry_count: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool { self.phase.is_terminal() }

    pub fn resource(&self, key: &ResourceKey) -> Option<&ResourceResult> { self.result.iter().find(|r| &r.key == key) }

    /// Messages of every result for `key` in order (a hook may appear in several phases).
    pub fn messages_for(&self, key: &ResourceKey) -> Vec<&str> {
        self.result.iter().filter(|r| &r.key == key).map(|r| r.message.as_str()).collect()
    }
}
