use drift_core::{Condition, ConditionKind, ResourceStatus, SyncStatusCode};

use crate::policy::PolicyViolation;

/// One compared resource plus the policy verdict for it.
#[derive(Debug, Clone)]
pub struct ResourceVerdict {
    pub status: ResourceStatus,
    pub violation: Option<PolicyViolation>,
}

impl ResourceVerdict {
    pub fn new(status: ResourceStatus) -> Self { Self { status, violation: None } }
}

/// Fold per-resource results into the application code: OutOfSync > Unknown > Synced.
/// Forbidden resources are forced to Unknown and each yields an InvalidSpecError. Hooks and
/// extraneous-but-ignored resources never count.
pub fn aggregate(results: &mut [ResourceVerdict]) -> (SyncStatusCode, Vec<Condition>) {
    let mut conditions = Vec::new();
    let mut out_of_sync = false;
    let mut unknown = false;
    for r in results.iter_mut() {
        if let Some(v) = r.violation.as_ref() {
            r.status.permitted = false;
            r.status.status = SyncStatusCode::Unknown;
            conditions.push(Condition::new(ConditionKind::InvalidSpecError, format!("{}: {}", r.status.key, v)));
        }
        if r.status.hook || (r.status.ignore_extraneous && r.status.requires_pruning) {
            continue;
        }
        match r.status.status {
            SyncStatusCode::OutOfSync => out_of_sync = true,
            SyncStatusCode::Unknown => unknown = true,
            SyncStatusCode::Synced => {}
        }
    }
    let code = if out_of_sync {
        SyncStatusCode::OutOfSync
    } else if unknown {
        SyncStatusCode::Unknown
    } else {
        SyncStatusCode::Synced
    };
    (code, conditions)
}
