//! Built-in health checks for common workload and networking kinds.

use anyhow::Result;
use drift_core::{HealthState, HealthStatusCode as H};
use serde_json::Value as Json;

fn i64_at(v: &Json, ptr: &str) -> Option<i64> { v.pointer(ptr).and_then(|x| x.as_i64()) }

fn str_at<'a>(v: &'a Json, ptr: &str) -> Option<&'a str> { v.pointer(ptr).and_then(|x| x.as_str()) }

fn condition<'a>(v: &'a Json, kind: &str) -> Option<&'a Json> {
    v.pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .and_then(|c| c.iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some(kind)))
}

fn condition_is(v: &Json, kind: &str, status: &str) -> bool {
    condition(v, kind).and_then(|c| c.get("status")).and_then(|s| s.as_str()) == Some(status)
}

fn condition_message(v: &Json, kind: &str) -> String {
    condition(v, kind).and_then(|c| c.get("message")).and_then(|m| m.as_str()).unwrap_or("").to_string()
}

/// `status.observedGeneration` lags `metadata.generation`.
fn generation_pending(v: &Json) -> bool {
    match (i64_at(v, "/metadata/generation"), i64_at(v, "/status/observedGeneration")) {
        (Some(g), Some(o)) => o < g,
        (Some(_), None) => v.get("status").is_some(),
        _ => false,
    }
}

pub fn deployment(v: &Json) -> Result<HealthState> {
    if v.pointer("/spec/paused").and_then(|p| p.as_bool()) == Some(true) {
        return Ok(HealthState::with_message(H::Suspended, "Deployment is paused"));
    }
    if generation_pending(v) {
        return Ok(HealthState::with_message(H::Progressing, "Waiting for rollout to finish: observed deployment generation less than desired generation"));
    }
    if condition(v, "Progressing").and_then(|c| c.get("reason")).and_then(|r| r.as_str()) == Some("ProgressDeadlineExceeded") {
        let name = str_at(v, "/metadata/name").unwrap_or("");
        return Ok(HealthState::with_message(H::Degraded, format!("Deployment {:?} exceeded its progress deadline", name)));
    }
    let want = i64_at(v, "/spec/replicas").unwrap_or(1);
    let updated = i64_at(v, "/status/updatedReplicas").unwrap_or(0);
    let total = i64_at(v, "/status/replicas").unwrap_or(0);
    let available = i64_at(v, "/status/availableReplicas").unwrap_or(0);
    if updated < want {
        return Ok(HealthState::with_message(H::Progressing, format!("Waiting for rollout to finish: {} out of {} new replicas have been updated...", updated, want)));
    }
    if total > updated {
        return Ok(HealthState::with_message(H::Progressing, format!("Waiting for rollout to finish: {} old replicas are pending termination...", total - updated)));
    }
    if available < updated {
        return Ok(HealthState::with_message(H::Progressing, format!("Waiting for rollout to finish: {} of {} updated replicas are available...", available, updated)));
    }
    Ok(HealthState::new(H::Healthy))
}

pub fn stateful_set(v: &Json) -> Result<HealthState> {
    if generation_pending(v) {
        return Ok(HealthState::with_message(H::Progressing, "Waiting for statefulset spec update to be observed..."));
    }
    let want = i64_at(v, "/spec/replicas").unwrap_or(1);
    let ready = i64_at(v, "/status/readyReplicas").unwrap_or(0);
    if ready < want {
        return Ok(HealthState::with_message(H::Progressing, format!("Waiting for {} pods to be ready...", want - ready)));
    }
    let on_delete = str_at(v, "/spec/updateStrategy/type") == Some("OnDelete");
    let current = str_at(v, "/status/currentRevision");
    let update = str_at(v, "/status/updateRevision");
    if !on_delete && update.is_some() && current != update {
        return Ok(HealthState::with_message(H::Progressing, "waiting for statefulset rolling update to complete"));
    }
    Ok(HealthState::new(H::Healthy))
}

pub fn daemon_set(v: &Json) -> Result<HealthState> {
    if generation_pending(v) {
        return Ok(HealthState::with_message(H::Progressing, "Waiting for rollout to finish: observed daemon set generation less than desired generation"));
    }
    let desired = i64_at(v, "/status/desiredNumberScheduled").unwrap_or(0);
    let updated = i64_at(v, "/status/updatedNumberScheduled").unwrap_or(0);
    let available = i64_at(v, "/status/numberAvailable").unwrap_or(0);
    if updated < desired {
        return Ok(HealthState::with_message(H::Progressing, format!("Waiting for daemon set rollout to finish: {} out of {} new pods have been updated...", updated, desired)));
    }
    if available < desired {
        return Ok(HealthState::with_message(H::Progressing, format!("Waiting for daemon set rollout to finish: {} of {} updated pods are available...", available, desired)));
    }
    Ok(HealthState::new(H::Healthy))
}

pub fn replica_set(v: &Json) -> Result<HealthState> {
    if condition_is(v, "ReplicaFailure", "True") {
        return Ok(HealthState::with_message(H::Degraded, condition_message(v, "ReplicaFailure")));
    }
    if generation_pending(v) {
        return Ok(HealthState::with_message(H::Progressing, "Waiting for rollout to finish: observed replica set generation less than desired generation"));
    }
    let want = i64_at(v, "/spec/replicas").unwrap_or(1);
    let available = i64_at(v, "/status/availableReplicas").unwrap_or(0);
    if available < want {
        return Ok(HealthState::with_message(H::Progressing, format!("Waiting for rollout to finish: {} out of {} new replicas are available...", available, want)));
    }
    Ok(HealthState::new(H::Healthy))
}

pub fn pod(v: &Json) -> Result<HealthState> {
    let waiting_reason = v
        .pointer("/status/containerStatuses")
        .and_then(|c| c.as_array())
        .into_iter()
        .flatten()
        .filter_map(|c| c.pointer("/state/waiting/reason").and_then(|r| r.as_str()))
        .find(|r| matches!(*r, "CrashLoopBackOff" | "ErrImagePull" | "ImagePullBackOff" | "CreateContainerConfigError" | "InvalidImageName"));
    if let Some(reason) = waiting_reason {
        return Ok(HealthState::with_message(H::Degraded, reason));
    }
    let message = str_at(v, "/status/message").unwrap_or("").to_string();
    match str_at(v, "/status/phase").unwrap_or("Pending") {
        "Succeeded" => Ok(HealthState::with_message(H::Healthy, message)),
        "Failed" => Ok(HealthState::with_message(H::Degraded, message)),
        "Running" => {
            let always = str_at(v, "/spec/restartPolicy").map_or(true, |p| p == "Always");
            if always && condition_is(v, "Ready", "True") {
                Ok(HealthState::new(H::Healthy))
            } else {
                Ok(HealthState::with_message(H::Progressing, message))
            }
        }
        "Pending" => Ok(HealthState::with_message(H::Progressing, message)),
        other => Ok(HealthState::with_message(H::Unknown, format!("unknown pod phase {}", other))),
    }
}

pub fn job(v: &Json) -> Result<HealthState> {
    if condition_is(v, "Failed", "True") {
        return Ok(HealthState::with_message(H::Degraded, condition_message(v, "Failed")));
    }
    if condition_is(v, "Complete", "True") {
        return Ok(HealthState::with_message(H::Healthy, condition_message(v, "Complete")));
    }
    if v.pointer("/spec/suspend").and_then(|s| s.as_bool()) == Some(true) {
        return Ok(HealthState::with_message(H::Suspended, "Job is suspended"));
    }
    let completions = i64_at(v, "/spec/completions").unwrap_or(1);
    if i64_at(v, "/status/succeeded").unwrap_or(0) >= completions {
        return Ok(HealthState::new(H::Healthy));
    }
    Ok(HealthState::with_message(H::Progressing, "job is running"))
}

pub fn service(v: &Json) -> Result<HealthState> {
    if str_at(v, "/spec/type") == Some("LoadBalancer") {
        let has_ingress = v.pointer("/status/loadBalancer/ingress").and_then(|i| i.as_array()).map_or(false, |a| !a.is_empty());
        if !has_ingress {
            return Ok(HealthState::with_message(H::Progressing, "waiting for load balancer address"));
        }
    }
    Ok(HealthState::new(H::Healthy))
}

pub fn persistent_volume_claim(v: &Json) -> Result<HealthState> {
    match str_at(v, "/status/phase") {
        Some("Bound") => Ok(HealthState::new(H::Healthy)),
        Some("Lost") => Ok(HealthState::with_message(H::Degraded, "claim lost its underlying volume")),
        Some("Pending") | None => Ok(HealthState::with_message(H::Progressing, "waiting for volume binding")),
        Some(other) => Ok(HealthState::with_message(H::Unknown, format!("unknown claim phase {}", other))),
    }
}

pub fn ingress(v: &Json) -> Result<HealthState> {
    let has_ingress = v.pointer("/status/loadBalancer/ingress").and_then(|i| i.as_array()).map_or(false, |a| !a.is_empty());
    if has_ingress {
        Ok(HealthState::new(H::Healthy))
    } else {
        Ok(HealthState::with_message(H::Progressing, "waiting for ingress address"))
    }
}

pub fn custom_resource_definition(v: &Json) -> Result<HealthState> {
    if condition_is(v, "NamesAccepted", "False") {
        return Ok(HealthState::with_message(H::Degraded, condition_message(v, "NamesAccepted")));
    }
    if condition_is(v, "Established", "True") {
        return Ok(HealthState::new(H::Healthy));
    }
    Ok(HealthState::with_message(H::Progressing, "waiting for definition to be established"))
}

pub fn namespace(v: &Json) -> Result<HealthState> {
    match str_at(v, "/status/phase") {
        Some("Terminating") => Ok(HealthState::with_message(H::Progressing, "namespace is terminating")),
        _ => Ok(HealthState::new(H::Healthy)),
    }
}
