//! Sift reconcile: derive a workspace lifecycle state from the latest
//! deployment status snapshot.
//!
//! The classifier is a pure function over the newest signals: a typed k8s
//! `Deployment` descriptor, an explicit termination progress marker, and
//! explicit error details. It is recomputed from scratch on every
//! reconciliation tick; no previous value feeds into the next one, and an
//! unrecognized or partial descriptor degrades to `Unknown` instead of
//! failing the loop.

#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition};
use serde::{Deserialize, Serialize};

/// Observed lifecycle state of a managed workspace.
///
/// `CreationRequested` is the desired-side initial state; it belongs to the
/// lifecycle but is never derived from a deployment snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActualState {
    CreationRequested,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Error,
    Terminating,
    Terminated,
    Unknown,
}

impl ActualState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActualState::CreationRequested => "CREATION_REQUESTED",
            ActualState::Starting => "STARTING",
            ActualState::Running => "RUNNING",
            ActualState::Stopping => "STOPPING",
            ActualState::Stopped => "STOPPED",
            ActualState::Failed => "FAILED",
            ActualState::Error => "ERROR",
            ActualState::Terminating => "TERMINATING",
            ActualState::Terminated => "TERMINATED",
            ActualState::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ActualState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit termination signal reported alongside (not inside) the
/// deployment descriptor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationProgress {
    Terminating,
    Terminated,
}

/// Details of the most recent failure observed for the workspace. Presence
/// alone drives classification; the fields are carried for operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetails {
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

mod reason {
    pub const NEW_REPLICA_SET_AVAILABLE: &str = "NewReplicaSetAvailable";
    pub const NEW_REPLICA_SET_CREATED: &str = "NewReplicaSetCreated";
    pub const FOUND_NEW_REPLICA_SET: &str = "FoundNewReplicaSet";
    pub const REPLICA_SET_UPDATED: &str = "ReplicaSetUpdated";
    pub const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";
    pub const MINIMUM_REPLICAS_AVAILABLE: &str = "MinimumReplicasAvailable";
}

const CONDITION_AVAILABLE: &str = "Available";
const CONDITION_PROGRESSING: &str = "Progressing";

/// Classify the workspace's actual state from the latest signals.
///
/// Precedence, first match wins:
/// 1. error details present: terminated workspaces stay `Terminated`,
///    anything else (including in-flight termination) is `Error`;
/// 2. explicit termination progress;
/// 3. the deployment descriptor's replica count and conditions;
/// 4. `Unknown` when nothing above applies.
pub fn calculate_actual_state(
    deployment: Option<&Deployment>,
    termination_progress: Option<TerminationProgress>,
    error_details: Option<&ErrorDetails>,
) -> ActualState {
    if error_details.is_some() {
        return match termination_progress {
            Some(TerminationProgress::Terminated) => ActualState::Terminated,
            _ => ActualState::Error,
        };
    }
    match termination_progress {
        Some(TerminationProgress::Terminating) => return ActualState::Terminating,
        Some(TerminationProgress::Terminated) => return ActualState::Terminated,
        None => {}
    }
    match deployment {
        Some(d) => classify_deployment(d),
        None => ActualState::Unknown,
    }
}

/// Tolerant parse step for raw agent payloads. Any malformation (wrong
/// shapes, non-numeric replica counts, truncated conditions) yields `None`,
/// which the caller classifies as `Unknown`.
pub fn deployment_from_json(value: &serde_json::Value) -> Option<Deployment> {
    serde_json::from_value(value.clone()).ok()
}

fn classify_deployment(deployment: &Deployment) -> ActualState {
    use reason::*;

    let Some(replicas) = deployment.spec.as_ref().and_then(|s| s.replicas) else {
        return ActualState::Unknown;
    };
    let conditions: &[DeploymentCondition] = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or(&[]);
    let progressing = condition_reason(conditions, CONDITION_PROGRESSING);
    let available = condition_reason(conditions, CONDITION_AVAILABLE);

    match replicas {
        1 => match progressing {
            Some(NEW_REPLICA_SET_AVAILABLE)
                if available == Some(MINIMUM_REPLICAS_AVAILABLE) =>
            {
                ActualState::Running
            }
            Some(NEW_REPLICA_SET_CREATED | FOUND_NEW_REPLICA_SET | REPLICA_SET_UPDATED) => {
                ActualState::Starting
            }
            Some(PROGRESS_DEADLINE_EXCEEDED) => ActualState::Failed,
            _ => ActualState::Unknown,
        },
        0 => match progressing {
            Some(NEW_REPLICA_SET_AVAILABLE) => ActualState::Stopped,
            Some(REPLICA_SET_UPDATED) => ActualState::Stopping,
            _ => ActualState::Unknown,
        },
        // Multi-replica (and nonsense negative) deployments are not modeled.
        _ => ActualState::Unknown,
    }
}

fn condition_reason<'a>(
    conditions: &'a [DeploymentCondition],
    type_: &str,
) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .and_then(|c| c.reason.as_deref())
}
