//! Aggregate status of a `DevStagingEnvironment`

use super::resources::SkippedDependency;
use crate::crds::{merge_conditions, DependencyStatus, DevStagingEnvironmentStatus, StatusCondition};
use k8s_openapi::api::apps::v1::Deployment;

pub const PHASE_PENDING: &str = "Pending";
pub const PHASE_PROVISIONING: &str = "Provisioning";
pub const PHASE_READY: &str = "Ready";
pub const PHASE_INVALID: &str = "Invalid";
pub const PHASE_TERMINATING: &str = "Terminating";

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_INVALID: &str = "Invalid";
pub const CONDITION_DEPENDENCIES_READY: &str = "DependenciesReady";
pub const CONDITION_DEPENDENCY_INVALID: &str = "DependencyInvalid";

/// Ready/available replica counts of an observed Deployment
#[must_use]
pub fn replica_counts(deployment: Option<&Deployment>) -> (i32, i32) {
    deployment
        .and_then(|d| d.status.as_ref())
        .map_or((0, 0), |s| {
            (s.ready_replicas.unwrap_or(0), s.available_replicas.unwrap_or(0))
        })
}

/// A Deployment is ready once every desired replica is available
#[must_use]
pub fn deployment_ready(deployment: Option<&Deployment>, desired: i32) -> bool {
    match deployment {
        None => false,
        Some(_) => replica_counts(deployment).1 >= desired,
    }
}

/// Observations gathered during one reconcile pass
#[derive(Debug, Default)]
pub struct Observed {
    pub generation: Option<i64>,
    /// The app Deployment existed before this pass
    pub app_existed: bool,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub app_ready: bool,
    pub dependencies: Vec<DependencyStatus>,
    pub skipped: Vec<SkippedDependency>,
    pub ingress_host: Option<String>,
    pub url: Option<String>,
}

/// Status after a successful apply
#[must_use]
pub fn converged(
    previous: Option<&DevStagingEnvironmentStatus>,
    observed: Observed,
    now: &str,
) -> DevStagingEnvironmentStatus {
    let deps_ready = observed.dependencies.iter().all(|d| d.ready);
    let ready = observed.app_ready && deps_ready;

    let phase = if ready {
        PHASE_READY
    } else if observed.app_existed {
        PHASE_PROVISIONING
    } else {
        PHASE_PENDING
    };

    let pending: Vec<&str> = observed
        .dependencies
        .iter()
        .filter(|d| !d.ready)
        .map(|d| d.name.as_str())
        .collect();

    let mut conditions = vec![
        if ready {
            StatusCondition::new(
                CONDITION_READY,
                true,
                "Available",
                "application and dependencies are available",
            )
        } else {
            StatusCondition::new(
                CONDITION_READY,
                false,
                "Progressing",
                format!(
                    "{}/{} replicas available",
                    observed.available_replicas, observed.desired_replicas
                ),
            )
        },
        StatusCondition::new(CONDITION_INVALID, false, "Valid", "spec accepted"),
        if deps_ready {
            StatusCondition::new(
                CONDITION_DEPENDENCIES_READY,
                true,
                "Available",
                "all dependencies are available",
            )
        } else {
            StatusCondition::new(
                CONDITION_DEPENDENCIES_READY,
                false,
                "Progressing",
                format!("waiting for: {}", pending.join(", ")),
            )
        },
    ];

    conditions.push(if observed.skipped.is_empty() {
        StatusCondition::new(
            CONDITION_DEPENDENCY_INVALID,
            false,
            "Valid",
            "all dependency types are supported",
        )
    } else {
        let message = observed
            .skipped
            .iter()
            .map(|s| s.reason.clone())
            .collect::<Vec<_>>()
            .join("; ");
        StatusCondition::new(CONDITION_DEPENDENCY_INVALID, true, "UnsupportedType", message)
    });

    let previous_conditions = previous.map(|p| p.conditions.as_slice()).unwrap_or_default();

    DevStagingEnvironmentStatus {
        phase: phase.to_string(),
        observed_generation: observed.generation,
        ready_replicas: observed.ready_replicas,
        available_replicas: observed.available_replicas,
        dependencies: observed.dependencies,
        ingress_host: observed.ingress_host,
        url: observed.url,
        conditions: merge_conditions(previous_conditions, conditions, now),
    }
}

/// Status after spec validation failed; previous observations are kept
#[must_use]
pub fn invalid(
    previous: Option<&DevStagingEnvironmentStatus>,
    generation: Option<i64>,
    message: &str,
    now: &str,
) -> DevStagingEnvironmentStatus {
    let base = previous.cloned().unwrap_or_default();
    let conditions = vec![
        StatusCondition::new(CONDITION_READY, false, "InvalidSpec", message),
        StatusCondition::new(CONDITION_INVALID, true, "InvalidSpec", message),
    ];
    DevStagingEnvironmentStatus {
        phase: PHASE_INVALID.to_string(),
        observed_generation: generation,
        conditions: merge_conditions(&base.conditions, conditions, now),
        ..base
    }
}

/// Status while the finalizer runs
#[must_use]
pub fn terminating(
    previous: Option<&DevStagingEnvironmentStatus>,
    now: &str,
) -> DevStagingEnvironmentStatus {
    let base = previous.cloned().unwrap_or_default();
    let conditions = vec![StatusCondition::new(
        CONDITION_READY,
        false,
        "Terminating",
        "environment is being deleted",
    )];
    DevStagingEnvironmentStatus {
        phase: PHASE_TERMINATING.to_string(),
        conditions: merge_conditions(&base.conditions, conditions, now),
        ..base
    }
}
