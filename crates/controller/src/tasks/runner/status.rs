//! Aggregate status of a `GithubActionRunnerPool`

use crate::crds::{
    merge_conditions, GithubActionRunnerPoolStatus, RegistrationState, StatusCondition,
};

pub const PHASE_PROVISIONING: &str = "Provisioning";
pub const PHASE_READY: &str = "Ready";
pub const PHASE_INVALID: &str = "Invalid";
pub const PHASE_TERMINATING: &str = "Terminating";

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_REGISTERED: &str = "Registered";
pub const CONDITION_INVALID: &str = "Invalid";

/// What one reconcile pass saw
#[derive(Debug, Default)]
pub struct Observed {
    pub generation: Option<i64>,
    pub registration: RegistrationState,
    pub desired_runners: i32,
    pub ready_runners: i32,
    pub runner_labels: Vec<String>,
    pub deployment_name: String,
    pub service_account_name: String,
}

fn registered_condition(state: RegistrationState) -> StatusCondition {
    match state {
        RegistrationState::Registered => {
            StatusCondition::new(
                CONDITION_REGISTERED,
                true,
                "TokenExchanged",
                "registration token exchanged",
            )
        }
        RegistrationState::Unregistered => {
            StatusCondition::new(
                CONDITION_REGISTERED,
                false,
                "Pending",
                "registration token not yet exchanged",
            )
        }
        RegistrationState::Deregistering => {
            StatusCondition::new(
                CONDITION_REGISTERED,
                false,
                "Deregistering",
                "runners are being removed",
            )
        }
    }
}

#[must_use]
pub fn converged(
    previous: Option<&GithubActionRunnerPoolStatus>,
    observed: Observed,
    now: &str,
) -> GithubActionRunnerPoolStatus {
    let ready = observed.registration == RegistrationState::Registered
        && observed.ready_runners >= observed.desired_runners;

    let conditions = vec![
        registered_condition(observed.registration),
        if ready {
            StatusCondition::new(
                CONDITION_READY,
                true,
                "RunnersAvailable",
                "all runners are available",
            )
        } else {
            StatusCondition::new(
                CONDITION_READY,
                false,
                "Progressing",
                format!("{}/{} runners ready", observed.ready_runners, observed.desired_runners),
            )
        },
        StatusCondition::new(CONDITION_INVALID, false, "Valid", "spec accepted"),
    ];
    let previous_conditions = previous.map(|p| p.conditions.as_slice()).unwrap_or_default();

    GithubActionRunnerPoolStatus {
        phase: if ready { PHASE_READY } else { PHASE_PROVISIONING }.to_string(),
        registration: observed.registration,
        observed_generation: observed.generation,
        ready_runners: observed.ready_runners,
        runner_labels: observed.runner_labels,
        deployment_name: Some(observed.deployment_name),
        service_account_name: Some(observed.service_account_name),
        deregistration_started_at: None,
        conditions: merge_conditions(previous_conditions, conditions, now),
    }
}

/// Registration exchange failed; everything else is kept as it was
#[must_use]
pub fn registration_failed(
    previous: Option<&GithubActionRunnerPoolStatus>,
    message: &str,
    now: &str,
) -> GithubActionRunnerPoolStatus {
    let base = previous.cloned().unwrap_or_default();
    let conditions = vec![StatusCondition::new(
        CONDITION_REGISTERED,
        false,
        "ExchangeFailed",
        message,
    )];
    GithubActionRunnerPoolStatus {
        phase: PHASE_PROVISIONING.to_string(),
        conditions: merge_conditions(&base.conditions, conditions, now),
        ..base
    }
}

#[must_use]
pub fn invalid(
    previous: Option<&GithubActionRunnerPoolStatus>,
    generation: Option<i64>,
    message: &str,
    now: &str,
) -> GithubActionRunnerPoolStatus {
    let base = previous.cloned().unwrap_or_default();
    let conditions = vec![
        StatusCondition::new(CONDITION_READY, false, "InvalidSpec", message),
        StatusCondition::new(CONDITION_INVALID, true, "InvalidSpec", message),
    ];
    GithubActionRunnerPoolStatus {
        phase: PHASE_INVALID.to_string(),
        observed_generation: generation,
        conditions: merge_conditions(&base.conditions, conditions, now),
        ..base
    }
}

/// Deregistration has begun at `started_at`
#[must_use]
pub fn deregistering(
    previous: Option<&GithubActionRunnerPoolStatus>,
    started_at: &str,
    now: &str,
) -> GithubActionRunnerPoolStatus {
    let base = previous.cloned().unwrap_or_default();
    let conditions = vec![
        registered_condition(RegistrationState::Deregistering),
        StatusCondition::new(CONDITION_READY, false, "Terminating", "runner pool is being deleted"),
    ];
    GithubActionRunnerPoolStatus {
        phase: PHASE_TERMINATING.to_string(),
        registration: RegistrationState::Deregistering,
        deregistration_started_at: Some(started_at.to_string()),
        conditions: merge_conditions(&base.conditions, conditions, now),
        ..base
    }
}
