//! Types shared by both custom resources

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Plain name/value environment variable
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct EnvVarSpec {
    /// Name of the environment variable
    pub name: String,
    /// Literal value
    #[serde(default)]
    pub value: String,
}

/// Compute requests and limits for a container
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

impl ResourceSpec {
    /// Convert into the container-level requirements, `None` when nothing is set
    #[must_use]
    pub fn to_requirements(&self) -> Option<ResourceRequirements> {
        let mut requests = BTreeMap::new();
        let mut limits = BTreeMap::new();

        if let Some(cpu) = &self.cpu_request {
            requests.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &self.memory_request {
            requests.insert("memory".to_string(), Quantity(memory.clone()));
        }
        if let Some(cpu) = &self.cpu_limit {
            limits.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &self.memory_limit {
            limits.insert("memory".to_string(), Quantity(memory.clone()));
        }

        if requests.is_empty() && limits.is_empty() {
            return None;
        }

        Some(ResourceRequirements {
            requests: (!requests.is_empty()).then_some(requests),
            limits: (!limits.is_empty()).then_some(limits),
            ..Default::default()
        })
    }
}

/// Condition reported on a descriptor's status
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: String,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Reason for the condition's last transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusCondition {
    #[must_use]
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: None,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Merge `desired` conditions into the previously reported set.
///
/// A condition keeps its `lastTransitionTime` while its status is unchanged, so
/// re-reporting the same state produces an identical status document.
#[must_use]
pub fn merge_conditions(
    previous: &[StatusCondition],
    desired: Vec<StatusCondition>,
    now: &str,
) -> Vec<StatusCondition> {
    desired
        .into_iter()
        .map(|mut condition| {
            let prior = previous
                .iter()
                .find(|c| c.condition_type == condition.condition_type);
            condition.last_transition_time = match prior {
                Some(p) if p.status == condition.status => p.last_transition_time.clone(),
                _ => Some(now.to_string()),
            };
            condition
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_spec_without_values_yields_none() {
        assert!(ResourceSpec::default().to_requirements().is_none());
    }

    #[test]
    fn resource_spec_splits_requests_and_limits() {
        let spec = ResourceSpec {
            cpu_request: Some("100m".to_string()),
            memory_limit: Some("256Mi".to_string()),
            ..Default::default()
        };
        let req = spec.to_requirements().unwrap();
        assert_eq!(
            req.requests.unwrap().get("cpu"),
            Some(&Quantity("100m".to_string()))
        );
        assert_eq!(
            req.limits.unwrap().get("memory"),
            Some(&Quantity("256Mi".to_string()))
        );
    }

    #[test]
    fn merge_preserves_transition_time_for_unchanged_status() {
        let mut ready = StatusCondition::new("Ready", true, "Available", "ok");
        ready.last_transition_time = Some("2025-01-01T00:00:00Z".to_string());

        let merged = merge_conditions(
            &[ready],
            vec![
                StatusCondition::new("Ready", true, "Available", "ok"),
                StatusCondition::new("Invalid", false, "Valid", "spec accepted"),
            ],
            "2025-06-01T00:00:00Z",
        );

        assert_eq!(
            merged[0].last_transition_time.as_deref(),
            Some("2025-01-01T00:00:00Z")
        );
        assert_eq!(
            merged[1].last_transition_time.as_deref(),
            Some("2025-06-01T00:00:00Z")
        );
    }

    #[test]
    fn merge_bumps_transition_time_on_flip() {
        let mut ready = StatusCondition::new("Ready", false, "Progressing", "waiting");
        ready.last_transition_time = Some("2025-01-01T00:00:00Z".to_string());

        let merged = merge_conditions(
            &[ready],
            vec![StatusCondition::new("Ready", true, "Available", "ok")],
            "2025-06-01T00:00:00Z",
        );
        assert_eq!(
            merged[0].last_transition_time.as_deref(),
            Some("2025-06-01T00:00:00Z")
        );
    }
}
