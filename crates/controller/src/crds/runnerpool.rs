//! `GithubActionRunnerPool` Custom Resource Definition for self-hosted CI runners

use super::common::{EnvVarSpec, ResourceSpec, StatusCondition};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label every runner carries in addition to the account identifier
pub const SELF_HOSTED_LABEL: &str = "self-hosted";

/// Default platform base URL
pub const DEFAULT_GITHUB_URL: &str = "https://github.com";

fn default_replicas() -> i32 {
    1
}

fn default_runner_image() -> String {
    "ghcr.io/actions/actions-runner:latest".to_string()
}

fn default_token_key() -> String {
    "github-token".to_string()
}

fn default_work_dir() -> String {
    "/home/runner/_work".to_string()
}

/// Reference to the secret holding the long-lived platform credential
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct TokenSecretRef {
    /// Name of the secret
    pub name: String,
    /// Key within the secret
    #[serde(default = "default_token_key")]
    pub key: String,
}

/// `GithubActionRunnerPool` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "apps.example.com", version = "v1alpha1", kind = "GithubActionRunnerPool")]
#[kube(namespaced)]
#[kube(status = "GithubActionRunnerPoolStatus")]
#[kube(shortname = "runnerpool")]
#[kube(printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.repository"}"#)]
#[kube(printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyRunners"}"#)]
#[kube(
    printcolumn = r#"{"name":"Registration","type":"string","jsonPath":".status.registration"}"#
)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct GithubActionRunnerPoolSpec {
    /// Account identifier, always added as a runner label
    #[serde(rename = "githubUsername")]
    pub github_username: String,

    /// Target repository in `owner/repo` form
    pub repository: String,

    #[serde(rename = "tokenSecretRef")]
    pub token_secret_ref: TokenSecretRef,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default = "default_runner_image", rename = "runnerImage")]
    pub runner_image: String,

    /// Extra runner labels
    #[serde(default)]
    pub labels: Vec<String>,

    /// Platform base URL override for self-hosted platform installs
    #[serde(default, rename = "githubUrl", skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    /// ServiceAccount for the runner pods (generated when empty)
    #[serde(default, rename = "serviceAccountName", skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default = "default_work_dir", rename = "workDir")]
    pub work_dir: String,

    /// Extra environment for the runner container
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,
}

/// Credential exchange lifecycle of a pool
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registered,
    Deregistering,
}

/// Status of the `GithubActionRunnerPool`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GithubActionRunnerPoolStatus {
    #[serde(default)]
    pub phase: String,

    #[serde(default)]
    pub registration: RegistrationState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub ready_runners: i32,

    #[serde(default)]
    pub runner_labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// When the finalizer started de-registration (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deregistration_started_at: Option<String>,

    #[serde(default)]
    pub conditions: Vec<StatusCondition>,
}

impl GithubActionRunnerPool {
    /// Full runner label set: fixed label, account identifier, then extras (deduplicated)
    #[must_use]
    pub fn runner_labels(&self) -> Vec<String> {
        let mut labels = vec![
            SELF_HOSTED_LABEL.to_string(),
            self.spec.github_username.clone(),
        ];
        for label in &self.spec.labels {
            let label = label.trim();
            if !label.is_empty() && !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
        labels
    }

    /// Platform base URL without a trailing slash
    #[must_use]
    pub fn github_url(&self) -> String {
        self.spec
            .github_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(DEFAULT_GITHUB_URL)
            .trim_end_matches('/')
            .to_string()
    }

    /// REST API root for the configured platform
    #[must_use]
    pub fn api_url(&self) -> String {
        api_url_for(&self.github_url())
    }

    #[must_use]
    pub fn registration_state(&self) -> RegistrationState {
        self.status
            .as_ref()
            .map(|s| s.registration)
            .unwrap_or_default()
    }
}

/// Map a platform base URL to its REST API root
#[must_use]
pub fn api_url_for(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base == DEFAULT_GITHUB_URL || base == "https://www.github.com" {
        "https://api.github.com".to_string()
    } else {
        format!("{base}/api/v3")
    }
}
