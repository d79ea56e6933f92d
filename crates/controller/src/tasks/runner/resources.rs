//! Desired sub-resources of a `GithubActionRunnerPool`

use super::script::{render_entrypoint, BUILDS_DIR};
use crate::crds::GithubActionRunnerPool;
use crate::tasks::cluster::OwnerKey;
use crate::tasks::config::RunnerConfig;
use crate::tasks::labels::{owned_meta, selector_labels};
use crate::tasks::naming::ResourceNaming;
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{EnvVar, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::ResourceExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

pub const RUNNER_COMPONENT: &str = "runner";
pub const RUNNER_CONTAINER: &str = "runner";
pub const BUILD_AGENT_CONTAINER: &str = "build-agent";
const BUILDS_VOLUME: &str = "builds";

lazy_static! {
    static ref REPOSITORY_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").unwrap();
    static ref LABEL_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap();
    static ref URL_PATTERN: Regex =
        Regex::new(r"^https?://[A-Za-z0-9.-]+(:[0-9]+)?(/[A-Za-z0-9._~/-]*)?$").unwrap();
    static ref PATH_PATTERN: Regex = Regex::new(r"^/[A-Za-z0-9._/-]*$").unwrap();
    static ref ENV_NAME_PATTERN: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Names of the pool's sub-resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerNames {
    /// Deployment, Role and RoleBinding
    pub workload: String,
    pub service_account: String,
}

impl RunnerNames {
    #[must_use]
    pub fn of(pool: &GithubActionRunnerPool) -> Self {
        let workload = ResourceNaming::runner(&pool.name_any());
        let service_account = pool
            .spec
            .service_account_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| workload.clone());
        Self {
            workload,
            service_account,
        }
    }

    /// Selector for the runner pods
    #[must_use]
    pub fn pod_selector(&self) -> String {
        selector_labels(&self.workload)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ValidationError(message.into())
}

/// Reject specs that cannot produce a working runner.
///
/// Values end up inside the startup script, so they are restricted to
/// characters that need no shell quoting.
pub fn validate(pool: &GithubActionRunnerPool) -> Result<()> {
    let spec = &pool.spec;
    if spec.github_username.is_empty() {
        return Err(invalid("githubUsername is required"));
    }
    if !LABEL_PATTERN.is_match(&spec.github_username) {
        return Err(invalid(format!(
            "githubUsername '{}' is not a valid runner label",
            spec.github_username
        )));
    }
    if !REPOSITORY_PATTERN.is_match(&spec.repository) {
        return Err(invalid(format!(
            "repository '{}' must have the form owner/repo",
            spec.repository
        )));
    }
    if spec.token_secret_ref.name.is_empty() || spec.token_secret_ref.key.is_empty() {
        return Err(invalid("tokenSecretRef.name and tokenSecretRef.key are required"));
    }
    if spec.replicas < 0 {
        return Err(invalid("replicas must not be negative"));
    }
    let bad_label = spec
        .labels
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && !LABEL_PATTERN.is_match(l));
    if let Some(bad) = bad_label {
        return Err(invalid(format!(
            "label '{bad}' may only contain letters, digits, '.', '_' and '-'"
        )));
    }
    if let Some(url) = spec.github_url.as_deref().filter(|u| !u.trim().is_empty()) {
        if !URL_PATTERN.is_match(url) {
            return Err(invalid(format!("githubUrl '{url}' is not an http(s) URL")));
        }
    }
    if !PATH_PATTERN.is_match(&spec.work_dir) {
        return Err(invalid(format!("workDir '{}' must be an absolute path", spec.work_dir)));
    }
    if let Some(sa) = spec.service_account_name.as_deref().filter(|n| !n.is_empty()) {
        if !ResourceNaming::is_dns_label(sa) {
            return Err(invalid(format!("serviceAccountName '{sa}' is not a valid name")));
        }
    }
    if let Some(var) = spec.env.iter().find(|v| !ENV_NAME_PATTERN.is_match(&v.name)) {
        return Err(invalid(format!("env name '{}' is not a valid variable name", var.name)));
    }
    Ok(())
}

pub fn service_account(owner: &OwnerKey, names: &RunnerNames) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(owner, &names.service_account, RUNNER_COMPONENT),
        ..Default::default()
    }
}

/// Namespace-scoped permissions the runner jobs need to drive environments
pub fn role(owner: &OwnerKey, names: &RunnerNames) -> Result<Role> {
    let all = ["get", "list", "watch", "create", "update", "patch", "delete"];
    let role = json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "Role",
        "metadata": owned_meta(owner, &names.workload, RUNNER_COMPONENT),
        "rules": [
            {
                "apiGroups": ["apps.example.com"],
                "resources": ["devstagingenvironments", "devstagingenvironments/status"],
                "verbs": all,
            },
            {
                "apiGroups": ["apps"],
                "resources": ["deployments"],
                "verbs": all,
            },
            {
                "apiGroups": [""],
                "resources": ["services", "secrets", "configmaps", "pods"],
                "verbs": all,
            },
            {
                "apiGroups": ["networking.k8s.io"],
                "resources": ["ingresses"],
                "verbs": all,
            },
            {
                "apiGroups": [""],
                "resources": ["pods/log"],
                "verbs": ["get", "list"],
            },
            {
                "apiGroups": [""],
                "resources": ["pods/exec", "pods/attach"],
                "verbs": ["create", "get"],
            },
        ]
    });
    Ok(serde_json::from_value(role)?)
}

pub fn role_binding(owner: &OwnerKey, names: &RunnerNames) -> Result<RoleBinding> {
    let binding = json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": owned_meta(owner, &names.workload, RUNNER_COMPONENT),
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "Role",
            "name": names.workload,
        },
        "subjects": [{
            "kind": "ServiceAccount",
            "name": names.service_account,
            "namespace": owner.namespace,
        }]
    });
    Ok(serde_json::from_value(binding)?)
}

fn runner_env(pool: &GithubActionRunnerPool) -> Result<Vec<EnvVar>> {
    let mut env: Vec<EnvVar> = vec![
        serde_json::from_value(json!({
            "name": "GITHUB_TOKEN",
            "valueFrom": { "secretKeyRef": {
                "name": pool.spec.token_secret_ref.name,
                "key": pool.spec.token_secret_ref.key,
            }}
        }))?,
        serde_json::from_value(json!({
            "name": "RUNNER_NAME",
            "valueFrom": { "fieldRef": { "fieldPath": "metadata.name" } }
        }))?,
        EnvVar {
            name: "BUILDS_DIR".to_string(),
            value: Some(BUILDS_DIR.to_string()),
            ..Default::default()
        },
    ];
    for var in &pool.spec.env {
        if env.iter().any(|e| e.name == var.name) {
            continue;
        }
        env.push(EnvVar {
            name: var.name.clone(),
            value: Some(var.value.clone()),
            ..Default::default()
        });
    }
    Ok(env)
}

/// Runner Deployment: the job runner plus the privileged build agent,
/// sharing the signal volume.
pub fn deployment(
    pool: &GithubActionRunnerPool,
    owner: &OwnerKey,
    names: &RunnerNames,
    config: &RunnerConfig,
) -> Result<Deployment> {
    let labels = selector_labels(&names.workload);
    let script = render_entrypoint(pool)?;
    let resources = pool
        .spec
        .resources
        .as_ref()
        .and_then(|r| r.to_requirements());

    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": owned_meta(owner, &names.workload, RUNNER_COMPONENT),
        "spec": {
            "replicas": pool.spec.replicas,
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "serviceAccountName": names.service_account,
                    "terminationGracePeriodSeconds": 60,
                    "containers": [
                        {
                            "name": RUNNER_CONTAINER,
                            "image": pool.spec.runner_image,
                            "command": ["/bin/bash", "-c"],
                            "args": [script],
                            "env": runner_env(pool)?,
                            "resources": resources,
                            "volumeMounts": [{ "name": BUILDS_VOLUME, "mountPath": BUILDS_DIR }],
                        },
                        {
                            "name": BUILD_AGENT_CONTAINER,
                            "image": config.build_agent_image,
                            "args": [
                                "watch",
                                "--dir", BUILDS_DIR,
                                "--builder-image", config.builder_image,
                            ],
                            "env": [{
                                "name": "POD_NAMESPACE",
                                "valueFrom": { "fieldRef": { "fieldPath": "metadata.namespace" } }
                            }],
                            "securityContext": { "privileged": true },
                            "volumeMounts": [{ "name": BUILDS_VOLUME, "mountPath": BUILDS_DIR }],
                        }
                    ],
                    "volumes": [{ "name": BUILDS_VOLUME, "emptyDir": {} }],
                }
            }
        }
    });
    Ok(serde_json::from_value(deployment)?)
}
