//! `DevStagingEnvironment` Custom Resource Definition for ephemeral application environments

use super::common::{EnvVarSpec, ResourceSpec, StatusCondition};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_replicas() -> i32 {
    1
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_initial_delay() -> i32 {
    5
}

fn default_period() -> i32 {
    10
}

fn default_ingress_path() -> String {
    "/".to_string()
}

fn default_path_type() -> String {
    "Prefix".to_string()
}

/// `DevStagingEnvironment` CRD: one application plus its backing services
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "apps.example.com", version = "v1alpha1", kind = "DevStagingEnvironment")]
#[kube(namespaced)]
#[kube(status = "DevStagingEnvironmentStatus")]
#[kube(shortname = "dse")]
#[kube(printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.deployment.image"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#)]
#[kube(printcolumn = r#"{"name":"Host","type":"string","jsonPath":".status.ingressHost"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct DevStagingEnvironmentSpec {
    /// Application workload
    pub deployment: AppDeploymentSpec,

    /// Service fronting the application
    #[serde(default)]
    pub service: AppServiceSpec,

    /// Optional external exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<AppIngressSpec>,

    /// Backing services, provisioned in declaration order
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentSpec {
    /// Container image for the application
    pub image: String,

    /// Container port the application listens on
    pub port: i32,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Explicit environment; wins over dependency-injected variables
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: i32,

    #[serde(default = "default_period")]
    pub period_seconds: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl ServiceType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterIP => "ClusterIP",
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppServiceSpec {
    /// Service port (defaults to the deployment port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Target container port (defaults to the deployment port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,

    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppIngressSpec {
    #[serde(default)]
    pub enabled: bool,

    /// Required when `enabled` is true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default = "default_ingress_path")]
    pub path: String,

    #[serde(default = "default_path_type")]
    pub path_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<IngressTlsSpec>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressTlsSpec {
    pub secret_name: String,

    /// Hosts covered by the certificate (defaults to the ingress host)
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// One backing service declaration
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    /// Dependency type (postgres, redis, mysql, mongodb, rabbitmq, minio)
    #[serde(rename = "type")]
    pub dependency_type: String,

    /// Name used for resources when several dependencies share a type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Image tag override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Full image override (wins over `version`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Extra environment for the dependency container
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,

    /// Overrides the primary injected variable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var_name: Option<String>,

    /// Size limit for the dependency's scratch volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
}

/// Status of the `DevStagingEnvironment`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevStagingEnvironmentStatus {
    /// Pending, Provisioning, Ready, Invalid or Terminating
    #[serde(default)]
    pub phase: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default)]
    pub available_replicas: i32,

    #[serde(default)]
    pub dependencies: Vec<DependencyStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default)]
    pub conditions: Vec<StatusCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub dependency_type: String,
    pub service_name: String,
    pub ready: bool,
    /// Variables injected into the application container
    #[serde(default)]
    pub env_vars: Vec<String>,
}

impl DevStagingEnvironment {
    /// Whether ingress is requested
    #[must_use]
    pub fn ingress_enabled(&self) -> bool {
        self.spec.ingress.as_ref().is_some_and(|i| i.enabled)
    }
}
