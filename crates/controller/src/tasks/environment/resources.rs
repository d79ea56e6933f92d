//! Desired-state calculator for `DevStagingEnvironment`.
//!
//! Everything here is pure: spec in, typed objects out. Cluster reads
//! (existing credentials) are passed in by the controller.

use crate::crds::{DependencySpec, DevStagingEnvironment, EnvVarSpec};
use crate::tasks::cluster::OwnerKey;
use crate::tasks::dependencies::{DependencyType, ResolvedDependency};
use crate::tasks::labels::{owned_meta, selector_labels, LABEL_DEPENDENCY_TYPE};
use crate::tasks::naming::ResourceNaming;
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction, PodSpec,
    PodTemplateSpec, Probe, Secret, Service, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

lazy_static! {
    /// Valid environment variable name
    static ref ENV_NAME_PATTERN: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

pub const APP_COMPONENT: &str = "app";
pub const DEPENDENCY_COMPONENT: &str = "dependency";
pub const APP_CONTAINER: &str = "app";

/// A dependency declaration that will be provisioned
#[derive(Debug, Clone)]
pub struct PlannedDependency {
    /// Declared name, or the type when unnamed
    pub name: String,
    pub resource_name: String,
    pub secret_name: String,
    pub resolved: ResolvedDependency,
    pub spec: DependencySpec,
}

/// A declaration left out because its type is not in the provisioning table
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedDependency {
    pub declared_type: String,
    pub name: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct EnvironmentPlan {
    pub app_name: String,
    pub dependencies: Vec<PlannedDependency>,
    pub skipped: Vec<SkippedDependency>,
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ValidationError(message.into())
}

fn check_port(what: &str, port: i32) -> Result<()> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(invalid(format!("{what} {port} is out of range (1-65535)")))
    }
}

fn check_env(what: &str, env: &[EnvVarSpec]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for var in env {
        if !ENV_NAME_PATTERN.is_match(&var.name) {
            return Err(invalid(format!(
                "{what}: invalid environment variable name '{}'",
                var.name
            )));
        }
        if !seen.insert(var.name.as_str()) {
            return Err(invalid(format!("{what}: duplicate environment variable '{}'", var.name)));
        }
    }
    Ok(())
}

/// Spec-level validation; any failure means nothing is applied
pub fn validate(env: &DevStagingEnvironment) -> Result<()> {
    let deployment = &env.spec.deployment;
    if deployment.image.trim().is_empty() {
        return Err(invalid("deployment.image is required"));
    }
    check_port("deployment.port", deployment.port)?;
    if deployment.replicas < 0 {
        return Err(invalid(format!(
            "deployment.replicas must not be negative (got {})",
            deployment.replicas
        )));
    }
    check_env("deployment.env", &deployment.env)?;
    if let Some(health) = &deployment.health_check {
        if !health.path.starts_with('/') {
            return Err(invalid("deployment.healthCheck.path must start with '/'"));
        }
    }

    if let Some(port) = env.spec.service.port {
        check_port("service.port", port)?;
    }
    if let Some(port) = env.spec.service.target_port {
        check_port("service.targetPort", port)?;
    }

    if let Some(ingress) = env.spec.ingress.as_ref().filter(|i| i.enabled) {
        if ingress.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
            return Err(invalid("ingress.host is required when ingress is enabled"));
        }
        if !ingress.path.starts_with('/') {
            return Err(invalid("ingress.path must start with '/'"));
        }
        if !matches!(ingress.path_type.as_str(), "Prefix" | "Exact" | "ImplementationSpecific") {
            return Err(invalid(format!(
                "ingress.pathType '{}' is not supported",
                ingress.path_type
            )));
        }
    }

    for dependency in &env.spec.dependencies {
        check_env("dependencies.env", &dependency.env)?;
        if let Some(name) = &dependency.env_var_name {
            if !ENV_NAME_PATTERN.is_match(name) {
                return Err(invalid(format!(
                    "dependencies.envVarName '{name}' is not a valid variable name"
                )));
            }
        }
        if let Some(name) = &dependency.name {
            if !ResourceNaming::is_dns_label(name) {
                return Err(invalid(format!(
                    "dependency name '{name}' must be a lowercase DNS label"
                )));
            }
        }
    }
    Ok(())
}

/// Validate and lay out the sub-resources of an environment
pub fn plan(env: &DevStagingEnvironment, owner: &OwnerKey) -> Result<EnvironmentPlan> {
    validate(env)?;

    let mut resolved = Vec::new();
    let mut skipped = Vec::new();
    for spec in &env.spec.dependencies {
        match ResolvedDependency::resolve(spec) {
            Ok(r) => resolved.push((spec, r)),
            // Unknown types only disable their own entry
            Err(Error::ValidationError(reason))
                if spec.dependency_type.parse::<DependencyType>().is_err() =>
            {
                skipped.push(SkippedDependency {
                    declared_type: spec.dependency_type.clone(),
                    name: spec.name.clone(),
                    reason,
                });
            }
            Err(e) => return Err(e),
        }
    }

    let mut per_type: BTreeMap<DependencyType, usize> = BTreeMap::new();
    for (_, r) in &resolved {
        *per_type.entry(r.dependency_type).or_default() += 1;
    }

    let mut dependencies = Vec::new();
    let mut used = BTreeSet::new();
    for (spec, r) in resolved {
        let shared_type = per_type.get(&r.dependency_type).copied().unwrap_or(0) > 1;
        let suffix = if shared_type {
            spec.name.clone().ok_or_else(|| {
                invalid(format!(
                    "several '{}' dependencies are declared; each needs a name",
                    r.dependency_type
                ))
            })?
        } else {
            r.dependency_type.as_str().to_string()
        };

        let resource_name = ResourceNaming::dependency(&owner.name, &suffix);
        if !used.insert(resource_name.clone()) {
            return Err(invalid(format!("duplicate dependency name '{suffix}'")));
        }
        dependencies.push(PlannedDependency {
            name: spec.name.clone().unwrap_or_else(|| r.dependency_type.as_str().to_string()),
            secret_name: ResourceNaming::dependency_secret(&owner.name, &suffix),
            resource_name,
            resolved: r,
            spec: spec.clone(),
        });
    }

    Ok(EnvironmentPlan {
        app_name: ResourceNaming::app(&owner.name),
        dependencies,
        skipped,
    })
}

/// Variable read from a Secret key, so values never appear in the pod spec
pub fn secret_env(name: &str, secret: &str, key: &str) -> Result<EnvVar> {
    Ok(serde_json::from_value(json!({
        "name": name,
        "valueFrom": { "secretKeyRef": { "name": secret, "key": key } }
    }))?)
}

fn literal_env(var: &EnvVarSpec) -> EnvVar {
    EnvVar {
        name: var.name.clone(),
        value: Some(var.value.clone()),
        ..Default::default()
    }
}

fn dependency_meta(owner: &OwnerKey, dependency: &PlannedDependency, name: &str) -> ObjectMeta {
    let mut meta = owned_meta(owner, name, DEPENDENCY_COMPONENT);
    if let Some(labels) = meta.labels.as_mut() {
        labels.insert(
            LABEL_DEPENDENCY_TYPE.to_string(),
            dependency.resolved.dependency_type.as_str().to_string(),
        );
    }
    meta
}

/// Credential Secret: credential fields plus every injected variable
#[must_use]
pub fn dependency_secret(
    owner: &OwnerKey,
    dependency: &PlannedDependency,
    credentials: &BTreeMap<String, String>,
    connection_env: &[(String, String)],
) -> Secret {
    let data = credentials
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .chain(connection_env.iter().cloned())
        .map(|(k, v)| (k, ByteString(v.into_bytes())))
        .collect();

    Secret {
        metadata: dependency_meta(owner, dependency, &dependency.secret_name),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Deployment of one dependency
pub fn dependency_deployment(
    owner: &OwnerKey,
    dependency: &PlannedDependency,
) -> Result<Deployment> {
    let profile = dependency.resolved.profile();
    let labels = selector_labels(&dependency.resource_name);

    let mut env = profile
        .credentials
        .iter()
        .map(|field| secret_env(field.key, &dependency.secret_name, field.key))
        .collect::<Result<Vec<_>>>()?;
    env.extend(
        dependency
            .spec
            .env
            .iter()
            .filter(|v| !profile.credentials.iter().any(|c| c.key == v.name))
            .map(literal_env),
    );

    let mut ports = vec![ContainerPort {
        name: Some("main".to_string()),
        container_port: dependency.resolved.port,
        ..Default::default()
    }];
    ports.extend(profile.extra_ports.iter().map(|p| ContainerPort {
        name: Some(p.name.to_string()),
        container_port: p.port,
        ..Default::default()
    }));

    let args: Vec<String> = profile.args.iter().map(ToString::to_string).collect();

    let container = Container {
        name: dependency.resolved.dependency_type.as_str().to_string(),
        image: Some(dependency.resolved.image.clone()),
        args: (!args.is_empty()).then_some(args),
        env: (!env.is_empty()).then_some(env),
        ports: Some(ports),
        resources: dependency.spec.resources.as_ref().and_then(|r| r.to_requirements()),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(dependency.resolved.port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "data".to_string(),
            mount_path: profile.data_path.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: dependency_meta(owner, dependency, &dependency.resource_name),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "data".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource {
                            size_limit: dependency.spec.storage_size.clone().map(Quantity),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// ClusterIP Service of one dependency
pub fn dependency_service(owner: &OwnerKey, dependency: &PlannedDependency) -> Result<Service> {
    let profile = dependency.resolved.profile();
    let mut ports = vec![json!({
        "name": "main",
        "port": dependency.resolved.port,
        "targetPort": dependency.resolved.port,
    })];
    ports.extend(profile.extra_ports.iter().map(|p| {
        json!({ "name": p.name, "port": p.port, "targetPort": p.port })
    }));

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": dependency_meta(owner, dependency, &dependency.resource_name),
        "spec": {
            "type": "ClusterIP",
            "ports": ports,
            "selector": selector_labels(&dependency.resource_name),
        }
    });
    Ok(serde_json::from_value(service)?)
}

/// Application environment: explicit `env` first, then injected variables.
///
/// An explicit entry hides an injected variable of the same name; between
/// dependencies the first declaration wins.
pub fn app_env(env: &DevStagingEnvironment, injected: &[(String, String)]) -> Result<Vec<EnvVar>> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut vars = Vec::new();
    for var in &env.spec.deployment.env {
        seen.insert(var.name.clone());
        vars.push(literal_env(var));
    }
    for (name, secret) in injected {
        if seen.insert(name.clone()) {
            vars.push(secret_env(name, secret, name)?);
        }
    }
    Ok(vars)
}

/// Application Deployment
pub fn app_deployment(
    env: &DevStagingEnvironment,
    owner: &OwnerKey,
    name: &str,
    injected: &[(String, String)],
) -> Result<Deployment> {
    let spec = &env.spec.deployment;
    let labels = selector_labels(name);

    let probe = spec.health_check.as_ref().map(|health| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(health.path.clone()),
            port: IntOrString::Int(spec.port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(health.initial_delay_seconds),
        period_seconds: Some(health.period_seconds),
        ..Default::default()
    });

    let vars = app_env(env, injected)?;
    let container = Container {
        name: APP_CONTAINER.to_string(),
        image: Some(spec.image.clone()),
        command: spec.command.clone(),
        args: spec.args.clone(),
        env: (!vars.is_empty()).then_some(vars),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: spec.port,
            ..Default::default()
        }]),
        resources: spec.resources.as_ref().and_then(|r| r.to_requirements()),
        liveness_probe: probe.clone(),
        readiness_probe: probe,
        ..Default::default()
    };

    Ok(Deployment {
        metadata: owned_meta(owner, name, APP_COMPONENT),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Application Service
pub fn app_service(env: &DevStagingEnvironment, owner: &OwnerKey, name: &str) -> Result<Service> {
    let port = env.spec.service.port.unwrap_or(env.spec.deployment.port);
    let target = env.spec.service.target_port.unwrap_or(env.spec.deployment.port);

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": owned_meta(owner, name, APP_COMPONENT),
        "spec": {
            "type": env.spec.service.service_type.as_str(),
            "ports": [{ "name": "http", "port": port, "targetPort": target }],
            "selector": selector_labels(name),
        }
    });
    Ok(serde_json::from_value(service)?)
}

/// Ingress with exactly one rule, `None` when ingress is disabled
pub fn app_ingress(
    env: &DevStagingEnvironment,
    owner: &OwnerKey,
    name: &str,
) -> Result<Option<Ingress>> {
    let Some(spec) = env.spec.ingress.as_ref().filter(|i| i.enabled) else {
        return Ok(None);
    };
    let Some(host) = spec.host.as_deref() else {
        return Err(invalid("ingress.host is required when ingress is enabled"));
    };
    let port = env.spec.service.port.unwrap_or(env.spec.deployment.port);

    let mut meta = owned_meta(owner, name, APP_COMPONENT);
    if !spec.annotations.is_empty() {
        meta.annotations = Some(spec.annotations.clone());
    }

    let mut ingress_spec = json!({
        "rules": [{
            "host": host,
            "http": {
                "paths": [{
                    "path": spec.path,
                    "pathType": spec.path_type,
                    "backend": { "service": { "name": name, "port": { "number": port } } }
                }]
            }
        }]
    });
    if let Some(class) = &spec.ingress_class_name {
        ingress_spec["ingressClassName"] = json!(class);
    }
    if let Some(tls) = &spec.tls {
        let hosts = if tls.hosts.is_empty() {
            vec![host.to_string()]
        } else {
            tls.hosts.clone()
        };
        ingress_spec["tls"] = json!([{ "hosts": hosts, "secretName": tls.secret_name }]);
    }

    let ingress = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": meta,
        "spec": ingress_spec,
    });
    Ok(Some(serde_json::from_value(ingress)?))
}

/// Public URL of the environment when ingress is enabled
#[must_use]
pub fn public_url(env: &DevStagingEnvironment) -> Option<String> {
    let spec = env.spec.ingress.as_ref().filter(|i| i.enabled)?;
    let host = spec.host.as_deref()?;
    let scheme = if spec.tls.is_some() { "https" } else { "http" };
    let path = if spec.path == "/" { "" } else { spec.path.as_str() };
    Some(format!("{scheme}://{host}{path}"))
}
