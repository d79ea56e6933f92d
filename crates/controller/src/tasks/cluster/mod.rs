//! Cluster access seam used by the reconcilers.
//!
//! Reconcile logic never talks to `kube::Api` directly; it reads and writes
//! through [`Cluster`] so the same code runs against the live API server
//! ([`api::KubeCluster`]) and the in-memory store used by the tests.

use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use std::fmt;

pub mod api;
#[cfg(test)]
pub mod memory;

/// Descriptor kinds the engine reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnerKind {
    Environment,
    RunnerPool,
}

impl OwnerKind {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Environment => "DevStagingEnvironment",
            Self::RunnerPool => "GithubActionRunnerPool",
        }
    }

    #[must_use]
    pub fn api_version(&self) -> &'static str {
        "apps.example.com/v1alpha1"
    }
}

/// Identity of a descriptor object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl OwnerKey {
    /// Build the key from a live object; fails for objects without name or uid
    pub fn of<K: Resource>(obj: &K, kind: OwnerKind) -> Result<Self> {
        let meta = obj.meta();
        Ok(Self {
            kind,
            namespace: meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: meta.name.clone().ok_or(Error::MissingObjectKey)?,
            uid: meta.uid.clone().ok_or(Error::MissingObjectKey)?,
        })
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.kind(), self.namespace, self.name)
    }
}

/// Kinds of sub-resources owned by a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnedKind {
    Deployment,
    Service,
    Ingress,
    Secret,
    ServiceAccount,
    Role,
    RoleBinding,
}

impl OwnedKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::Ingress => "Ingress",
            Self::Secret => "Secret",
            Self::ServiceAccount => "ServiceAccount",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
        }
    }
}

impl fmt::Display for OwnedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed sub-resource
#[derive(Debug, Clone)]
pub enum OwnedObject {
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
    Secret(Secret),
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
}

impl OwnedObject {
    #[must_use]
    pub fn kind(&self) -> OwnedKind {
        match self {
            Self::Deployment(_) => OwnedKind::Deployment,
            Self::Service(_) => OwnedKind::Service,
            Self::Ingress(_) => OwnedKind::Ingress,
            Self::Secret(_) => OwnedKind::Secret,
            Self::ServiceAccount(_) => OwnedKind::ServiceAccount,
            Self::Role(_) => OwnedKind::Role,
            Self::RoleBinding(_) => OwnedKind::RoleBinding,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(o) => o.meta(),
            Self::Service(o) => o.meta(),
            Self::Ingress(o) => o.meta(),
            Self::Secret(o) => o.meta(),
            Self::ServiceAccount(o) => o.meta(),
            Self::Role(o) => o.meta(),
            Self::RoleBinding(o) => o.meta(),
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(o) => o.meta_mut(),
            Self::Service(o) => o.meta_mut(),
            Self::Ingress(o) => o.meta_mut(),
            Self::Secret(o) => o.meta_mut(),
            Self::ServiceAccount(o) => o.meta_mut(),
            Self::Role(o) => o.meta_mut(),
            Self::RoleBinding(o) => o.meta_mut(),
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Deployment(o) => o.name_any(),
            Self::Service(o) => o.name_any(),
            Self::Ingress(o) => o.name_any(),
            Self::Secret(o) => o.name_any(),
            Self::ServiceAccount(o) => o.name_any(),
            Self::Role(o) => o.name_any(),
            Self::RoleBinding(o) => o.name_any(),
        }
    }

    /// Serialized form (includes `apiVersion` and `kind`)
    pub fn to_json(&self) -> Result<Value> {
        Ok(match self {
            Self::Deployment(o) => serde_json::to_value(o)?,
            Self::Service(o) => serde_json::to_value(o)?,
            Self::Ingress(o) => serde_json::to_value(o)?,
            Self::Secret(o) => serde_json::to_value(o)?,
            Self::ServiceAccount(o) => serde_json::to_value(o)?,
            Self::Role(o) => serde_json::to_value(o)?,
            Self::RoleBinding(o) => serde_json::to_value(o)?,
        })
    }

    pub fn from_json(kind: OwnedKind, value: Value) -> Result<Self> {
        Ok(match kind {
            OwnedKind::Deployment => Self::Deployment(serde_json::from_value(value)?),
            OwnedKind::Service => Self::Service(serde_json::from_value(value)?),
            OwnedKind::Ingress => Self::Ingress(serde_json::from_value(value)?),
            OwnedKind::Secret => Self::Secret(serde_json::from_value(value)?),
            OwnedKind::ServiceAccount => Self::ServiceAccount(serde_json::from_value(value)?),
            OwnedKind::Role => Self::Role(serde_json::from_value(value)?),
            OwnedKind::RoleBinding => Self::RoleBinding(serde_json::from_value(value)?),
        })
    }

    #[must_use]
    pub fn as_deployment(&self) -> Option<&Deployment> {
        match self {
            Self::Deployment(d) => Some(d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_secret(&self) -> Option<&Secret> {
        match self {
            Self::Secret(s) => Some(s),
            _ => None,
        }
    }
}

/// JSON patch adding `finalizer`, valid only while the list still equals `current`
#[must_use]
pub fn add_finalizer_patch(current: &[String], finalizer: &str) -> Value {
    if current.is_empty() {
        json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": [finalizer] },
        ])
    } else {
        json!([
            { "op": "test", "path": "/metadata/finalizers", "value": current },
            { "op": "add", "path": "/metadata/finalizers/-", "value": finalizer },
        ])
    }
}

/// JSON patch removing `finalizer` from where it sits in `current`.
/// `None` when it is not there.
#[must_use]
pub fn remove_finalizer_patch(current: &[String], finalizer: &str) -> Option<Value> {
    let index = current.iter().position(|f| f == finalizer)?;
    let path = format!("/metadata/finalizers/{index}");
    Some(json!([
        { "op": "test", "path": path, "value": finalizer },
        { "op": "remove", "path": path },
    ]))
}

/// Read/write access to the cluster as the reconcilers need it
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Fetch an owned object, `None` when it does not exist
    async fn get(&self, namespace: &str, kind: OwnedKind, name: &str)
        -> Result<Option<OwnedObject>>;

    /// Server-side apply of the full desired object
    async fn apply(&self, namespace: &str, object: &OwnedObject) -> Result<()>;

    /// Delete an object; returns whether anything was removed
    async fn delete(&self, namespace: &str, kind: OwnedKind, name: &str) -> Result<bool>;

    /// Metadata of objects of `kind` matching a label selector
    async fn list_metadata(
        &self,
        namespace: &str,
        kind: OwnedKind,
        label_selector: &str,
    ) -> Result<Vec<ObjectMeta>>;

    /// True when the owner is gone or carries a deletion timestamp
    async fn owner_deleting(&self, owner: &OwnerKey) -> Result<bool>;

    /// Merge-patch the owner's status subresource
    async fn patch_status(&self, owner: &OwnerKey, status: Value) -> Result<()>;

    /// Apply a JSON patch to the owner's finalizers. A failed `test`
    /// operation surfaces as [`Error::Conflict`].
    async fn patch_finalizers(&self, owner: &OwnerKey, patch: Value) -> Result<()>;

    /// Run a command in `container` of every running pod matching the selector.
    /// Returns the number of pods where the command exited successfully.
    async fn exec_in_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<usize>;
}
