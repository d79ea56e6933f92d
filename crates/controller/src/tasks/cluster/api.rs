//! [`Cluster`] implementation backed by the Kubernetes API server

use super::{Cluster, OwnedKind, OwnedObject, OwnerKey, OwnerKind};
use crate::crds::{DevStagingEnvironment, GithubActionRunnerPool};
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Live cluster access; every call is bounded by `timeout`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
    timeout: Duration,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client, field_manager: &str, timeout: Duration) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
            timeout,
        }
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        within(self.timeout, operation, async { fut.await.map_err(Error::from) }).await
    }

    async fn get_typed<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get", api.get_opt(name)).await
    }

    async fn apply_typed<K>(&self, namespace: &str, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = object.name_any();
        let params = PatchParams::apply(&self.field_manager).force();
        self.bounded("apply", api.patch(&name, &params, &Patch::Apply(object)))
            .await?;
        Ok(())
    }

    async fn delete_typed<K>(&self, namespace: &str, name: &str) -> Result<bool>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match self
            .bounded("delete", api.delete(name, &DeleteParams::background()))
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::KubeError(kube::Error::Api(ae))) if ae.code == 404 => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_typed<K>(&self, namespace: &str, selector: &str) -> Result<Vec<ObjectMeta>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .bounded(
                "list",
                api.list_metadata(&ListParams::default().labels(selector)),
            )
            .await?;
        Ok(list.items.into_iter().map(|o| o.metadata).collect())
    }

    async fn owner_get<K>(&self, owner: &OwnerKey) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        self.get_typed::<K>(&owner.namespace, &owner.name).await
    }

    async fn owner_status_patch<K>(&self, owner: &OwnerKey, patch: Value) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &owner.namespace);
        self.bounded(
            "patch_status",
            api.patch_status(&owner.name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }

    async fn owner_json_patch<K>(&self, owner: &OwnerKey, patch: json_patch::Patch) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &owner.namespace);
        let patch = Patch::<()>::Json(patch);
        self.bounded(
            "patch finalizers",
            api.patch(&owner.name, &PatchParams::default(), &patch),
        )
        .await?;
        Ok(())
    }

    /// Run one command to completion; the whole session shares one deadline
    async fn exec_one(
        &self,
        pods: &Api<Pod>,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<bool> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(false)
            .stderr(true);

        within(self.timeout, "exec", async {
            let mut attached = pods.exec(pod, command, &params).await?;
            let status = attached.take_status();

            let mut stderr = String::new();
            if let Some(mut reader) = attached.stderr() {
                let _ = reader.read_to_string(&mut stderr).await;
            }
            attached
                .join()
                .await
                .map_err(|e| Error::Exec(format!("{pod}: {e}")))?;

            let succeeded = match status {
                Some(fut) => fut
                    .await
                    .and_then(|s| s.status)
                    .is_some_and(|s| s == "Success"),
                None => false,
            };
            if !succeeded {
                warn!(pod = %pod, stderr = %stderr.trim(), "Command in pod did not succeed");
            }
            Ok::<_, Error>(succeeded)
        })
        .await
    }
}

/// Fail with [`Error::Timeout`] once `timeout` elapses
async fn within<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout {
                after: timeout,
                operation: operation.to_string(),
            })
        })
}

/// Run `exec` for every pod in turn; a failing pod is logged and does not
/// stop the others. Returns how many succeeded.
async fn exec_each<F, Fut>(pods: Vec<String>, mut exec: F) -> usize
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut succeeded = 0;
    for pod in pods {
        match exec(pod.clone()).await {
            Ok(true) => {
                info!(pod = %pod, "Command completed in pod");
                succeeded += 1;
            }
            Ok(false) => {}
            Err(e) => warn!(pod = %pod, error = %e, "Command in pod failed"),
        }
    }
    succeeded
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get(
        &self,
        namespace: &str,
        kind: OwnedKind,
        name: &str,
    ) -> Result<Option<OwnedObject>> {
        Ok(match kind {
            OwnedKind::Deployment => self
                .get_typed::<Deployment>(namespace, name)
                .await?
                .map(OwnedObject::Deployment),
            OwnedKind::Service => self
                .get_typed::<Service>(namespace, name)
                .await?
                .map(OwnedObject::Service),
            OwnedKind::Ingress => self
                .get_typed::<Ingress>(namespace, name)
                .await?
                .map(OwnedObject::Ingress),
            OwnedKind::Secret => self
                .get_typed::<Secret>(namespace, name)
                .await?
                .map(OwnedObject::Secret),
            OwnedKind::ServiceAccount => self
                .get_typed::<ServiceAccount>(namespace, name)
                .await?
                .map(OwnedObject::ServiceAccount),
            OwnedKind::Role => self
                .get_typed::<Role>(namespace, name)
                .await?
                .map(OwnedObject::Role),
            OwnedKind::RoleBinding => self
                .get_typed::<RoleBinding>(namespace, name)
                .await?
                .map(OwnedObject::RoleBinding),
        })
    }

    async fn apply(&self, namespace: &str, object: &OwnedObject) -> Result<()> {
        debug!(kind = %object.kind(), name = %object.name(), "Applying");
        match object {
            OwnedObject::Deployment(o) => self.apply_typed(namespace, o).await,
            OwnedObject::Service(o) => self.apply_typed(namespace, o).await,
            OwnedObject::Ingress(o) => self.apply_typed(namespace, o).await,
            OwnedObject::Secret(o) => self.apply_typed(namespace, o).await,
            OwnedObject::ServiceAccount(o) => self.apply_typed(namespace, o).await,
            OwnedObject::Role(o) => self.apply_typed(namespace, o).await,
            OwnedObject::RoleBinding(o) => self.apply_typed(namespace, o).await,
        }
    }

    async fn delete(&self, namespace: &str, kind: OwnedKind, name: &str) -> Result<bool> {
        match kind {
            OwnedKind::Deployment => self.delete_typed::<Deployment>(namespace, name).await,
            OwnedKind::Service => self.delete_typed::<Service>(namespace, name).await,
            OwnedKind::Ingress => self.delete_typed::<Ingress>(namespace, name).await,
            OwnedKind::Secret => self.delete_typed::<Secret>(namespace, name).await,
            OwnedKind::ServiceAccount => {
                self.delete_typed::<ServiceAccount>(namespace, name).await
            }
            OwnedKind::Role => self.delete_typed::<Role>(namespace, name).await,
            OwnedKind::RoleBinding => self.delete_typed::<RoleBinding>(namespace, name).await,
        }
    }

    async fn list_metadata(
        &self,
        namespace: &str,
        kind: OwnedKind,
        label_selector: &str,
    ) -> Result<Vec<ObjectMeta>> {
        match kind {
            OwnedKind::Deployment => self.list_typed::<Deployment>(namespace, label_selector).await,
            OwnedKind::Service => self.list_typed::<Service>(namespace, label_selector).await,
            OwnedKind::Ingress => self.list_typed::<Ingress>(namespace, label_selector).await,
            OwnedKind::Secret => self.list_typed::<Secret>(namespace, label_selector).await,
            OwnedKind::ServiceAccount => {
                self.list_typed::<ServiceAccount>(namespace, label_selector)
                    .await
            }
            OwnedKind::Role => self.list_typed::<Role>(namespace, label_selector).await,
            OwnedKind::RoleBinding => {
                self.list_typed::<RoleBinding>(namespace, label_selector)
                    .await
            }
        }
    }

    async fn owner_deleting(&self, owner: &OwnerKey) -> Result<bool> {
        let meta = match owner.kind {
            OwnerKind::Environment => self
                .owner_get::<DevStagingEnvironment>(owner)
                .await?
                .map(|o| o.metadata),
            OwnerKind::RunnerPool => self
                .owner_get::<GithubActionRunnerPool>(owner)
                .await?
                .map(|o| o.metadata),
        };
        Ok(match meta {
            None => true,
            Some(meta) => {
                meta.deletion_timestamp.is_some() || meta.uid.as_deref() != Some(&owner.uid)
            }
        })
    }

    async fn patch_status(&self, owner: &OwnerKey, status: Value) -> Result<()> {
        let patch = json!({ "status": status });
        match owner.kind {
            OwnerKind::Environment => {
                self.owner_status_patch::<DevStagingEnvironment>(owner, patch)
                    .await
            }
            OwnerKind::RunnerPool => {
                self.owner_status_patch::<GithubActionRunnerPool>(owner, patch)
                    .await
            }
        }
    }

    async fn patch_finalizers(&self, owner: &OwnerKey, patch: Value) -> Result<()> {
        let patch: json_patch::Patch = serde_json::from_value(patch)?;
        let result = match owner.kind {
            OwnerKind::Environment => {
                self.owner_json_patch::<DevStagingEnvironment>(owner, patch)
                    .await
            }
            OwnerKind::RunnerPool => {
                self.owner_json_patch::<GithubActionRunnerPool>(owner, patch)
                    .await
            }
        };
        match result {
            // A failed `test` operation is rejected as invalid
            Err(Error::KubeError(kube::Error::Api(ae))) if matches!(ae.code, 409 | 422) => {
                Err(Error::Conflict(format!("finalizers of {owner}: {}", ae.message)))
            }
            other => other,
        }
    }

    async fn exec_in_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<usize> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .bounded("list pods", pods.list(&ListParams::default().labels(label_selector)))
            .await?;

        let running: Vec<String> = list
            .items
            .into_iter()
            .filter(|pod| {
                pod.metadata.deletion_timestamp.is_none()
                    && pod
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.as_deref())
                        .is_some_and(|p| p == "Running")
            })
            .map(|pod| pod.name_any())
            .collect();

        let pods = &pods;
        let command = &command;
        Ok(exec_each(running, |name| async move {
            self.exec_one(pods, &name, container, command.clone()).await
        })
        .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stalled_call_times_out() {
        let err = within(Duration::from_millis(20), "exec", async {
            std::future::pending::<Result<()>>().await
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout { ref operation, .. } if operation == "exec"));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn failing_pod_does_not_skip_the_rest() {
        let pods = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut attempted = Vec::new();

        let succeeded = exec_each(pods, |pod| {
            attempted.push(pod.clone());
            async move {
                match pod.as_str() {
                    "a" => Err(Error::Exec("a: stream closed".to_string())),
                    "b" => Ok(false),
                    _ => Ok(true),
                }
            }
        })
        .await;

        assert_eq!(succeeded, 1);
        assert_eq!(attempted, vec!["a", "b", "c"]);
    }
}
