use super::resources::{self, EnvironmentPlan, PlannedDependency};
use super::status::{self, deployment_ready, replica_counts, Observed};
use crate::crds::{DependencyStatus, DevStagingEnvironment};
use crate::tasks::cluster::{OwnedKind, OwnedObject, OwnerKey, OwnerKind};
use crate::tasks::dependencies::credentials::{resolve_credentials, CredentialSource};
use crate::tasks::engine::{
    ensure_owner_live, now, publish_status, Applier, Cleanup, Reconciler,
};
use crate::tasks::types::{Context, Error, Result, ENVIRONMENT_FINALIZER_NAME};
use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

/// Kinds an environment owns; anything labelled for it outside the desired set is pruned
const OWNED_KINDS: [OwnedKind; 4] = [
    OwnedKind::Deployment,
    OwnedKind::Service,
    OwnedKind::Ingress,
    OwnedKind::Secret,
];

#[async_trait]
impl Reconciler for DevStagingEnvironment {
    const OWNER_KIND: OwnerKind = OwnerKind::Environment;
    const FINALIZER: &'static str = ENVIRONMENT_FINALIZER_NAME;

    async fn apply(&self, owner: &OwnerKey, ctx: &Context) -> Result<Action> {
        reconcile_environment(self, owner, ctx).await
    }

    async fn cleanup(&self, owner: &OwnerKey, ctx: &Context) -> Result<Cleanup> {
        // Sub-resources go with the owner through garbage collection
        let terminating = status::terminating(self.status.as_ref(), &now());
        publish_status(ctx, owner, self.status.as_ref(), &terminating).await?;
        info!(environment = %owner, "Environment released for garbage collection");
        Ok(Cleanup::Done)
    }
}

#[instrument(skip(env, ctx), fields(environment = %owner))]
async fn reconcile_environment(
    env: &DevStagingEnvironment,
    owner: &OwnerKey,
    ctx: &Context,
) -> Result<Action> {
    let timestamp = now();

    let plan = match resources::plan(env, owner) {
        Ok(plan) => plan,
        Err(Error::ValidationError(message)) => {
            warn!(error = %message, "Environment spec is invalid, nothing applied");
            let invalid = status::invalid(
                env.status.as_ref(),
                env.metadata.generation,
                &message,
                &timestamp,
            );
            publish_status(ctx, owner, env.status.as_ref(), &invalid).await?;
            return Err(Error::ValidationError(message));
        }
        Err(e) => return Err(e),
    };
    for skipped in &plan.skipped {
        warn!(
            dependency_type = %skipped.declared_type,
            name = ?skipped.name,
            "Skipping dependency with unsupported type"
        );
    }

    let mut applier = Applier::new(ctx, owner);

    // Dependencies first so their Secrets exist before the app references them
    ensure_owner_live(ctx, owner).await?;
    let mut injected: Vec<(String, String)> = Vec::new();
    let mut dependency_statuses = Vec::new();
    for dependency in &plan.dependencies {
        let (vars, dep_status) =
            ensure_dependency(&mut applier, owner, dependency, ctx.credentials.as_ref()).await?;
        injected.extend(vars.into_iter().map(|v| (v, dependency.secret_name.clone())));
        dependency_statuses.push(dep_status);
    }

    ensure_owner_live(ctx, owner).await?;
    let observed_app = ensure_application(&mut applier, env, owner, &plan, &injected).await?;

    let removed = applier.prune(&OWNED_KINDS).await?;
    if removed > 0 {
        info!(removed, "Pruned sub-resources no longer declared");
    }
    debug!(writes = applier.writes(), "Sub-resources converged");

    let app_deployment = observed_app.as_ref().and_then(OwnedObject::as_deployment);
    let (ready_replicas, available_replicas) = replica_counts(app_deployment);
    let desired_replicas = env.spec.deployment.replicas;
    let observed = Observed {
        generation: env.metadata.generation,
        app_existed: app_deployment.is_some(),
        desired_replicas,
        ready_replicas,
        available_replicas,
        app_ready: deployment_ready(app_deployment, desired_replicas),
        dependencies: dependency_statuses,
        skipped: plan.skipped.clone(),
        ingress_host: env
            .spec
            .ingress
            .as_ref()
            .filter(|i| i.enabled)
            .and_then(|i| i.host.clone()),
        url: resources::public_url(env),
    };

    let new_status = status::converged(env.status.as_ref(), observed, &timestamp);
    let ready = new_status.phase == status::PHASE_READY;
    publish_status(ctx, owner, env.status.as_ref(), &new_status).await?;

    let reconcile = &ctx.config.reconcile;
    Ok(if ready {
        Action::requeue(reconcile.resync())
    } else {
        Action::requeue(reconcile.progress())
    })
}

/// Secret, Deployment and Service of one dependency.
///
/// Returns the injected variable names and the dependency's status entry.
async fn ensure_dependency(
    applier: &mut Applier<'_>,
    owner: &OwnerKey,
    dependency: &PlannedDependency,
    credentials: &dyn CredentialSource,
) -> Result<(Vec<String>, DependencyStatus)> {
    let existing = applier
        .observe(OwnedKind::Secret, &dependency.secret_name)
        .await?;
    let creds = resolve_credentials(
        dependency.resolved.profile(),
        existing.as_ref().and_then(OwnedObject::as_secret),
        credentials,
    );
    let connection = dependency
        .resolved
        .connection_env(&dependency.resource_name, &creds);
    let vars: Vec<String> = connection.iter().map(|(name, _)| name.clone()).collect();

    let secret = resources::dependency_secret(owner, dependency, &creds, &connection);
    applier.ensure(&OwnedObject::Secret(secret)).await?;

    let deployment = resources::dependency_deployment(owner, dependency)?;
    let observed = applier.ensure(&OwnedObject::Deployment(deployment)).await?;
    let ready = deployment_ready(observed.as_ref().and_then(OwnedObject::as_deployment), 1);

    let service = resources::dependency_service(owner, dependency)?;
    applier.ensure(&OwnedObject::Service(service)).await?;

    Ok((
        vars.clone(),
        DependencyStatus {
            name: dependency.name.clone(),
            dependency_type: dependency.resolved.dependency_type.as_str().to_string(),
            service_name: dependency.resource_name.clone(),
            ready,
            env_vars: vars,
        },
    ))
}

/// Deployment, Service and optional Ingress of the application.
///
/// Returns the app Deployment as observed before this pass.
async fn ensure_application(
    applier: &mut Applier<'_>,
    env: &DevStagingEnvironment,
    owner: &OwnerKey,
    plan: &EnvironmentPlan,
    injected: &[(String, String)],
) -> Result<Option<OwnedObject>> {
    let deployment = resources::app_deployment(env, owner, &plan.app_name, injected)?;
    let observed = applier.ensure(&OwnedObject::Deployment(deployment)).await?;

    let service = resources::app_service(env, owner, &plan.app_name)?;
    applier.ensure(&OwnedObject::Service(service)).await?;

    // A disabled ingress is left out of the desired set and pruned
    if let Some(ingress) = resources::app_ingress(env, owner, &plan.app_name)? {
        applier.ensure(&OwnedObject::Ingress(ingress)).await?;
    }

    debug!(name = %env.name_any(), "Application resources ensured");
    Ok(observed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::DevStagingEnvironmentStatus;
    use crate::tasks::cluster::memory::MemoryCluster;
    use crate::tasks::dependencies::credentials::secret_values;
    use crate::tasks::dependencies::credentials::testing::SequentialCredentials;
    use crate::tasks::engine::{error_policy, reconcile};
    use crate::tasks::labels::owner_selector;
    use crate::tasks::naming::ResourceNaming;
    use crate::tasks::testing::context_with;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::Arc;

    const FULL: &str = r#"
deployment:
  image: shop:1.0
  port: 8080
  replicas: 2
  healthCheck:
    path: /ready
ingress:
  enabled: true
  host: shop.dev.local
dependencies:
  - type: postgres
  - type: redis
  - type: mysql
  - type: mongodb
  - type: rabbitmq
  - type: minio
"#;

    struct Harness {
        cluster: Arc<MemoryCluster>,
        ctx: Arc<Context>,
        env: DevStagingEnvironment,
        owner: OwnerKey,
    }

    impl Harness {
        fn new(yaml: &str) -> Self {
            Self::on(Arc::new(MemoryCluster::new()), "shop", "uid-shop", yaml)
        }

        /// Environment `name` sharing `cluster` with other harnesses
        fn on(cluster: Arc<MemoryCluster>, name: &str, uid: &str, yaml: &str) -> Self {
            let credentials = Arc::new(SequentialCredentials::default());
            let ctx = Arc::new(context_with(cluster.clone(), credentials));
            let mut env = DevStagingEnvironment::new(name, serde_yaml::from_str(yaml).unwrap());
            env.metadata.namespace = Some("dev".to_string());
            env.metadata.uid = Some(uid.to_string());
            env.metadata.generation = Some(1);
            let owner = OwnerKey::of(&env, OwnerKind::Environment).unwrap();
            cluster.register_owner(&owner);
            Self {
                cluster,
                ctx,
                env,
                owner,
            }
        }

        /// Reconcile, then fold the written status and finalizers back into the object
        async fn reconcile(&mut self) -> Result<Action> {
            let result = reconcile(Arc::new(self.env.clone()), self.ctx.clone()).await;
            if let Some(record) = self.cluster.owner(&self.owner) {
                if !record.status.is_null() {
                    self.env.status = Some(serde_json::from_value(record.status).unwrap());
                }
                self.env.metadata.finalizers = Some(record.finalizers);
            }
            result
        }

        fn status(&self) -> DevStagingEnvironmentStatus {
            self.env.status.clone().unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn every_dependency_type_converges() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();

        for dep in ["postgres", "redis", "mysql", "mongodb", "rabbitmq", "minio"] {
            let name = format!("shop-{dep}");
            let deployment = h.cluster.object("dev", OwnedKind::Deployment, &name);
            assert!(deployment.is_some(), "{name} deployment");
            assert!(h.cluster.object("dev", OwnedKind::Service, &name).is_some(), "{name} service");
            let secret = format!("{name}-credentials");
            assert!(
                h.cluster.object("dev", OwnedKind::Secret, &secret).is_some(),
                "{name} secret"
            );
        }

        let app = h.cluster.object("dev", OwnedKind::Deployment, "shop").unwrap();
        let env_names: Vec<String> = app.as_deployment().unwrap().spec.as_ref().unwrap()
            .template.spec.as_ref().unwrap().containers[0]
            .env.as_ref().unwrap().iter().map(|e| e.name.clone()).collect();
        let injected = [
            "DATABASE_URL",
            "REDIS_URL",
            "MONGO_URL",
            "AMQP_URL",
            "S3_ENDPOINT",
            "S3_ACCESS_KEY",
            "S3_SECRET_KEY",
        ];
        for var in injected {
            assert!(env_names.contains(&var.to_string()), "{var} injected");
        }
        assert!(h.cluster.object("dev", OwnedKind::Ingress, "shop").is_some());
        assert_eq!(h.status().dependencies.len(), 6);
    }

    #[tokio::test]
    async fn second_pass_writes_nothing() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();
        let writes = h.cluster.write_count();
        assert!(writes > 0);

        h.reconcile().await.unwrap();
        assert_eq!(h.cluster.write_count(), writes);

        // Status settles as well once nothing changes
        let patches = h.cluster.status_patches();
        h.reconcile().await.unwrap();
        assert_eq!(h.cluster.write_count(), writes);
        assert_eq!(h.cluster.status_patches(), patches);
    }

    #[tokio::test]
    async fn canonicalised_quantities_count_as_converged() {
        let mut h = Harness::new(
            "deployment:\n  image: shop\n  port: 80\n  resources:\n    cpuLimit: 1000m\n    \
             memoryLimit: 1024Mi\ndependencies:\n  - type: redis\n    storageSize: 1024Mi\n",
        );
        h.reconcile().await.unwrap();

        // What the API server stores for the quantities we sent
        fn canonical(value: &mut serde_json::Value) {
            match value {
                serde_json::Value::String(s) if s == "1000m" => *s = "1".to_string(),
                serde_json::Value::String(s) if s == "1024Mi" => *s = "1Gi".to_string(),
                serde_json::Value::Array(items) => items.iter_mut().for_each(canonical),
                serde_json::Value::Object(fields) => fields.values_mut().for_each(canonical),
                _ => {}
            }
        }
        h.cluster.edit("dev", OwnedKind::Deployment, "shop", canonical);
        h.cluster.edit("dev", OwnedKind::Deployment, "shop-redis", canonical);
        let writes = h.cluster.write_count();

        h.reconcile().await.unwrap();
        assert_eq!(h.cluster.write_count(), writes);
    }

    #[tokio::test]
    async fn credentials_survive_unrelated_changes() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();
        let secret = "shop-postgres-credentials";
        let before = h.cluster.object("dev", OwnedKind::Secret, secret).unwrap();
        let before = secret_values(before.as_secret().unwrap());

        h.env.spec.deployment.replicas = 5;
        h.env.metadata.generation = Some(2);
        h.reconcile().await.unwrap();

        let after = h.cluster.object("dev", OwnedKind::Secret, secret).unwrap();
        let after = secret_values(after.as_secret().unwrap());
        assert_eq!(before["POSTGRES_PASSWORD"], after["POSTGRES_PASSWORD"]);
        assert_eq!(before["DATABASE_URL"], after["DATABASE_URL"]);

        let app = h.cluster.object("dev", OwnedKind::Deployment, "shop").unwrap();
        assert_eq!(app.as_deployment().unwrap().spec.as_ref().unwrap().replicas, Some(5));
    }

    #[tokio::test]
    async fn manual_edits_are_overwritten() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();
        h.cluster.edit("dev", OwnedKind::Deployment, "shop", |v| {
            v["spec"]["replicas"] = serde_json::json!(9);
        });

        h.reconcile().await.unwrap();
        let app = h.cluster.object("dev", OwnedKind::Deployment, "shop").unwrap();
        assert_eq!(app.as_deployment().unwrap().spec.as_ref().unwrap().replicas, Some(2));
    }

    #[tokio::test]
    async fn unknown_type_provisions_the_rest() {
        let mut h = Harness::new(
            "deployment:\n  image: shop\n  port: 80\n\
             dependencies:\n  - type: cassandra\n  - type: redis\n",
        );
        h.reconcile().await.unwrap();

        assert!(h.cluster.object("dev", OwnedKind::Deployment, "shop-redis").is_some());
        assert!(h.cluster.object("dev", OwnedKind::Deployment, "shop-cassandra").is_none());
        assert!(h.cluster.object("dev", OwnedKind::Secret, "shop-cassandra-credentials").is_none());
        let condition = h.status().conditions.into_iter()
            .find(|c| c.condition_type == status::CONDITION_DEPENDENCY_INVALID).unwrap();
        assert!(condition.is_true());
    }

    #[tokio::test]
    async fn invalid_spec_applies_nothing() {
        let mut h = Harness::new(
            "deployment:\n  image: shop\n  port: 80\ningress:\n  enabled: true\n\
             dependencies:\n  - type: redis\n",
        );
        let err = h.reconcile().await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert_eq!(h.cluster.object_count(), 0);
        assert_eq!(h.status().phase, status::PHASE_INVALID);

        // No finalizer before the first successful apply
        assert!(h.cluster.owner(&h.owner).unwrap().finalizers.is_empty());

        let action = error_policy(Arc::new(h.env.clone()), &err, h.ctx.clone());
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn finalizer_added_after_first_apply() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();
        assert_eq!(
            h.cluster.owner(&h.owner).unwrap().finalizers,
            vec![ENVIRONMENT_FINALIZER_NAME.to_string()]
        );
    }

    #[tokio::test]
    async fn disabling_ingress_removes_it() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();
        h.env.spec.ingress.as_mut().unwrap().enabled = false;

        h.reconcile().await.unwrap();
        assert!(h.cluster.object("dev", OwnedKind::Ingress, "shop").is_none());
        assert!(h.status().ingress_host.is_none());
    }

    #[tokio::test]
    async fn removed_dependency_is_pruned() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();
        h.env.spec.dependencies.retain(|d| d.dependency_type != "redis");

        h.reconcile().await.unwrap();
        assert!(h.cluster.object("dev", OwnedKind::Deployment, "shop-redis").is_none());
        assert!(h.cluster.object("dev", OwnedKind::Service, "shop-redis").is_none());
        assert!(h.cluster.object("dev", OwnedKind::Secret, "shop-redis-credentials").is_none());
        assert!(h.cluster.object("dev", OwnedKind::Deployment, "shop-postgres").is_some());
    }

    #[tokio::test]
    async fn owners_sharing_a_truncated_label_keep_their_objects() {
        let cluster = Arc::new(MemoryCluster::new());
        let prefix = "a".repeat(63);
        let yaml = "deployment:\n  image: shop\n  port: 80\n";
        let mut one = Harness::on(cluster.clone(), &format!("{prefix}-one"), "uid-one", yaml);
        let mut two = Harness::on(cluster.clone(), &format!("{prefix}-two"), "uid-two", yaml);
        assert_eq!(
            owner_selector(&one.owner),
            owner_selector(&two.owner),
            "label values collide"
        );

        one.reconcile().await.unwrap();
        two.reconcile().await.unwrap();
        one.reconcile().await.unwrap();

        for name in [&one.env.name_any(), &two.env.name_any()] {
            let app = ResourceNaming::app(name);
            assert!(cluster.object("dev", OwnedKind::Deployment, &app).is_some(), "{app}");
            assert!(cluster.object("dev", OwnedKind::Service, &app).is_some(), "{app}");
        }
        assert!(cluster.deletes().is_empty());
    }

    #[tokio::test]
    async fn ready_once_rollouts_finish() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();
        assert_ne!(h.status().phase, status::PHASE_READY);

        h.cluster.mark_deployments_ready();
        let action = h.reconcile().await.unwrap();
        assert_eq!(h.status().phase, status::PHASE_READY);
        assert_eq!(h.status().ready_replicas, 2);
        assert_eq!(h.status().url.as_deref(), Some("http://shop.dev.local"));
        assert_eq!(action, Action::requeue(h.ctx.config.reconcile.resync()));
    }

    #[tokio::test]
    async fn deletion_cascades_and_releases_finalizer() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();
        assert!(h.cluster.object_count() > 0);

        h.cluster.mark_deleting(&h.owner);
        h.env.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        h.reconcile().await.unwrap();

        // Finalizer released, owner gone; the garbage collector removes the rest
        assert!(h.cluster.owner(&h.owner).is_none());
        h.cluster.collect_garbage("uid-shop");
        assert_eq!(h.cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn deletion_without_finalizer_drops_backoff() {
        let mut h = Harness::new(FULL);
        h.cluster.fail_next_applies(1);
        let err = h.reconcile().await.unwrap_err();
        error_policy(Arc::new(h.env.clone()), &err, h.ctx.clone());
        assert_eq!(h.ctx.backoff.tracked(), 1);

        h.cluster.mark_deleting(&h.owner);
        h.env.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let action = h.reconcile().await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(h.ctx.backoff.tracked(), 0);
    }

    #[tokio::test]
    async fn finalizer_of_another_controller_survives_release() {
        let mut h = Harness::new(FULL);
        h.reconcile().await.unwrap();
        let ours = ENVIRONMENT_FINALIZER_NAME.to_string();
        let theirs = "backup.example.com/snapshot".to_string();
        // Added after our last read of the object
        h.cluster
            .set_finalizers(&h.owner, vec![ours.clone(), theirs.clone()]);

        h.cluster.mark_deleting(&h.owner);
        h.env.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        h.reconcile().await.unwrap();

        assert_eq!(h.cluster.owner(&h.owner).unwrap().finalizers, vec![theirs]);
    }

    #[tokio::test]
    async fn finalizer_is_not_added_over_a_concurrent_change() {
        let mut h = Harness::new(FULL);
        let theirs = "backup.example.com/snapshot".to_string();
        h.cluster.set_finalizers(&h.owner, vec![theirs.clone()]);

        let err = h.reconcile().await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.is_transient());
        assert_eq!(h.cluster.owner(&h.owner).unwrap().finalizers, vec![theirs.clone()]);

        // The next pass sees the current list and appends to it
        h.reconcile().await.unwrap();
        assert_eq!(
            h.cluster.owner(&h.owner).unwrap().finalizers,
            vec![theirs, ENVIRONMENT_FINALIZER_NAME.to_string()]
        );
    }

    #[tokio::test]
    async fn deletion_during_apply_stops_provisioning() {
        let h = Harness::new(FULL);
        h.cluster.mark_deleting(&h.owner);
        let err = reconcile(Arc::new(h.env.clone()), h.ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::OwnerDeleting));
        assert_eq!(h.cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn transient_failure_backs_off_then_converges() {
        let mut h = Harness::new(FULL);
        h.cluster.fail_next_applies(1);
        let err = h.reconcile().await.unwrap_err();
        assert!(err.is_transient());
        let action = error_policy(Arc::new(h.env.clone()), &err, h.ctx.clone());
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(5)));

        h.reconcile().await.unwrap();
        assert!(h.cluster.object("dev", OwnedKind::Deployment, "shop").is_some());
    }
}
