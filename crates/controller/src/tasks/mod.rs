use crate::crds::{DevStagingEnvironment, GithubActionRunnerPool};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config;
use kube::{Api, Client, Resource};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, Instrument};

pub mod cluster;
pub mod config;
pub mod dependencies;
pub mod engine;
pub mod environment;
pub mod labels;
pub mod naming;
pub mod runner;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use config::ControllerConfig;
pub use types::{Context, Error, Result};

use cluster::api::KubeCluster;
use dependencies::credentials::RandomCredentials;
use engine::backoff::BackoffTracker;
use engine::metrics::ReconcileMetrics;
use engine::{controller_config, error_policy, reconcile};
use runner::{GithubRunnerApi, RegistrationLedger};

/// Build the shared reconcile context backed by the live cluster
pub fn build_context(
    client: Client,
    config: Arc<ControllerConfig>,
    metrics: Arc<ReconcileMetrics>,
) -> Result<Context> {
    let reconcile = &config.reconcile;
    let cluster = KubeCluster::new(client, &config.field_manager, reconcile.api_timeout());
    let runner_api = GithubRunnerApi::new(config.runner.exchange_timeout())?;

    Ok(Context {
        cluster: Arc::new(cluster),
        backoff: Arc::new(BackoffTracker::new(
            Duration::from_secs(reconcile.backoff_base_seconds),
            Duration::from_secs(reconcile.backoff_ceiling_seconds),
        )),
        runner_api: Arc::new(runner_api),
        registrations: Arc::new(RegistrationLedger::new()),
        credentials: Arc::new(RandomCredentials),
        metrics,
        config,
    })
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main entry point: run both controllers until either stops
#[instrument(skip_all, fields(namespace = ?config.watch_namespace))]
pub async fn run_task_controller(
    client: Client,
    config: Arc<ControllerConfig>,
    metrics: Arc<ReconcileMetrics>,
) -> Result<()> {
    info!("Starting kindling controllers");

    let context = Arc::new(build_context(client.clone(), config.clone(), metrics)?);
    debug!("Controller context created");

    let environment_handle = tokio::spawn({
        let context = context.clone();
        let client = client.clone();
        async move { run_environment_controller(client, context).await }
    });

    let runner_handle = tokio::spawn({
        let context = context.clone();
        let client = client.clone();
        async move { run_runner_pool_controller(client, context).await }
    });

    match tokio::try_join!(environment_handle, runner_handle) {
        Ok((environment_result, runner_result)) => {
            if let Err(e) = environment_result {
                error!("DevStagingEnvironment controller failed: {:?}", e);
            }
            if let Err(e) = runner_result {
                error!("GithubActionRunnerPool controller failed: {:?}", e);
            }
        }
        Err(e) => {
            error!("Controller task join error: {:?}", e);
        }
    }

    info!("Kindling controllers shutting down");
    Ok(())
}

/// Run the `DevStagingEnvironment` controller
#[instrument(skip_all)]
async fn run_environment_controller(client: Client, context: Arc<Context>) -> Result<()> {
    info!("Starting DevStagingEnvironment controller");

    let namespace = context.config.watch_namespace.as_deref();
    let watcher_config = Config::default().any_semantic();

    Controller::new(
        scoped_api::<DevStagingEnvironment>(&client, namespace),
        watcher_config.clone(),
    )
    .owns(scoped_api::<Deployment>(&client, namespace), watcher_config.clone())
    .owns(scoped_api::<Service>(&client, namespace), watcher_config.clone())
    .owns(scoped_api::<Ingress>(&client, namespace), watcher_config.clone())
    .owns(scoped_api::<Secret>(&client, namespace), watcher_config)
    .with_config(controller_config(&context.config.reconcile))
    .run(
        reconcile::<DevStagingEnvironment>,
        error_policy::<DevStagingEnvironment>,
        context.clone(),
    )
    .for_each(|result| {
        let span = tracing::info_span!("environment_reconciliation_result");
        async move {
            match result {
                Ok((object, _)) => debug!(object = %object, "DevStagingEnvironment reconciled"),
                Err(e) => error!(error = ?e, "DevStagingEnvironment reconciliation error"),
            }
        }
        .instrument(span)
    })
    .await;

    info!("DevStagingEnvironment controller shutting down");
    Ok(())
}

/// Run the `GithubActionRunnerPool` controller
#[instrument(skip_all)]
async fn run_runner_pool_controller(client: Client, context: Arc<Context>) -> Result<()> {
    info!("Starting GithubActionRunnerPool controller");

    let namespace = context.config.watch_namespace.as_deref();
    let watcher_config = Config::default().any_semantic();

    Controller::new(
        scoped_api::<GithubActionRunnerPool>(&client, namespace),
        watcher_config.clone(),
    )
    .owns(scoped_api::<Deployment>(&client, namespace), watcher_config.clone())
    .owns(scoped_api::<ServiceAccount>(&client, namespace), watcher_config.clone())
    .owns(scoped_api::<Role>(&client, namespace), watcher_config.clone())
    .owns(scoped_api::<RoleBinding>(&client, namespace), watcher_config)
    .with_config(controller_config(&context.config.reconcile))
    .run(
        reconcile::<GithubActionRunnerPool>,
        error_policy::<GithubActionRunnerPool>,
        context.clone(),
    )
    .for_each(|result| {
        let span = tracing::info_span!("runner_pool_reconciliation_result");
        async move {
            match result {
                Ok((object, _)) => debug!(object = %object, "GithubActionRunnerPool reconciled"),
                Err(e) => error!(error = ?e, "GithubActionRunnerPool reconciliation error"),
            }
        }
        .instrument(span)
    })
    .await;

    info!("GithubActionRunnerPool controller shutting down");
    Ok(())
}
