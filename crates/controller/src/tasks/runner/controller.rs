use super::registry::{RunnerApiError, RunnerToken};
use super::resources::{self, RunnerNames, RUNNER_CONTAINER};
use super::status::{self, Observed};
use crate::crds::{GithubActionRunnerPool, GithubActionRunnerPoolStatus, RegistrationState};
use crate::tasks::cluster::{OwnedKind, OwnedObject, OwnerKey, OwnerKind};
use crate::tasks::dependencies::credentials::secret_values;
use crate::tasks::engine::{
    ensure_owner_live, now, publish_status, Applier, Cleanup, Reconciler,
};
use crate::tasks::environment::status::replica_counts;
use crate::tasks::types::{Context, Result, RUNNER_POOL_FINALIZER_NAME};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const OWNED_KINDS: [OwnedKind; 4] = [
    OwnedKind::ServiceAccount,
    OwnedKind::Role,
    OwnedKind::RoleBinding,
    OwnedKind::Deployment,
];

/// Command run in each runner pod to remove its registration
const REMOVE_COMMAND: &str = "/home/runner/config.sh";

#[async_trait]
impl Reconciler for GithubActionRunnerPool {
    const OWNER_KIND: OwnerKind = OwnerKind::RunnerPool;
    const FINALIZER: &'static str = RUNNER_POOL_FINALIZER_NAME;

    async fn apply(&self, owner: &OwnerKey, ctx: &Context) -> Result<Action> {
        reconcile_pool(self, owner, ctx).await
    }

    async fn cleanup(&self, owner: &OwnerKey, ctx: &Context) -> Result<Cleanup> {
        deregister_pool(self, owner, ctx).await
    }

    fn forget(owner: &OwnerKey, ctx: &Context) {
        ctx.registrations.forget(&owner.uid);
    }
}

/// Long-lived platform token from the secret referenced by the pool
async fn long_lived_token(
    pool: &GithubActionRunnerPool,
    owner: &OwnerKey,
    ctx: &Context,
) -> Result<String> {
    let reference = &pool.spec.token_secret_ref;
    let secret = ctx
        .cluster
        .get(&owner.namespace, OwnedKind::Secret, &reference.name)
        .await?;
    secret
        .as_ref()
        .and_then(OwnedObject::as_secret)
        .map(secret_values)
        .and_then(|mut values| values.remove(&reference.key))
        .filter(|token| !token.trim().is_empty())
        .map(|token| token.trim().to_string())
        .ok_or_else(|| {
            let missing = format!("{}/{}", reference.name, reference.key);
            RunnerApiError::MissingCredential(missing).into()
        })
}

/// Run one token exchange under the configured per-attempt timeout
async fn exchange<F>(ctx: &Context, call: F) -> Result<RunnerToken>
where
    F: Future<Output = Result<RunnerToken, RunnerApiError>>,
{
    let limit = ctx.config.runner.exchange_timeout();
    match tokio::time::timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RunnerApiError::Timeout(limit).into()),
    }
}

#[instrument(skip(pool, ctx), fields(pool = %owner))]
async fn reconcile_pool(
    pool: &GithubActionRunnerPool,
    owner: &OwnerKey,
    ctx: &Context,
) -> Result<Action> {
    let timestamp = now();

    if let Err(e) = resources::validate(pool) {
        warn!(error = %e, "Runner pool spec is invalid, nothing applied");
        let invalid = status::invalid(
            pool.status.as_ref(),
            pool.metadata.generation,
            &e.to_string(),
            &timestamp,
        );
        publish_status(ctx, owner, pool.status.as_ref(), &invalid).await?;
        return Err(e);
    }

    let names = RunnerNames::of(pool);
    let mut applier = Applier::new(ctx, owner);

    ensure_owner_live(ctx, owner).await?;
    applier
        .ensure(&OwnedObject::ServiceAccount(resources::service_account(owner, &names)))
        .await?;
    applier.ensure(&OwnedObject::Role(resources::role(owner, &names)?)).await?;
    applier
        .ensure(&OwnedObject::RoleBinding(resources::role_binding(owner, &names)?))
        .await?;

    ensure_owner_live(ctx, owner).await?;
    let deployment = resources::deployment(pool, owner, &names, &ctx.config.runner)?;
    let observed = applier.ensure(&OwnedObject::Deployment(deployment)).await?;

    let removed = applier.prune(&OWNED_KINDS).await?;
    if removed > 0 {
        info!(removed, "Pruned runner sub-resources no longer declared");
    }

    let mut registration = pool.registration_state();
    if registration == RegistrationState::Unregistered {
        if ctx.registrations.is_registered(&owner.uid) {
            registration = RegistrationState::Registered;
        } else {
            match register(pool, owner, ctx).await {
                Ok(()) => registration = RegistrationState::Registered,
                Err(e) => {
                    warn!(error = %e, "Registration token exchange failed");
                    let failed = status::registration_failed(
                        pool.status.as_ref(),
                        &e.to_string(),
                        &timestamp,
                    );
                    publish_status(ctx, owner, pool.status.as_ref(), &failed).await?;
                    return Err(e);
                }
            }
        }
    }

    let (ready_runners, _) = replica_counts(observed.as_ref().and_then(OwnedObject::as_deployment));
    let observed = Observed {
        generation: pool.metadata.generation,
        registration,
        desired_runners: pool.spec.replicas,
        ready_runners,
        runner_labels: pool.runner_labels(),
        deployment_name: names.workload.clone(),
        service_account_name: names.service_account.clone(),
    };
    let new_status = status::converged(pool.status.as_ref(), observed, &timestamp);
    let ready = new_status.phase == status::PHASE_READY;
    publish_status(ctx, owner, pool.status.as_ref(), &new_status).await?;

    debug!(writes = applier.writes(), ?registration, "Runner pool converged");
    let reconcile = &ctx.config.reconcile;
    Ok(Action::requeue(if ready {
        reconcile.resync()
    } else {
        reconcile.progress()
    }))
}

/// Prove the long-lived token can mint a registration token for the repository.
/// Runner pods perform their own exchange at startup.
async fn register(pool: &GithubActionRunnerPool, owner: &OwnerKey, ctx: &Context) -> Result<()> {
    let token = long_lived_token(pool, owner, ctx).await?;
    let api_url = pool.api_url();
    let issued = exchange(
        ctx,
        ctx.runner_api
            .registration_token(&api_url, &pool.spec.repository, &token),
    )
    .await?;

    ctx.registrations.mark_registered(&owner.uid);
    ctx.metrics.registration();
    info!(
        repository = %pool.spec.repository,
        expires_at = ?issued.expires_at,
        "Runner pool registered"
    );
    Ok(())
}

fn deadline_passed(status: &GithubActionRunnerPoolStatus, timeout: Duration) -> bool {
    let Some(started) = status
        .deregistration_started_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    else {
        return false;
    };
    let elapsed = Utc::now().signed_duration_since(started.with_timezone(&Utc));
    elapsed.to_std().is_ok_and(|e| e >= timeout)
}

#[instrument(skip(pool, ctx), fields(pool = %owner))]
async fn deregister_pool(
    pool: &GithubActionRunnerPool,
    owner: &OwnerKey,
    ctx: &Context,
) -> Result<Cleanup> {
    if ctx.registrations.is_deregistered(&owner.uid) {
        return Ok(Cleanup::Done);
    }

    let was_registered = ctx.registrations.is_registered(&owner.uid)
        || matches!(
            pool.registration_state(),
            RegistrationState::Registered | RegistrationState::Deregistering
        );
    if !was_registered {
        info!("Runner pool never registered, nothing to remove");
        return Ok(Cleanup::Done);
    }

    let mut current = pool.status.clone().unwrap_or_default();
    if current.deregistration_started_at.is_none() {
        let started = now();
        let deregistering = status::deregistering(Some(&current), &started, &started);
        publish_status(ctx, owner, Some(&current), &deregistering).await?;
        current = deregistering;
    }

    let removal = async {
        let token = long_lived_token(pool, owner, ctx).await?;
        exchange(
            ctx,
            ctx.runner_api
                .removal_token(&pool.api_url(), &pool.spec.repository, &token),
        )
        .await
    }
    .await;

    let removal = match removal {
        Ok(token) => token,
        Err(e) if deadline_passed(&current, ctx.config.runner.deregistration_timeout()) => {
            warn!(
                error = %e,
                repository = %pool.spec.repository,
                "Deregistration deadline passed, releasing the pool without deregistering"
            );
            ctx.registrations.mark_deregistered(&owner.uid);
            return Ok(Cleanup::Done);
        }
        Err(e) => {
            warn!(error = %e, "Removal token exchange failed, retrying");
            return Err(e);
        }
    };

    let names = RunnerNames::of(pool);
    let command = vec![
        REMOVE_COMMAND.to_string(),
        "remove".to_string(),
        "--token".to_string(),
        removal.token,
    ];
    match ctx
        .cluster
        .exec_in_pods(&owner.namespace, &names.pod_selector(), RUNNER_CONTAINER, command)
        .await
    {
        Ok(pods) => info!(pods, "Runner registrations removed"),
        Err(e) => warn!(error = %e, "Runner removal command failed; pods may already be gone"),
    }

    ctx.registrations.mark_deregistered(&owner.uid);
    ctx.metrics.deregistration();
    Ok(Cleanup::Done)
}
