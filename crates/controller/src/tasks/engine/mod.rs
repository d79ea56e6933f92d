//! Generic reconcile loop shared by both descriptor kinds.
//!
//! Each kind implements [`Reconciler`]; [`reconcile`] wraps it with finalizer
//! handling and [`error_policy`] turns failures into backoff or a wait for the
//! next spec change.

use crate::tasks::cluster::{add_finalizer_patch, remove_finalizer_patch, OwnerKey, OwnerKind};
use crate::tasks::config::ReconcileConfig;
use crate::tasks::types::{Context, Error, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::{self, Action};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub mod apply;
pub mod backoff;
pub mod diff;
pub mod metrics;

pub use apply::Applier;

/// Result of a teardown attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Side effects finished; the finalizer can be released
    Done,
    /// Try again after the given delay
    Retry(Duration),
}

/// A descriptor kind the engine can drive
#[async_trait]
pub trait Reconciler:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Send
    + Sync
    + 'static
{
    const OWNER_KIND: OwnerKind;
    const FINALIZER: &'static str;

    /// Converge every sub-resource to the current spec
    async fn apply(&self, owner: &OwnerKey, ctx: &Context) -> Result<Action>;

    /// Out-of-band teardown run while the finalizer holds deletion
    async fn cleanup(&self, owner: &OwnerKey, ctx: &Context) -> Result<Cleanup>;

    /// Drop in-memory state kept for `owner` once its finalizer is released
    fn forget(_owner: &OwnerKey, _ctx: &Context) {}
}

/// Backoff key for an object
pub fn object_key<R: Reconciler>(obj: &R) -> String {
    format!(
        "{}/{}/{}",
        R::OWNER_KIND.kind(),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Reconcile entry point handed to `kube::runtime::Controller::run`
#[instrument(
    skip(obj, ctx),
    fields(
        kind = R::OWNER_KIND.kind(),
        name = %obj.name_any(),
        namespace = %obj.namespace().unwrap_or_default()
    )
)]
pub async fn reconcile<R: Reconciler>(obj: Arc<R>, ctx: Arc<Context>) -> Result<Action> {
    let owner = OwnerKey::of(obj.as_ref(), R::OWNER_KIND)?;
    let key = object_key(obj.as_ref());
    ctx.metrics.reconcile();

    let finalizers = obj.finalizers().to_vec();
    let has_finalizer = finalizers.iter().any(|f| f == R::FINALIZER);

    if obj.meta().deletion_timestamp.is_some() {
        if !has_finalizer {
            debug!("Deleting without our finalizer, nothing to do");
            ctx.backoff.reset(&key);
            return Ok(Action::await_change());
        }

        return match obj.cleanup(&owner, &ctx).await? {
            Cleanup::Done => {
                if let Some(patch) = remove_finalizer_patch(&finalizers, R::FINALIZER) {
                    ctx.cluster.patch_finalizers(&owner, patch).await?;
                }
                ctx.backoff.reset(&key);
                R::forget(&owner, &ctx);
                info!(owner = %owner, "Cleanup finished, finalizer released");
                Ok(Action::await_change())
            }
            Cleanup::Retry(delay) => {
                debug!(?delay, "Cleanup still in progress");
                Ok(Action::requeue(delay))
            }
        };
    }

    let action = obj.apply(&owner, &ctx).await?;

    // Only after the first successful apply
    if !has_finalizer {
        let patch = add_finalizer_patch(&finalizers, R::FINALIZER);
        ctx.cluster.patch_finalizers(&owner, patch).await?;
        info!(owner = %owner, finalizer = R::FINALIZER, "Finalizer added");
    }

    ctx.backoff.reset(&key);
    Ok(action)
}

/// Error policy handed to `kube::runtime::Controller::run`
pub fn error_policy<R: Reconciler>(obj: Arc<R>, err: &Error, ctx: Arc<Context>) -> Action {
    ctx.metrics.failure();
    let key = object_key(obj.as_ref());

    if err.is_transient() {
        let delay = ctx.backoff.next_delay(&key);
        warn!(
            key = %key,
            error = %err,
            attempt = ctx.backoff.failures(&key),
            ?delay,
            "Reconcile failed, retrying with backoff"
        );
        Action::requeue(delay)
    } else {
        error!(key = %key, error = %err, "Reconcile failed permanently, waiting for a spec change");
        Action::await_change()
    }
}

/// Stop forward provisioning once the owner is going away
pub async fn ensure_owner_live(ctx: &Context, owner: &OwnerKey) -> Result<()> {
    if ctx.cluster.owner_deleting(owner).await? {
        info!(owner = %owner, "Owner is being deleted, abandoning apply");
        return Err(Error::OwnerDeleting);
    }
    Ok(())
}

/// Write `desired` to the owner's status when it differs from `current`.
///
/// Fields present in `current` but cleared in `desired` are sent as `null`
/// so the merge patch removes them.
pub async fn publish_status<S>(
    ctx: &Context,
    owner: &OwnerKey,
    current: Option<&S>,
    desired: &S,
) -> Result<bool>
where
    S: Serialize + PartialEq,
{
    if current == Some(desired) {
        debug!(owner = %owner, "Status unchanged, skipping update");
        return Ok(false);
    }

    let mut patch = serde_json::to_value(desired)?;
    if let (Some(current), Value::Object(fields)) = (current, &mut patch) {
        if let Value::Object(previous) = serde_json::to_value(current)? {
            for key in previous.keys() {
                fields.entry(key.clone()).or_insert(Value::Null);
            }
        }
    }

    ctx.cluster.patch_status(owner, patch).await?;
    ctx.metrics.status_update();
    Ok(true)
}

/// Worker pool and debounce settings for `kube::runtime::Controller`
#[must_use]
pub fn controller_config(config: &ReconcileConfig) -> controller::Config {
    controller::Config::default()
        .concurrency(config.concurrency)
        .debounce(Duration::from_millis(config.debounce_ms))
}

/// RFC3339 timestamp used in conditions
#[must_use]
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
