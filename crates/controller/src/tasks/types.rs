use crate::tasks::cluster::Cluster;
use crate::tasks::config::ControllerConfig;
use crate::tasks::dependencies::credentials::CredentialSource;
use crate::tasks::engine::backoff::BackoffTracker;
use crate::tasks::engine::metrics::ReconcileMetrics;
use crate::tasks::runner::registry::{RunnerApiError, RunnerRegistry};
use crate::tasks::runner::state::RegistrationLedger;
use std::sync::Arc;
use std::time::Duration;

/// Finalizer guarding `DevStagingEnvironment` teardown
pub const ENVIRONMENT_FINALIZER_NAME: &str = "environments.apps.example.com/cleanup";

/// Finalizer guarding runner de-registration
pub const RUNNER_POOL_FINALIZER_NAME: &str = "runnerpools.apps.example.com/deregister";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid spec: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Object is missing a name or uid")]
    MissingObjectKey,

    #[error("Runner API error: {0}")]
    RunnerApi(#[from] RunnerApiError),

    #[error("{operation} timed out after {after:?}")]
    Timeout { after: Duration, operation: String },

    #[error("Pod exec failed: {0}")]
    Exec(String),

    #[error("Owner is being deleted")]
    OwnerDeleting,

    #[error("Concurrent update: {0}")]
    Conflict(String),

    #[error("Waiting: {0}")]
    Pending(String),
}

impl Error {
    /// Transient errors are retried with backoff; the rest wait for a spec change
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ValidationError(_) | Self::ConfigError(_) | Self::MissingObjectKey => false,
            Self::SerializationError(_) => false,
            Self::RunnerApi(e) => e.is_transient(),
            Self::KubeError(kube::Error::Api(ae)) => !matches!(ae.code, 400 | 422),
            Self::KubeError(_)
            | Self::Timeout { .. }
            | Self::Exec(_)
            | Self::OwnerDeleting
            | Self::Conflict(_)
            | Self::Pending(_) => true,
        }
    }

    /// Short machine-readable reason used in conditions
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::KubeError(_) => "ApiError",
            Self::SerializationError(_) => "SerializationError",
            Self::ValidationError(_) => "InvalidSpec",
            Self::ConfigError(_) => "ConfigError",
            Self::MissingObjectKey => "MissingObjectKey",
            Self::RunnerApi(_) => "RunnerApiError",
            Self::Timeout { .. } => "Timeout",
            Self::Exec(_) => "ExecFailed",
            Self::OwnerDeleting => "OwnerDeleting",
            Self::Conflict(_) => "Conflict",
            Self::Pending(_) => "Pending",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to every reconcile
#[derive(Clone)]
pub struct Context {
    pub cluster: Arc<dyn Cluster>,
    pub config: Arc<ControllerConfig>,
    pub backoff: Arc<BackoffTracker>,
    pub runner_api: Arc<dyn RunnerRegistry>,
    pub registrations: Arc<RegistrationLedger>,
    pub credentials: Arc<dyn CredentialSource>,
    pub metrics: Arc<ReconcileMetrics>,
}
