//! Shared fixtures for reconcile tests

use crate::tasks::cluster::memory::MemoryCluster;
use crate::tasks::config::ControllerConfig;
use crate::tasks::dependencies::credentials::testing::SequentialCredentials;
use crate::tasks::dependencies::credentials::CredentialSource;
use crate::tasks::engine::backoff::BackoffTracker;
use crate::tasks::engine::metrics::ReconcileMetrics;
use crate::tasks::runner::registry::MockRunnerRegistry;
use crate::tasks::runner::state::RegistrationLedger;
use crate::tasks::types::Context;
use std::sync::Arc;
use std::time::Duration;

fn build(
    cluster: Arc<MemoryCluster>,
    registry: MockRunnerRegistry,
    credentials: Arc<dyn CredentialSource>,
) -> Context {
    let config = ControllerConfig::default();
    Context {
        cluster,
        backoff: Arc::new(BackoffTracker::new(
            Duration::from_secs(config.reconcile.backoff_base_seconds),
            Duration::from_secs(config.reconcile.backoff_ceiling_seconds),
        )),
        config: Arc::new(config),
        runner_api: Arc::new(registry),
        registrations: Arc::new(RegistrationLedger::new()),
        credentials,
        metrics: Arc::new(ReconcileMetrics::default()),
    }
}

/// Context for environment tests; any call to the runner API fails the test
pub fn context_with(
    cluster: Arc<MemoryCluster>,
    credentials: Arc<dyn CredentialSource>,
) -> Context {
    build(cluster, MockRunnerRegistry::new(), credentials)
}

/// Context for runner pool tests
pub fn context_with_registry(cluster: Arc<MemoryCluster>, registry: MockRunnerRegistry) -> Context {
    build(cluster, registry, Arc::new(SequentialCredentials::default()))
}
