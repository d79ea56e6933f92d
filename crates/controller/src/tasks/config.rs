//! Controller Configuration
//!
//! Loaded from the YAML file mounted into the controller pod. Every section has
//! defaults so a missing or partial file still yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default location of the mounted configuration
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Namespace to watch; all namespaces when unset
    #[serde(default)]
    pub watch_namespace: Option<String>,

    /// Field manager used for server-side apply
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Reconcile loop tuning
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Runner pool settings
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Reconcile loop tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// Maximum concurrent reconciles per controller
    #[serde(default = "default_concurrency")]
    pub concurrency: u16,

    /// Window used to coalesce bursts of events for one key
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// First retry delay after a transient failure
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: u64,

    /// Upper bound for the retry delay
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_seconds: u64,

    /// Timeout for each cluster API call
    #[serde(default = "default_api_timeout")]
    pub api_timeout_seconds: u64,

    /// Requeue interval once everything is converged
    #[serde(default = "default_resync")]
    pub resync_seconds: u64,

    /// Requeue interval while sub-resources are still rolling out
    #[serde(default = "default_progress")]
    pub progress_seconds: u64,
}

/// Runner pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Image of the privileged helper container
    #[serde(default = "default_build_agent_image")]
    pub build_agent_image: String,

    /// Image used by the helper for one-shot builds
    #[serde(default = "default_builder_image")]
    pub builder_image: String,

    /// Timeout for a single token exchange
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_seconds: u64,

    /// Bound on de-registration before deletion proceeds anyway
    #[serde(default = "default_deregistration_timeout")]
    pub deregistration_timeout_seconds: u64,
}

fn default_field_manager() -> String {
    "kindling-controller".to_string()
}

fn default_concurrency() -> u16 {
    4
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_ceiling() -> u64 {
    300
}

fn default_api_timeout() -> u64 {
    30
}

fn default_resync() -> u64 {
    300
}

fn default_progress() -> u64 {
    15
}

fn default_build_agent_image() -> String {
    "ghcr.io/5dlabs/kindling-build-agent:latest".to_string()
}

fn default_builder_image() -> String {
    "gcr.io/kaniko-project/executor:latest".to_string()
}

fn default_exchange_timeout() -> u64 {
    15
}

fn default_deregistration_timeout() -> u64 {
    120
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            debounce_ms: default_debounce_ms(),
            backoff_base_seconds: default_backoff_base(),
            backoff_ceiling_seconds: default_backoff_ceiling(),
            api_timeout_seconds: default_api_timeout(),
            resync_seconds: default_resync(),
            progress_seconds: default_progress(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            build_agent_image: default_build_agent_image(),
            builder_image: default_builder_image(),
            exchange_timeout_seconds: default_exchange_timeout(),
            deregistration_timeout_seconds: default_deregistration_timeout(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            field_manager: default_field_manager(),
            reconcile: ReconcileConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl ReconcileConfig {
    #[must_use]
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    #[must_use]
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    #[must_use]
    pub fn progress(&self) -> Duration {
        Duration::from_secs(self.progress_seconds)
    }
}

impl RunnerConfig {
    #[must_use]
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_seconds)
    }

    #[must_use]
    pub fn deregistration_timeout(&self) -> Duration {
        Duration::from_secs(self.deregistration_timeout_seconds)
    }
}

impl ControllerConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.field_manager.trim().is_empty() {
            return Err(anyhow::anyhow!("fieldManager must not be empty"));
        }
        if self.reconcile.concurrency == 0 {
            return Err(anyhow::anyhow!("reconcile.concurrency must be at least 1"));
        }
        if self.reconcile.backoff_base_seconds == 0 {
            return Err(anyhow::anyhow!(
                "reconcile.backoffBaseSeconds must be at least 1"
            ));
        }
        if self.reconcile.backoff_base_seconds > self.reconcile.backoff_ceiling_seconds {
            return Err(anyhow::anyhow!(
                "reconcile.backoffBaseSeconds ({}) exceeds backoffCeilingSeconds ({})",
                self.reconcile.backoff_base_seconds,
                self.reconcile.backoff_ceiling_seconds
            ));
        }
        if self.reconcile.api_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "reconcile.apiTimeoutSeconds must be at least 1"
            ));
        }
        if self.runner.build_agent_image.trim().is_empty() {
            return Err(anyhow::anyhow!("runner.buildAgentImage must be set"));
        }
        if self.runner.builder_image.trim().is_empty() {
            return Err(anyhow::anyhow!("runner.builderImage must be set"));
        }
        if self.runner.exchange_timeout_seconds > self.runner.deregistration_timeout_seconds {
            return Err(anyhow::anyhow!(
                "runner.exchangeTimeoutSeconds must not exceed deregistrationTimeoutSeconds"
            ));
        }
        Ok(())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }

    /// Path of the configuration file, honouring `KINDLING_CONFIG_PATH`
    #[must_use]
    pub fn config_path() -> String {
        std::env::var("KINDLING_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }
}
