/*
 * Kindling - Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Controller Service - Kubernetes controller for `DevStagingEnvironment`
//! and `GithubActionRunnerPool` CRDs
//!
//! This service:
//! - Watches both descriptor kinds and every sub-resource they own
//! - Converges Deployments, Services, Ingresses, Secrets and runner RBAC
//! - Exchanges runner registration and removal tokens with the CI platform
//! - Serves health, readiness and reconcile counters over HTTP

use axum::{extract::State, response::Json, routing::get, Router};
use kindling_controller::{run_task_controller, ControllerConfig, ReconcileMetrics};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone)]
struct AppState {
    metrics: Arc<ReconcileMetrics>,
    controllers_running: Arc<AtomicBool>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kindling_controller=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load_controller_config() -> ControllerConfig {
    let config_path = ControllerConfig::config_path();

    let config = if Path::new(&config_path).exists() {
        match ControllerConfig::from_mounted_file(&config_path) {
            Ok(cfg) => {
                info!("Loaded controller configuration from {}", config_path);
                cfg
            }
            Err(err) => {
                warn!(
                    "Failed to load configuration from {}: {}. Using defaults.",
                    config_path, err
                );
                ControllerConfig::default()
            }
        }
    } else {
        warn!("No configuration at {}, using defaults", config_path);
        ControllerConfig::default()
    };

    if let Err(e) = config.validate() {
        warn!("Configuration is invalid ({}), using defaults", e);
        return ControllerConfig::default();
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting kindling controller service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(load_controller_config());

    let mut kube_config = kube::Config::infer().await?;
    kube_config.connect_timeout = Some(Duration::from_secs(10));
    kube_config.read_timeout = Some(config.reconcile.api_timeout());
    let client = kube::Client::try_from(kube_config)?;
    info!("Connected to Kubernetes cluster");

    let metrics = Arc::new(ReconcileMetrics::default());
    let controllers_running = Arc::new(AtomicBool::new(true));

    let controller_handle = {
        let client = client.clone();
        let config = config.clone();
        let metrics = metrics.clone();
        let running = controllers_running.clone();
        tokio::spawn(async move {
            if let Err(e) = run_task_controller(client, config, metrics).await {
                error!("Controller error: {}", e);
            }
            running.store(false, Ordering::SeqCst);
        })
    };

    let state = AppState {
        metrics,
        controllers_running,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("Controller HTTP server listening on 0.0.0.0:8080");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("Controller service stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "kindling-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<Value>, axum::http::StatusCode> {
    if !state.controllers_running.load(Ordering::SeqCst) {
        return Err(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "kindling-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn metrics_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "kindling-controller",
        "version": env!("CARGO_PKG_VERSION"),
        "reconcile": state.metrics.snapshot(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
