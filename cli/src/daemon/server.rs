// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon HTTP server implementation

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use baton_core::{
    application::CoordinatorHandle,
    domain::{
        config::MetricsConfig,
        error::SchedulerError,
        job::{JobId, JobRequest},
        repository::HandoffRepository,
    },
    infrastructure::{event_bus::EventBusError, metrics},
};

use super::{remove_pid_file, write_pid_file};
use crate::embedded::EmbeddedCoordinator;

pub async fn start_daemon(config_path: Option<PathBuf>, host: String, port: u16) -> Result<()> {
    let pid = std::process::id();
    write_pid_file(pid)?;
    let _guard = PidFileGuard;

    info!("Baton daemon starting (PID: {})", pid);

    let embedded = EmbeddedCoordinator::new(config_path).await?;
    let config = embedded.config();
    info!(
        "Configuration loaded: {} ({} executor commands)",
        config.metadata.name,
        config.spec.executors.commands.len()
    );

    let metrics_config = &config.spec.observability.metrics;
    if metrics_config.enabled {
        install_metrics_exporter(&config.spec.network.bind_address, metrics_config)?;
    }

    let state = AppState::new(embedded.handle().clone(), embedded.handoffs());
    let stop = state.stop.clone();
    let app = app(state);

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Daemon listening on {}", addr);

    let coordinator = embedded.handle().clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Winding down running jobs before stopping the API");
            coordinator.shutdown().await;
            stop.send_replace(true);
        })
        .await
        .context("HTTP server failed")?;

    info!("Daemon shutting down");

    Ok(())
}

fn install_metrics_exporter(bind_address: &str, config: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, config.port)
        .parse()
        .with_context(|| format!("Invalid metrics address {}:{}", bind_address, config.port))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    metrics::describe_metrics();
    info!("Prometheus metrics exported on {}", addr);
    Ok(())
}

struct PidFileGuard;

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = remove_pid_file();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

// Application state
#[derive(Clone)]
pub struct AppState {
    coordinator: CoordinatorHandle,
    handoffs: Arc<dyn HandoffRepository>,
    start_time: std::time::Instant,
    /// Set once the coordinator has stopped; ends open event streams.
    stop: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(coordinator: CoordinatorHandle, handoffs: Arc<dyn HandoffRepository>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            coordinator,
            handoffs,
            start_time: std::time::Instant::now(),
            stop: Arc::new(stop),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/jobs", post(submit_job_handler).get(list_jobs_handler))
        .route("/api/jobs/{job_id}", get(get_job_handler))
        .route("/api/jobs/{job_id}/cancel", post(cancel_job_handler))
        .route("/api/jobs/{job_id}/handoff", get(get_handoff_handler))
        .route("/api/events", get(stream_events_handler))
        .with_state(Arc::new(state))
}

/// JSON error body with the status derived from the scheduler error.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            SchedulerError::JobNotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::JobAlreadyRunning(_) | SchedulerError::JobAlreadyFinished { .. } => {
                StatusCode::CONFLICT
            }
            SchedulerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SchedulerError::CoordinatorStopped => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API error: {}", self.message);
        }
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::from_string(raw).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid job id '{}': {}", raw, e)))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = if state.coordinator.is_stopped() {
        "stopping"
    } else {
        "healthy"
    };
    Json(serde_json::json!({
        "status": status,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "locks_held": state.coordinator.locks().len(),
    }))
}

async fn submit_job_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.coordinator.submit(request)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "job_id": job_id }))))
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.coordinator.list().await?))
}

async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.coordinator.status(job_id).await?))
}

async fn cancel_job_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state.coordinator.cancel(job_id).await?;
    Ok(Json(serde_json::json!({ "job_id": job_id, "cancelled": true })))
}

/// Finalized handoff, from the live coordinator or from the handoff store for jobs
/// that ran under an earlier daemon.
async fn get_handoff_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    match state.coordinator.status(job_id).await {
        Ok(status) => match status.handoff {
            Some(handoff) if handoff.is_final() => return Ok(Json(handoff)),
            _ => {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    format!("job {} has not finished ({})", job_id, status.state),
                ))
            }
        },
        Err(SchedulerError::JobNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    match state.handoffs.find_by_job(job_id).await {
        Ok(Some(handoff)) => Ok(Json(handoff)),
        Ok(None) => Err(SchedulerError::JobNotFound(job_id).into()),
        Err(e) => Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    job_id: Option<String>,
}

async fn stream_events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let filter = query.job_id.as_deref().map(parse_job_id).transpose()?;
    let receiver = state.coordinator.event_bus().subscribe();
    let stopped = state.stop.subscribe();

    let events = stream::unfold((receiver, stopped), move |(mut receiver, mut stopped)| async move {
        loop {
            if *stopped.borrow() {
                return None;
            }
            let next = tokio::select! {
                next = receiver.recv() => next,
                changed = stopped.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => return None,
                },
            };
            match next {
                Ok(event) if filter.is_some_and(|id| id != event.job_id()) => continue,
                Ok(event) => {
                    let name = serde_json::to_value(&event)
                        .ok()
                        .and_then(|v| v["type"].as_str().map(str::to_string))
                        .unwrap_or_else(|| "job_event".to_string());
                    let sse = match Event::default().event(name).json_data(&event) {
                        Ok(sse) => sse,
                        Err(e) => {
                            warn!("Failed to encode job event: {}", e);
                            continue;
                        }
                    };
                    return Some((Ok(sse), (receiver, stopped)));
                }
                Err(EventBusError::Lagged(skipped)) => {
                    let notice = Event::default().event("lagged").data(skipped.to_string());
                    return Some((Ok(notice), (receiver, stopped)));
                }
                Err(_) => return None,
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
