//! # Simhospital Dashboard
//!
//! HTTP control surface for a running simulation.
//!
//! Handles:
//! - Read-only views of the pathway catalog and of pathway instances
//! - Commands: ad-hoc pathway start, pause/resume of arrivals, graceful shutdown
//! - Prometheus metrics and the OpenAPI document
//!
//! Every handler goes through [`RunnerHandle`]; nothing here touches the engine directly.

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simhospital_core::executor::{InstanceInfo, InstanceStatus};
use simhospital_core::metrics::SimMetrics;
use simhospital_core::runner::{PathwaySummary, RunnerError, RunnerHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};

#[derive(Clone)]
struct DashboardState {
    runner: RunnerHandle,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub status: String,
    pub paused: bool,
    pub running_instances: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PathwayRes {
    pub name: String,
    pub steps: usize,
    pub looping: bool,
    pub eligible: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListPathwaysRes {
    pub pathways: Vec<PathwayRes>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InstanceRes {
    pub id: u64,
    pub pathway: String,
    /// One of `scheduled`, `running`, `completed`, `aborted`.
    pub status: String,
    pub step: usize,
    pub mrn: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub messages_sent: usize,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListInstancesRes {
    pub instances: Vec<InstanceRes>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StartPathwayRes {
    pub instance_id: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CommandRes {
    pub accepted: bool,
    pub paused: bool,
}

fn status_label(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Scheduled => "scheduled",
        InstanceStatus::Running => "running",
        InstanceStatus::Completed => "completed",
        InstanceStatus::Aborted => "aborted",
    }
}

impl From<InstanceInfo> for InstanceRes {
    fn from(info: InstanceInfo) -> Self {
        Self {
            id: info.id.value(),
            pathway: info.pathway,
            status: status_label(info.status).to_string(),
            step: info.step,
            mrn: info.mrn.map(|mrn| mrn.to_string()),
            started_at: info.started_at,
            finished_at: info.finished_at,
            messages_sent: info.messages_sent,
            error: info.error,
        }
    }
}

impl From<&PathwaySummary> for PathwayRes {
    fn from(summary: &PathwaySummary) -> Self {
        Self {
            name: summary.name.clone(),
            steps: summary.steps,
            looping: summary.looping,
            eligible: summary.eligible,
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        list_pathways,
        list_instances,
        start_pathway,
        pause,
        resume,
        shutdown,
        metrics,
    ),
    components(schemas(
        HealthRes,
        PathwayRes,
        ListPathwaysRes,
        InstanceRes,
        ListInstancesRes,
        StartPathwayRes,
        CommandRes,
    ))
)]
pub struct ApiDoc;

/// Builds the dashboard router.
///
/// Routes are mounted under `base_uri` (for example `/simulated-hospital`). An empty base or
/// `/` mounts them at the root.
pub fn router(runner: RunnerHandle, base_uri: &str) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/pathways", get(list_pathways))
        .route("/pathways/:name/start", post(start_pathway))
        .route("/instances", get(list_instances))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/shutdown", post(shutdown))
        .route("/metrics", get(metrics))
        .route("/api-docs/openapi.json", get(openapi))
        .with_state(DashboardState { runner });

    let base = base_uri.trim_end_matches('/');
    let app = if base.is_empty() {
        routes
    } else if base.starts_with('/') {
        Router::new().nest(base, routes)
    } else {
        Router::new().nest(&format!("/{base}"), routes)
    };
    app.layer(CorsLayer::permissive())
}

/// Builds the standalone Prometheus router: `GET /metrics` at the root, for scrapers pointed
/// at a dedicated metrics address.
pub fn metrics_router(metrics: SimMetrics) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics)
}

/// Serves `app` on `listener` until `cancel` fires.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

fn stopped(err: RunnerError) -> (StatusCode, &'static str) {
    tracing::warn!(error = %err, "dashboard command rejected");
    (StatusCode::SERVICE_UNAVAILABLE, "Simulation is not running")
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint
///
/// Reports whether automatic arrivals are paused and how many instances are running.
async fn health(State(state): State<DashboardState>) -> Json<HealthRes> {
    let running_instances = state
        .runner
        .instances()
        .iter()
        .filter(|i| i.status == InstanceStatus::Running)
        .count();
    Json(HealthRes {
        status: "ok".into(),
        paused: state.runner.is_paused(),
        running_instances,
    })
}

#[utoipa::path(
    get,
    path = "/pathways",
    responses(
        (status = 200, description = "Every pathway in the catalog", body = ListPathwaysRes)
    )
)]
/// List the pathway catalog
///
/// `eligible` marks pathways that pass the configured include/exclude filters and can be
/// started automatically. Any listed pathway can be started on demand.
async fn list_pathways(State(state): State<DashboardState>) -> Json<ListPathwaysRes> {
    Json(ListPathwaysRes {
        pathways: state.runner.pathways().iter().map(PathwayRes::from).collect(),
    })
}

#[utoipa::path(
    get,
    path = "/instances",
    responses(
        (status = 200, description = "Live and recently finished instances", body = ListInstancesRes)
    )
)]
/// List pathway instances
///
/// # Returns
/// * `Json<ListInstancesRes>` - Live instances plus the most recently finished ones, by id
async fn list_instances(State(state): State<DashboardState>) -> Json<ListInstancesRes> {
    Json(ListInstancesRes {
        instances: state
            .runner
            .instances()
            .into_iter()
            .map(InstanceRes::from)
            .collect(),
    })
}

#[utoipa::path(
    post,
    path = "/pathways/{name}/start",
    params(
        ("name" = String, Path, description = "Pathway name")
    ),
    responses(
        (status = 201, description = "Instance started", body = StartPathwayRes),
        (status = 404, description = "Unknown pathway"),
        (status = 503, description = "Simulation is not running")
    )
)]
/// Start one instance of a pathway now
///
/// Filters do not apply: any catalog pathway can be started this way.
///
/// # Returns
/// * `Ok((StatusCode::CREATED, Json<StartPathwayRes>))` - Id of the new instance
/// * `Err((StatusCode, &str))` - Unknown pathway, or the runner has stopped
async fn start_pathway(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<StartPathwayRes>), (StatusCode, &'static str)> {
    match state.runner.start_pathway(&name).await {
        Ok(id) => {
            tracing::info!(pathway = %name, instance = %id, "pathway started from dashboard");
            Ok((
                StatusCode::CREATED,
                Json(StartPathwayRes {
                    instance_id: id.value(),
                }),
            ))
        }
        Err(RunnerError::UnknownPathway(_)) => Err((StatusCode::NOT_FOUND, "Unknown pathway")),
        Err(err) => Err(stopped(err)),
    }
}

#[utoipa::path(
    post,
    path = "/pause",
    responses(
        (status = 200, description = "Automatic arrivals paused", body = CommandRes),
        (status = 503, description = "Simulation is not running")
    )
)]
/// Pause automatic pathway arrivals
async fn pause(
    State(state): State<DashboardState>,
) -> Result<Json<CommandRes>, (StatusCode, &'static str)> {
    state.runner.pause().await.map_err(stopped)?;
    Ok(Json(CommandRes {
        accepted: true,
        paused: true,
    }))
}

#[utoipa::path(
    post,
    path = "/resume",
    responses(
        (status = 200, description = "Automatic arrivals resumed", body = CommandRes),
        (status = 503, description = "Simulation is not running")
    )
)]
async fn resume(
    State(state): State<DashboardState>,
) -> Result<Json<CommandRes>, (StatusCode, &'static str)> {
    state.runner.resume().await.map_err(stopped)?;
    Ok(Json(CommandRes {
        accepted: true,
        paused: false,
    }))
}

#[utoipa::path(
    post,
    path = "/shutdown",
    responses(
        (status = 202, description = "Graceful shutdown started", body = CommandRes),
        (status = 503, description = "Simulation is not running")
    )
)]
/// Request a graceful shutdown
///
/// Responds as soon as the runner accepts the request. Running instances are cancelled and
/// the sender is closed after they exit.
async fn shutdown(
    State(state): State<DashboardState>,
) -> Result<(StatusCode, Json<CommandRes>), (StatusCode, &'static str)> {
    state.runner.shutdown().await.map_err(stopped)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandRes {
            accepted: true,
            paused: state.runner.is_paused(),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus text exposition", body = String, content_type = "text/plain"),
        (status = 500, description = "Internal server error")
    )
)]
async fn metrics(
    State(state): State<DashboardState>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    render_metrics(state.runner.metrics())
}

async fn scrape(
    State(metrics): State<SimMetrics>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    render_metrics(&metrics)
}

fn render_metrics(
    metrics: &SimMetrics,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    match metrics.render() {
        Ok((content_type, body)) => Ok(([(header::CONTENT_TYPE, content_type)], body)),
        Err(e) => {
            tracing::error!("Metrics encoding error: {:?}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
    }
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
