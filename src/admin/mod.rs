use crate::error::{Result, SupervisorError};
use crate::gateway::AppState;
use crate::state::ModelStatus;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/devices/info", get(devices_info))
        .route("/v1/models", get(list_models))
        .route("/api/models/{alias}/info", get(model_info))
        .route("/api/models/{alias}/start", post(start_model))
        .route("/api/models/{alias}/stop", post(stop_model))
        .route("/api/models/stop-all", post(stop_all))
        .route("/api/models/{alias}/logs/stream", get(stream_logs))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    running_models: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let running_models = state
        .states
        .all()
        .filter(|r| r.status() == ModelStatus::Routing)
        .count();
    Json(HealthBody {
        status: "healthy",
        running_models,
    })
}

async fn devices_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.lifecycle.devices.snapshot())
}

#[derive(Serialize)]
struct ModelListEntry {
    id: String,
    object: &'static str,
    mode: String,
}

#[derive(Serialize)]
struct ModelListBody {
    object: &'static str,
    data: Vec<ModelListEntry>,
}

async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data = state
        .config
        .model_entries()
        .map(|(name, entry)| ModelListEntry {
            id: name,
            object: "model",
            mode: entry.mode.clone(),
        })
        .collect();
    Json(ModelListBody {
        object: "list",
        data,
    })
}

#[derive(Serialize)]
struct ModelStandardInfo {
    status: ModelStatus,
    pid: Option<u32>,
    last_access: Option<i64>,
    failure_reason: Option<String>,
    mode: String,
    pending_requests: usize,
    port: u16,
    aliases: Vec<String>,
}

#[derive(Serialize)]
struct DebugInfo {
    model_name: String,
    queried_alias: String,
    active_variant: Option<crate::config::RunConfig>,
    process_alive: bool,
}

#[derive(Serialize)]
struct ModelInfoBody {
    success: bool,
    model: ModelStandardInfo,
    node_debug_info: DebugInfo,
}

async fn model_info(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> Result<impl IntoResponse> {
    let primary_name = state.config.resolve_primary_name(&alias);
    let entry = state
        .config
        .model_config(&primary_name)
        .ok_or_else(|| SupervisorError::UnknownAlias(alias.clone()))?;
    let record = state
        .states
        .get(&primary_name)
        .ok_or_else(|| SupervisorError::UnknownAlias(alias.clone()))?;
    let fields = record.fields();

    Ok(Json(ModelInfoBody {
        success: true,
        model: ModelStandardInfo {
            status: fields.status,
            pid: fields.pid,
            last_access: fields.last_access,
            failure_reason: fields.failure_reason,
            mode: entry.mode.clone(),
            pending_requests: record.in_flight(),
            port: entry.port,
            aliases: entry.aliases_or_default(&primary_name),
        },
        node_debug_info: DebugInfo {
            model_name: primary_name.clone(),
            queried_alias: alias,
            active_variant: record.current_variant(),
            process_alive: state.lifecycle.process.alive(&primary_name),
        },
    }))
}

#[derive(Serialize)]
struct ActionResult {
    success: bool,
    message: String,
}

async fn start_model(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> Result<impl IntoResponse> {
    let primary_name = state.config.resolve_primary_name(&alias);
    state
        .config
        .model_config(&primary_name)
        .ok_or_else(|| SupervisorError::UnknownAlias(alias.clone()))?;

    match state.lifecycle.start_model(&primary_name).await {
        Ok(()) => Ok(Json(ActionResult {
            success: true,
            message: format!("model '{primary_name}' is routing"),
        })),
        Err(e) => Ok(Json(ActionResult {
            success: false,
            message: e.to_string(),
        })),
    }
}

async fn stop_model(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> Result<impl IntoResponse> {
    let primary_name = state.config.resolve_primary_name(&alias);
    state
        .config
        .model_config(&primary_name)
        .ok_or_else(|| SupervisorError::UnknownAlias(alias.clone()))?;

    match state.lifecycle.stop_model(&primary_name, "user requested").await {
        Ok(()) => Ok(Json(ActionResult {
            success: true,
            message: format!("model '{primary_name}' stopped"),
        })),
        Err(e) => Ok(Json(ActionResult {
            success: false,
            message: e.to_string(),
        })),
    }
}

async fn stop_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.lifecycle.stop_all().await;
    Json(ActionResult {
        success: true,
        message: "all models stopped".to_string(),
    })
}

/// Subscribes to this model's log multiplexer and streams lines until the
/// client disconnects, at which point the broadcast receiver is dropped and
/// implicitly unsubscribes -- no explicit unsubscribe call needed the way
/// the reference callback-based implementation requires, since Rust's
/// `Drop` does that for us.
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> Result<impl IntoResponse> {
    let primary_name = state.config.resolve_primary_name(&alias);
    state
        .config
        .model_config(&primary_name)
        .ok_or_else(|| SupervisorError::UnknownAlias(alias.clone()))?;

    let receiver = state
        .lifecycle
        .subscribe_logs(&primary_name)
        .ok_or_else(|| SupervisorError::Internal("model has no active log stream".to_string()))?;

    let lines = stream::unfold(receiver, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(line) => {
                    let chunk: std::result::Result<String, std::io::Error> =
                        Ok(format!("{line}\n"));
                    return Some((chunk, rx));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let response = axum::response::Response::builder()
        .header(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(lines))
        .map_err(|e| SupervisorError::Internal(e.to_string()))?;
    Ok(response)
}
