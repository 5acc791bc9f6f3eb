mod proxy;

use crate::config::ConfigManager;
use crate::error::{Result, SupervisorError};
use crate::lifecycle::LifecycleController;
use crate::state::{ModelStateTable, ModelStatus};
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::error;

const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shared application state threaded through axum via `State`, an explicit
/// context value rather than ambient statics.
pub struct AppState {
    pub config: Arc<ConfigManager>,
    pub states: Arc<ModelStateTable>,
    pub lifecycle: Arc<LifecycleController>,
    /// Closes the race between "a caller committed to starting this model"
    /// and "state reflects `starting`".
    starting_models: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(
        config: Arc<ConfigManager>,
        states: Arc<ModelStateTable>,
        lifecycle: Arc<LifecycleController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            states,
            lifecycle,
            starting_models: Mutex::new(HashSet::new()),
        })
    }
}

pub fn gateway_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{*path}", any(handle_request))
        .route("/", any(handle_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn handle_request(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Response {
    if request.method() == axum::http::Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }

    let path = request.uri().path().to_string();
    let query = request.uri().query().map(|q| format!("?{q}"));
    let method = request.method().clone();
    let headers = request.headers().clone();

    let body_bytes = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(e) => return SupervisorError::Internal(e.to_string()).into_response(),
    };

    match route_request(&state, &method, &path, query.as_deref(), &headers, body_bytes).await {
        Ok(response) => response,
        Err(e) => {
            log_internal_error(&path, &e);
            e.into_response()
        }
    }
}

async fn route_request(
    state: &Arc<AppState>,
    method: &axum::http::Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let model_alias = extract_model_field(headers, &body)?;
    let primary_name = state.config.resolve_primary_name(&model_alias);
    let entry = state
        .config
        .model_config(&primary_name)
        .ok_or_else(|| SupervisorError::UnknownAlias(model_alias.clone()))?;

    let plugin = state
        .lifecycle
        .plugins
        .get(&entry.mode)
        .cloned()
        .ok_or_else(|| SupervisorError::Internal(format!("unsupported mode '{}'", entry.mode)))?;
    plugin.validate_request(path, &primary_name)?;

    // Must be counted before the startup-wait loop below, not after: a
    // concurrent eviction pass must see this request as in-flight for the
    // whole cold-start/health-check window, not just once routing.
    let record = state
        .states
        .get(&primary_name)
        .ok_or_else(|| SupervisorError::UnknownAlias(primary_name.clone()))?;
    record.increment_in_flight();
    let _guard = InFlightGuard { record: record.clone() };

    wait_for_routing(state, &primary_name).await?;

    let port = record
        .current_variant()
        .ok_or_else(|| SupervisorError::Internal("routing model has no active variant".to_string()))?
        .port;

    proxy::forward(port, method, path, query, headers, body).await
}

/// Startup-wait loop: coalesces concurrent callers for the same
/// stopped model onto exactly one `start_model` call.
async fn wait_for_routing(state: &Arc<AppState>, name: &str) -> Result<()> {
    loop {
        let record = state
            .states
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownAlias(name.to_string()))?;
        let status = record.status();

        if status == ModelStatus::Routing {
            return Ok(());
        }

        let locally_starting = state.starting_models.lock().contains(name);
        if status.is_startup_state() || locally_starting {
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            continue;
        }

        if matches!(status, ModelStatus::Stopped | ModelStatus::Failed) {
            state.starting_models.lock().insert(name.to_string());
            let lifecycle = state.lifecycle.clone();
            let name_owned = name.to_string();
            let result = tokio::spawn(async move { lifecycle.start_model(&name_owned).await })
                .await
                .map_err(|e| SupervisorError::Internal(e.to_string()))?;
            state.starting_models.lock().remove(name);

            if let Err(e) = result {
                return Err(e);
            }
            continue;
        }

        tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
    }
}

fn extract_model_field(headers: &HeaderMap, body: &Bytes) -> Result<String> {
    let is_json = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

    if !is_json {
        return Err(SupervisorError::MissingModelField);
    }

    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| SupervisorError::MissingModelField)?;
    value
        .get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(SupervisorError::MissingModelField)
}

/// Decrements the in-flight counter exactly once, on every exit path
/// (success, early error, or this future being dropped on client
/// disconnect), by riding Rust's `Drop` rather than a try/finally block.
struct InFlightGuard {
    record: Arc<crate::state::ModelRecord>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.record.decrement_in_flight();
    }
}

pub(crate) fn log_internal_error(context: &str, err: &SupervisorError) {
    error!(context, error = %err, "gateway request failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_field_is_rejected() {
        let headers = HeaderMap::new();
        let body = Bytes::from_static(b"{}");
        let err = extract_model_field(&headers, &body).unwrap_err();
        assert!(matches!(err, SupervisorError::MissingModelField));
    }

    #[test]
    fn model_field_is_extracted_from_json_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            "application/json".parse().unwrap(),
        );
        let body = Bytes::from_static(br#"{"model":"m","messages":[]}"#);
        assert_eq!(extract_model_field(&headers, &body).unwrap(), "m");
    }
}
