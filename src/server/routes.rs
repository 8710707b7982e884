//! Axum route handlers for the capability runtime HTTP server.
//!
//! # Routes
//!
//! - `GET  /health`                        - Liveness check
//! - `GET  /capabilities?category=&tag=&caller=` - List descriptors (`tag` is comma-separated)
//! - `GET  /capabilities/search?q=`        - Case-insensitive search
//! - `GET  /capabilities/stats`            - Registry statistics
//! - `GET  /capabilities/:name`            - Descriptor, versions and input schema
//! - `POST /capabilities/:name/execute`    - Run a capability
//! - `POST /capabilities/:name/reload`     - Hot-reload a capability
//! - `GET  /metrics`                       - Metrics for every capability
//! - `GET  /metrics/:name`                 - Metrics and circuit state for one capability
//! - `GET  /tools?caller=`                 - Function-calling tool descriptors

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::capabilities::{
    CallerClass, CapabilityDescriptor, Category, ExecutionContext, ListFilter, Registration,
    RegistryError, RegistryStatistics,
};
use crate::config::RuntimeConfig;
use crate::executor::{ExecuteOptions, ExecutionError, ExecutionResult, MetricsSnapshot};
use crate::runtime::RuntimeContext;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeContext>,
}

impl AppState {
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self { runtime }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Arc::new(RuntimeContext::new(RuntimeConfig::default())))
    }
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/capabilities", get(list_handler))
        .route("/capabilities/search", get(search_handler))
        .route("/capabilities/stats", get(stats_handler))
        .route("/capabilities/:name", get(get_capability_handler))
        .route("/capabilities/:name/execute", post(execute_handler))
        .route("/capabilities/:name/reload", post(reload_handler))
        .route("/metrics", get(all_metrics_handler))
        .route("/metrics/:name", get(metrics_handler))
        .route("/tools", get(tools_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health - liveness check.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "capability-runtime",
        "capabilities": state.runtime.registry().len(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    category: Option<String>,
    tag: Option<String>,
    caller: Option<String>,
}

impl ListQuery {
    fn into_filter(self) -> Result<ListFilter, ApiError> {
        let category = self
            .category
            .map(|c| c.parse::<Category>())
            .transpose()
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
        let allowed_caller = parse_caller(self.caller)?;
        let tags = self
            .tag
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ListFilter {
            category,
            tags,
            allowed_caller,
        })
    }
}

fn parse_caller(caller: Option<String>) -> Result<Option<CallerClass>, ApiError> {
    caller
        .map(|c| c.parse::<CallerClass>())
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))
}

/// GET /capabilities - descriptors sorted by (category, name).
async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<CapabilityDescriptor>>, ApiError> {
    let filter = query.into_filter()?;
    Ok(Json(state.runtime.registry().list(&filter)))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

/// GET /capabilities/search?q=
async fn search_handler(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<CapabilityDescriptor>> {
    Json(state.runtime.registry().search(&query.q))
}

/// GET /capabilities/stats
async fn stats_handler(State(state): State<AppState>) -> Json<RegistryStatistics> {
    Json(state.runtime.registry().statistics())
}

/// GET /capabilities/:name - accepts a canonical name or a legacy alias.
async fn get_capability_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let registry = state.runtime.registry();
    let capability = registry
        .get(&name)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Capability not found: {}", name)))?;
    let descriptor = capability.descriptor();
    Ok(Json(json!({
        "descriptor": descriptor,
        "versions": registry.versions(&descriptor.name),
        "input_schema": capability.input_schema(),
    })))
}

/// Body of `POST /capabilities/:name/execute`.
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub input: Value,
    pub use_cache: Option<bool>,
    pub caller_id: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry_count: Option<u32>,
    pub context: Option<ExecutionContext>,
}

impl ExecuteRequest {
    fn into_parts(self) -> (Value, ExecuteOptions) {
        let options = ExecuteOptions {
            use_cache: self.use_cache.unwrap_or(true),
            caller_id: self.caller_id,
            timeout_override: self.timeout_ms.map(Duration::from_millis),
            retry_count: self.retry_count.unwrap_or(0),
            context: self.context.unwrap_or_default(),
        };
        let input = if self.input.is_null() {
            json!({})
        } else {
            self.input
        };
        (input, options)
    }
}

/// POST /capabilities/:name/execute - 200 with the structured result,
/// 404 when the capability does not exist.
async fn execute_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> (StatusCode, Json<ExecutionResult>) {
    let (input, options) = request.into_parts();
    let result = state.runtime.execute(&name, input, options).await;
    let status = match &result.error {
        Some(ExecutionError::NotFound { .. }) => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    (status, Json(result))
}

/// POST /capabilities/:name/reload
async fn reload_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.runtime.registry().reload(&name).await {
        Ok(outcome) => Ok(Json(json!({
            "name": name,
            "status": match outcome {
                Registration::Registered => "reloaded",
                Registration::Unchanged => "unchanged",
            },
        }))),
        Err(RegistryError::NotFound(_)) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Capability not found: {}", name),
        )),
        Err(e) => {
            tracing::error!("Reload of {} failed: {}", name, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// GET /metrics
async fn all_metrics_handler(State(state): State<AppState>) -> Json<Vec<MetricsSnapshot>> {
    Json(state.runtime.executor().all_metrics())
}

/// GET /metrics/:name - metrics (null before the first call) and circuit state.
async fn metrics_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let executor = state.runtime.executor();
    let metrics = executor.metrics(&name);
    if metrics.is_none() && !state.runtime.registry().has(&name) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Capability not found: {}", name),
        ));
    }
    Ok(Json(json!({
        "metrics": metrics,
        "circuit": executor.circuit_state(&name),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct ToolsQuery {
    caller: Option<String>,
}

/// GET /tools?caller= - function-calling tool shapes.
async fn tools_handler(
    State(state): State<AppState>,
    Query(query): Query<ToolsQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let registry = state.runtime.registry();
    let tools = match parse_caller(query.caller)? {
        Some(caller) => registry.tools_for_caller(caller),
        None => registry.tool_descriptors(),
    };
    Ok(Json(tools.iter().map(|t| t.to_function_tool()).collect()))
}
