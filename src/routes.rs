use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json,
    Router,
};
use prometheus::{Registry, TextEncoder};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    http_objects::{ReplicaIdleRequest, ReplicaStatus, RouterAPIError},
    lookup::FunctionLookup,
    data_model::FunctionRef,
};

#[derive(Clone)]
pub struct RouteState {
    pub lookup: Arc<FunctionLookup>,
    pub registry: Arc<Registry>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/system/pod-idle",
            post(replica_idle).with_state(route_state.clone()),
        )
        .route(
            "/system/pods-status",
            get(replica_statuses).with_state(route_state.clone()),
        )
        .route("/metrics", get(metrics).with_state(route_state.clone()))
        .layer(TraceLayer::new_for_http())
}

async fn index() -> &'static str {
    "Function Router"
}

/// Completion callback from the data plane: release one in-flight slot on
/// the replica that finished serving.
async fn replica_idle(
    State(state): State<RouteState>,
    payload: Result<Json<ReplicaIdleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, RouterAPIError> {
    let Json(request) = payload.map_err(|e| RouterAPIError::bad_request(&e.to_string()))?;
    if request.pod_name.is_empty() || request.pod_ip.is_empty() {
        return Err(RouterAPIError::bad_request("podName and podIP are required"));
    }

    info!(
        replica = %request.pod_name,
        ip = %request.pod_ip,
        "received idle callback"
    );
    state
        .lookup
        .mark_replica_idle(&request.pod_name, &request.pod_ip);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ReplicaStatusQuery {
    #[serde(rename = "functionName")]
    function_name: Option<String>,
    namespace: Option<String>,
}

/// Current replica records for a function, as cached by the router.
async fn replica_statuses(
    State(state): State<RouteState>,
    Query(query): Query<ReplicaStatusQuery>,
) -> Result<Json<Vec<ReplicaStatus>>, RouterAPIError> {
    let (function_name, namespace) = match (query.function_name, query.namespace) {
        (Some(function_name), Some(namespace))
            if !function_name.is_empty() && !namespace.is_empty() =>
        {
            (function_name, namespace)
        }
        _ => {
            return Err(RouterAPIError::bad_request(
                "functionName and namespace are required",
            ))
        }
    };

    let function = FunctionRef::new(&function_name, &namespace);
    let statuses = state.lookup.replica_statuses(&function).await;
    if statuses.is_empty() {
        return Err(RouterAPIError::not_found("no pods found"));
    }

    Ok(Json(statuses.into_iter().map(ReplicaStatus::from).collect()))
}

async fn metrics(State(state): State<RouteState>) -> Result<String, RouterAPIError> {
    TextEncoder::new()
        .encode_to_string(&state.registry.gather())
        .map_err(|e| RouterAPIError::internal_error(e.into()))
}
