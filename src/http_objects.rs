use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::data_model::{epoch_time_in_ms, ReplicaRecord};

#[derive(Debug, Serialize, Deserialize)]
pub struct RouterAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl RouterAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }
}

impl IntoResponse for RouterAPIError {
    fn into_response(self) -> Response {
        tracing::error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

/// Completion callback body: the replica that finished serving a request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaIdleRequest {
    pub pod_name: String,
    #[serde(rename = "podIP")]
    pub pod_ip: String,
}

/// Replica record as served by the status endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub pod_name: String,
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    pub status: String,
    pub function: String,
    pub namespace: String,
    pub active_connections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_inflight: Option<u32>,
    /// Milliseconds since the epoch of the last state change.
    pub timestamp: u64,
}

impl From<ReplicaRecord> for ReplicaStatus {
    fn from(record: ReplicaRecord) -> Self {
        Self {
            pod_name: record.name,
            pod_ip: record.ip,
            status: record.state.to_string(),
            function: record.function,
            namespace: record.namespace,
            active_connections: record.active_connections,
            max_inflight: record.max_inflight,
            timestamp: epoch_time_in_ms(record.updated_at),
        }
    }
}
