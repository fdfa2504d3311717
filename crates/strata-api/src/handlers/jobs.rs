//! /jobs handler — run a matrix job on the connected nodes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use strata_core::task::Matrix;
use strata_services::{CoordinateError, JobReport, Operation};

use super::ApiState;

// ── /jobs (POST) ──────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default = "default_operation")]
    pub operation: String,
    pub matrix: Matrix,
}

fn default_operation() -> String {
    Operation::BlockMultiply.as_str().to_string()
}

/// Blocks until the job settles or times out. Job-level outcomes come back
/// as a 200 with the report; only jobs that cannot start are errors.
pub async fn handle_submit_job(
    State(state): State<ApiState>,
    Json(req): Json<JobRequest>,
) -> Result<Json<JobReport>, (StatusCode, String)> {
    let rows = req.matrix.len();
    tracing::info!(operation = %req.operation, rows, "job submitted via API");

    state
        .coordinator
        .coordinate(&req.operation, req.matrix)
        .await
        .map(Json)
        .map_err(|e| (status_for(&e), e.to_string()))
}

fn status_for(err: &CoordinateError) -> StatusCode {
    match err {
        CoordinateError::UnsupportedOperation(_) | CoordinateError::TooManyRows(_) => {
            StatusCode::BAD_REQUEST
        }
        CoordinateError::NoNodesAvailable => StatusCode::SERVICE_UNAVAILABLE,
        CoordinateError::JobLost(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
