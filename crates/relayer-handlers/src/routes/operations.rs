// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use veil_batch_engine::Operation;
use veil_relayer_store::{BatchSpeed, JobId, JobStatus, StatusStore};
use veil_relayer_utils::HandlerError;

use crate::BundlerApiState;

/// Operation admission request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitOperationRequest {
    /// The signed, proven operation to relay.
    pub operation: Operation,
    /// Which batch-speed tier to admit it into; defaults to medium.
    #[serde(default)]
    pub batch_speed: BatchSpeed,
}

/// Operation admission response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitOperationResponse {
    /// The issued job id; poll the status endpoint with it.
    pub id: JobId,
}

/// Handles admission of a new operation into the bundler.
///
/// Returns the issued job id on success. A conflicting operation is
/// rejected with `409` and the contended resource key, so the submitter
/// can resubmit with corrected inputs; a structurally invalid one with
/// `400`.
///
/// # Arguments
///
/// * `payload` - The operation and the batch-speed tier to admit it into.
pub async fn handle_admit_operation(
    State(state): State<Arc<BundlerApiState>>,
    Json(payload): Json<AdmitOperationRequest>,
) -> Result<Json<AdmitOperationResponse>, HandlerError> {
    if !state.ctx.config.features.operation_relay {
        return Err(HandlerError(
            StatusCode::FORBIDDEN,
            "operation relaying is not enabled".into(),
        ));
    }
    let engine = state.engine(payload.batch_speed).ok_or_else(|| {
        HandlerError(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("no engine for the {} tier", payload.batch_speed),
        )
    })?;
    let id = engine.admit(payload.operation)?;
    Ok(Json(AdmitOperationResponse { id }))
}

/// Operation status response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatusResponse {
    /// The queried job id.
    pub id: JobId,
    /// The last durably-recorded lifecycle status.
    pub status: JobStatus,
}

/// Handles status queries for an admitted operation.
///
/// Every id this actor ever issued resolves to a recorded status; a `404`
/// means the id was never issued here.
///
/// # Arguments
///
/// * `id` - The job id returned at admission.
pub async fn handle_operation_status(
    State(state): State<Arc<BundlerApiState>>,
    Path(id): Path<String>,
) -> Result<Json<OperationStatusResponse>, HandlerError> {
    let id = JobId::new(id);
    match state.store().get_status(&id)? {
        Some(status) => Ok(Json(OperationStatusResponse { id, status })),
        None => Err(HandlerError(
            StatusCode::NOT_FOUND,
            format!("no operation with id {id}"),
        )),
    }
}
