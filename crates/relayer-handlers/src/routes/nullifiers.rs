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
use ethereum_types::H256;
use serde::Serialize;
use veil_relayer_store::{ConflictStore, ResourceKey};
use veil_relayer_utils::HandlerError;

use crate::BundlerApiState;

/// Nullifier probe response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NullifierProbeResponse {
    /// Whether the nullifier is currently reserved by an in-flight job.
    pub reserved: bool,
}

/// Handles the nullifier conflict probe.
///
/// Wallet-side software calls this before submitting an operation, to
/// pre-empt obviously-conflicting submissions.
///
/// # Arguments
///
/// * `nullifier` - The 0x-prefixed nullifier to probe.
pub async fn handle_nullifier_probe(
    State(state): State<Arc<BundlerApiState>>,
    Path(nullifier): Path<H256>,
) -> Result<Json<NullifierProbeResponse>, HandlerError> {
    if !state.ctx.config.features.data_query {
        return Err(HandlerError(
            StatusCode::FORBIDDEN,
            "data querying is not enabled".into(),
        ));
    }
    let reserved = state
        .store()
        .has_conflict(&ResourceKey::nullifier(nullifier))?;
    Ok(Json(NullifierProbeResponse { reserved }))
}
