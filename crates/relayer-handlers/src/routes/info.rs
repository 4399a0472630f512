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

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use veil_relayer_config::FeaturesConfig;

use crate::BundlerApiState;

/// Actor info response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    /// The running version of the actor.
    pub version: String,
    /// Which features this deployment enables.
    pub features: FeaturesConfig,
    /// The destination chain id.
    pub chain_id: u32,
}

/// Handles the actor info API, used by clients to discover what this
/// deployment supports.
pub async fn handle_relayer_info(
    State(state): State<Arc<BundlerApiState>>,
) -> Json<InfoResponse> {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        features: state.ctx.config.features,
        chain_id: state.ctx.config.chain.chain_id,
    })
}
