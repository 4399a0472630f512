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

//! # Bundler Service Module
//!
//! A module for starting the long-running tasks of the bundler actor.
//!
//! ## Overview
//!
//! Services are tasks the bundler constantly runs throughout its lifetime:
//! one relay engine per batch-speed tier, all sharing one submission
//! coordinator so the relayer account's transaction sequence numbers never
//! race.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use veil_batch_engine::{BatchingPolicy, Operation, RelayEngine};
use veil_chain_adapter::{
    MockedChain, SubmissionCoordinator, TellerContract,
};
use veil_proof_backends::{BatchProver, MockedBatchProver};
use veil_relayer_config::ChainBackendConfig;
use veil_relayer_context::RelayerContext;
use veil_relayer_handlers::routes::info::handle_relayer_info;
use veil_relayer_handlers::routes::nullifiers::handle_nullifier_probe;
use veil_relayer_handlers::routes::operations::{
    handle_admit_operation, handle_operation_status,
};
use veil_relayer_handlers::{BundlerApiState, BundlerEngine};
use veil_relayer_store::{BatchSpeed, QueueName, SledStore};

/// Type alias for [Sled](https://sled.rs)-based database store
pub type Store = SledStore;

/// Builds the chain client selected by the configuration.
pub fn make_chain_client(
    ctx: &RelayerContext,
) -> Arc<dyn TellerContract> {
    match ctx.config.chain.backend {
        ChainBackendConfig::Mocked => Arc::new(MockedChain::builder().build()),
    }
}

/// Starts all background services of the bundler and returns the state the
/// HTTP API serves from.
///
/// This does not block; the relay engines are fired on background tasks.
///
/// # Arguments
///
/// * `ctx` - RelayerContext that holds the configuration
/// * `store` - [Sled](https://sled.rs)-based database store
pub async fn ignite(
    ctx: &RelayerContext,
    store: Arc<Store>,
) -> veil_relayer_utils::Result<Arc<BundlerApiState>> {
    let chain = make_chain_client(ctx);
    let coordinator = Arc::new(SubmissionCoordinator::new(
        chain,
        ctx.submission_timeout(),
    ));
    let prover: Arc<dyn BatchProver<Operation>> =
        Arc::new(MockedBatchProver::builder().build());
    let bundler_config = ctx.config.bundler;
    let windows = bundler_config.batch_windows;

    let mut engines: HashMap<BatchSpeed, Arc<BundlerEngine>> = HashMap::new();
    let tiers = [
        (BatchSpeed::Fast, windows.fast),
        (BatchSpeed::Medium, windows.medium),
        (BatchSpeed::Slow, windows.slow),
    ];
    for (speed, window_secs) in tiers {
        let engine: Arc<BundlerEngine> = Arc::new(
            RelayEngine::builder()
                .queue(QueueName::operations(speed))
                .policy(BatchingPolicy::new(
                    bundler_config.max_batch_size,
                    Duration::from_secs(window_secs),
                ))
                .store(store.clone())
                .coordinator(coordinator.clone())
                .prover(prover.clone())
                .poll_interval(Duration::from_millis(
                    bundler_config.poll_interval_millis,
                ))
                .build(),
        );
        let should_run = bundler_config.enabled
            && ctx.config.features.operation_relay;
        if should_run {
            let task_engine = engine.clone();
            let shutdown = ctx.shutdown_signal();
            tokio::spawn(async move {
                if let Err(e) = task_engine.run(shutdown).await {
                    tracing::error!(
                        ?e,
                        "relay engine task stopped abnormally"
                    );
                }
            });
        } else {
            tracing::warn!(%speed, "operation relaying is not enabled");
        }
        engines.insert(speed, engine);
    }

    Ok(Arc::new(BundlerApiState::new(ctx.clone(), engines)))
}

/// Sets up the HTTP API of the bundler: admission, status queries and the
/// nullifier probe. Allows clients to interact with the actor.
///
/// # Arguments
///
/// * `state` - The shared API state returned by [`ignite`]
pub async fn build_web_services(
    state: Arc<BundlerApiState>,
) -> veil_relayer_utils::Result<()> {
    let socket_addr =
        SocketAddr::new([0, 0, 0, 0].into(), state.ctx.config.port);
    let api = Router::new()
        .route("/info", get(handle_relayer_info))
        .route("/operations", post(handle_admit_operation))
        .route("/operations/:id/status", get(handle_operation_status))
        .route("/nullifiers/:nullifier", get(handle_nullifier_probe));

    let app = Router::new()
        .nest("/api/v1", api)
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Starting the server on {}", socket_addr);
    axum::Server::bind(&socket_addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
