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

//! Relayer handlers for HTTP calls

#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use veil_batch_engine::{Operation, RelayEngine};
use veil_chain_adapter::TellerContract;
use veil_proof_backends::BatchProver;
use veil_relayer_context::RelayerContext;
use veil_relayer_store::{BatchSpeed, SledStore};

/// Module handles relayer API
pub mod routes;

/// The bundler's relay engine as the API sees it: concrete store, type
/// erased chain client and prover.
pub type BundlerEngine = RelayEngine<
    Operation,
    SledStore,
    Arc<dyn TellerContract>,
    Arc<dyn BatchProver<Operation>>,
>;

/// Shared state of the bundler HTTP API.
pub struct BundlerApiState {
    /// The relayer context this API serves.
    pub ctx: RelayerContext,
    engines: HashMap<BatchSpeed, Arc<BundlerEngine>>,
}

impl BundlerApiState {
    /// Creates the API state over the per-tier relay engines.
    pub fn new(
        ctx: RelayerContext,
        engines: HashMap<BatchSpeed, Arc<BundlerEngine>>,
    ) -> Self {
        Self { ctx, engines }
    }

    /// The relay engine serving the given batch-speed tier.
    pub fn engine(&self, speed: BatchSpeed) -> Option<&Arc<BundlerEngine>> {
        self.engines.get(&speed)
    }

    /// The shared durable store.
    pub fn store(&self) -> &SledStore {
        self.ctx.store()
    }
}
