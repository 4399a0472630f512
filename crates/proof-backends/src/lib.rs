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

//! # Proof Backends Module
//!
//! Batch proof generation for the relay engine.
//!
//! ## Overview
//!
//! The relay engine treats proof generation as an opaque collaborator: it
//! hands over the jobs of a cut batch and gets back a proof and the new
//! state root the batch advances the chain to. Backends are deterministic
//! for identical inputs and fail loudly on malformed ones; the engine maps
//! a backend failure to a whole-batch failure.

use std::sync::Arc;

use ethereum_types::H256;
use serde::Serialize;
use veil_relayer_utils::Result;

/// A mocked proof backend for local development and tests.
pub mod mocked;

pub use mocked::MockedBatchProver;

/// An opaque batch proof plus its public inputs, ready for submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchProof {
    /// The serialized proof.
    pub proof_bytes: Vec<u8>,
    /// The public inputs the chain verifies the proof against.
    pub public_inputs: Vec<H256>,
}

/// The output of proving a batch: the proof and the state root the batch
/// moves the chain to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvenBatch {
    /// The batch proof.
    pub proof: BatchProof,
    /// The new state root after applying the whole batch.
    pub new_root: H256,
}

/// A backend that turns the jobs of a cut batch into a [`ProvenBatch`].
#[async_trait::async_trait]
pub trait BatchProver<T>: Send + Sync
where
    T: Serialize + Send + Sync,
{
    /// Proves the given batch of jobs.
    ///
    /// Deterministic: proving the same jobs twice yields the same proof
    /// and the same new root.
    async fn prove_batch(&self, jobs: &[T]) -> Result<ProvenBatch>;
}

#[async_trait::async_trait]
impl<T, P> BatchProver<T> for Arc<P>
where
    P: BatchProver<T> + ?Sized,
    T: Serialize + Send + Sync,
{
    async fn prove_batch(&self, jobs: &[T]) -> Result<ProvenBatch> {
        P::prove_batch(self, jobs).await
    }
}
