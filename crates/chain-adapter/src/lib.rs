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

//! # Chain Adapter Module
//!
//! The boundary between the relay engines and the chain.
//!
//! ## Overview
//!
//! Concrete chain clients implement [`TellerContract`] and classify every
//! chain response into a typed [`SubmitOutcome`] at the boundary, so the
//! business logic above never needs to pattern-match on free-text chain
//! error strings. The [`SubmissionCoordinator`] is the single-writer choke
//! point that serializes submissions per relayer account and turns the
//! "already applied" outcome into a success, which is what makes running
//! redundant replicas of the same actor safe.

use std::sync::Arc;

use ethereum_types::H256;
use veil_proof_backends::BatchProof;
use veil_relayer_utils::Result;

/// The submission coordinator.
pub mod coordinator;
/// A mocked chain backend for local development and tests.
pub mod mocked;

pub use coordinator::SubmissionCoordinator;
pub use mocked::MockedChain;

/// The receipt of a batch that is now final on chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchReceipt {
    /// The transaction hash, when this submission is the one that landed.
    pub tx_hash: Option<H256>,
    /// The block the transaction was included in.
    pub block_number: Option<u64>,
    /// Whether a prior submission (ours or a replica's) already applied
    /// the target state.
    pub already_applied: bool,
}

impl BatchReceipt {
    /// A receipt for a state another submission already applied.
    pub fn already_applied() -> Self {
        Self {
            tx_hash: None,
            block_number: None,
            already_applied: true,
        }
    }
}

/// The typed outcome of a chain submission.
///
/// Classification happens in the concrete [`TellerContract`]
/// implementation, which is the only place that knows what the chain's
/// rejection reasons look like on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// This submission landed and applied the target state.
    Applied(BatchReceipt),
    /// The target state was already reached by a prior submission; safe to
    /// treat as success.
    AlreadyApplied,
    /// The chain rejected the submission for a genuine reason.
    Rejected(String),
}

/// The on-chain contract the actors submit batches to.
#[async_trait::async_trait]
pub trait TellerContract: Send + Sync {
    /// Submits a proven batch advancing the chain state to `new_root`.
    async fn submit_batch(
        &self,
        proof: &BatchProof,
        new_root: H256,
    ) -> Result<SubmitOutcome>;

    /// Pads the pending on-chain leaf batch with zeros, so the tree can be
    /// proven and advanced on a fixed cadence even with little traffic.
    async fn fill_batch_with_zeros(&self) -> Result<SubmitOutcome>;
}

#[async_trait::async_trait]
impl<C> TellerContract for Arc<C>
where
    C: TellerContract + ?Sized,
{
    async fn submit_batch(
        &self,
        proof: &BatchProof,
        new_root: H256,
    ) -> Result<SubmitOutcome> {
        C::submit_batch(self, proof, new_root).await
    }

    async fn fill_batch_with_zeros(&self) -> Result<SubmitOutcome> {
        C::fill_batch_with_zeros(self).await
    }
}
