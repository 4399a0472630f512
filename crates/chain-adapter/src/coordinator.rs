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

use std::time::Duration;

use ethereum_types::H256;
use tokio::sync::Mutex;
use veil_proof_backends::BatchProof;
use veil_relayer_utils::{probe, Error};

use crate::{BatchReceipt, SubmitOutcome, TellerContract};

/// The single-writer choke point in front of the chain.
///
/// The chain requires strictly increasing transaction sequence numbers per
/// signer, so all submissions from one relayer account go through one lock.
/// Within a process the lock serializes the engines sharing the account;
/// across redundant replicas the conflict store plus the "already applied"
/// tolerance below make the inevitable duplicate submissions harmless.
///
/// The coordinator performs no retries itself; retry policy belongs to the
/// callers.
pub struct SubmissionCoordinator<C> {
    chain: C,
    lock: Mutex<()>,
    submission_timeout: Duration,
}

impl<C> SubmissionCoordinator<C>
where
    C: TellerContract,
{
    /// Creates a new SubmissionCoordinator around a chain client.
    pub fn new(chain: C, submission_timeout: Duration) -> Self {
        Self {
            chain,
            lock: Mutex::new(()),
            submission_timeout,
        }
    }

    /// Submits a proven batch, serialized behind the account lock.
    ///
    /// An "already applied" outcome is a success: it means a prior
    /// submission, possibly from a redundant replica of this actor,
    /// already advanced the chain to the target state. All other chain
    /// rejections are propagated as failures.
    #[tracing::instrument(skip_all, fields(%new_root))]
    pub async fn submit(
        &self,
        proof: &BatchProof,
        new_root: H256,
    ) -> veil_relayer_utils::Result<BatchReceipt> {
        let _guard = self.lock.lock().await;
        let outcome = tokio::time::timeout(
            self.submission_timeout,
            self.chain.submit_batch(proof, new_root),
        )
        .await
        .map_err(|_| Error::SubmissionTimedOut)??;
        self.classify(outcome, new_root)
    }

    /// Pads the pending on-chain leaf batch with zeros, serialized behind
    /// the same account lock as regular submissions.
    #[tracing::instrument(skip_all)]
    pub async fn fill_empty_batch(
        &self,
    ) -> veil_relayer_utils::Result<BatchReceipt> {
        let _guard = self.lock.lock().await;
        let outcome = tokio::time::timeout(
            self.submission_timeout,
            self.chain.fill_batch_with_zeros(),
        )
        .await
        .map_err(|_| Error::SubmissionTimedOut)??;
        self.classify(outcome, H256::zero())
    }

    fn classify(
        &self,
        outcome: SubmitOutcome,
        new_root: H256,
    ) -> veil_relayer_utils::Result<BatchReceipt> {
        match outcome {
            SubmitOutcome::Applied(receipt) => {
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::Submission,
                    applied = true,
                    %new_root,
                );
                Ok(receipt)
            }
            SubmitOutcome::AlreadyApplied => {
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::Submission,
                    already_applied = true,
                    %new_root,
                );
                tracing::debug!(
                    %new_root,
                    "target state already applied by a prior submission",
                );
                Ok(BatchReceipt::already_applied())
            }
            SubmitOutcome::Rejected(reason) => {
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::Submission,
                    errored = true,
                    error = %reason,
                    %new_root,
                );
                Err(Error::ChainRejected(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockedChain;
    use veil_proof_backends::BatchProof;

    fn dummy_proof() -> BatchProof {
        BatchProof {
            proof_bytes: vec![1, 2, 3],
            public_inputs: vec![],
        }
    }

    #[tokio::test]
    async fn resubmitting_an_applied_root_is_a_success() {
        let chain = MockedChain::builder().build();
        let coordinator = SubmissionCoordinator::new(
            chain,
            Duration::from_secs(5),
        );
        let root = H256::repeat_byte(7);

        let first =
            coordinator.submit(&dummy_proof(), root).await.unwrap();
        assert!(!first.already_applied);
        assert!(first.tx_hash.is_some());

        // simulates the second of two redundant replicas racing on the
        // same batch: success, not a user-visible failure.
        let second =
            coordinator.submit(&dummy_proof(), root).await.unwrap();
        assert!(second.already_applied);
        assert!(second.tx_hash.is_none());
    }

    #[tokio::test]
    async fn genuine_rejections_propagate() {
        let root = H256::repeat_byte(9);
        let chain = MockedChain::builder()
            .rejected_roots(vec![root])
            .build();
        let coordinator = SubmissionCoordinator::new(
            chain,
            Duration::from_secs(5),
        );
        let err =
            coordinator.submit(&dummy_proof(), root).await.unwrap_err();
        assert!(matches!(err, Error::ChainRejected(_)));
    }

    #[tokio::test]
    async fn slow_chains_hit_the_submission_timeout() {
        let chain = MockedChain::builder()
            .latency(Duration::from_millis(200))
            .build();
        let coordinator = SubmissionCoordinator::new(
            chain,
            Duration::from_millis(20),
        );
        let err = coordinator
            .submit(&dummy_proof(), H256::repeat_byte(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubmissionTimedOut));
    }
}
