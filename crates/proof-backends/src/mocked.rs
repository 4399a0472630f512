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

use ethereum_types::H256;
use serde::Serialize;
use sha2::{Digest, Sha256};
use veil_relayer_utils::Error;

use crate::{BatchProof, BatchProver, ProvenBatch};

/// A mocked proof backend that derives the "proof" and the new root from a
/// digest of the batch inputs.
///
/// This keeps the backend deterministic the same way a real prover is:
/// identical batches produce identical outputs, so tests can assert the
/// idempotent-resubmission behavior of the submission path end to end.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct MockedBatchProver {
    /// When set, every proving attempt fails, which simulates a circuit
    /// rejecting malformed witness inputs.
    #[builder(default = false)]
    should_fail: bool,
}

#[async_trait::async_trait]
impl<T> BatchProver<T> for MockedBatchProver
where
    T: Serialize + Send + Sync,
{
    #[tracing::instrument(skip_all, fields(batch_size = jobs.len()))]
    async fn prove_batch(
        &self,
        jobs: &[T],
    ) -> veil_relayer_utils::Result<ProvenBatch> {
        if self.should_fail {
            return Err(Error::ProofGeneration(
                "mocked prover is configured to fail".into(),
            ));
        }
        if jobs.is_empty() {
            return Err(Error::ProofGeneration(
                "cannot prove an empty batch".into(),
            ));
        }
        let encoded = serde_json::to_vec(&jobs)?;
        let digest = Sha256::digest(&encoded);
        let new_root = {
            let mut hasher = Sha256::new();
            hasher.update(b"veil_batch_root");
            hasher.update(digest);
            H256::from_slice(&hasher.finalize())
        };
        tracing::debug!(%new_root, "mocked batch proof generated");
        Ok(ProvenBatch {
            proof: BatchProof {
                proof_bytes: digest.to_vec(),
                public_inputs: vec![new_root],
            },
            new_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn proving_is_deterministic() {
        let prover = MockedBatchProver::builder().build();
        let jobs = vec!["a".to_string(), "b".to_string()];
        let first = prover.prove_batch(&jobs).await.unwrap();
        let second = prover.prove_batch(&jobs).await.unwrap();
        assert_eq!(first, second);

        let other = prover.prove_batch(&jobs[..1]).await.unwrap();
        assert_ne!(first.new_root, other.new_root);
    }

    #[tokio::test]
    async fn failing_prover_fails_loudly() {
        let prover = MockedBatchProver::builder().should_fail(true).build();
        let err = prover
            .prove_batch(&["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProofGeneration(_)));
    }
}
