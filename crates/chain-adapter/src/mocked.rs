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

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ethereum_types::H256;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use veil_proof_backends::BatchProof;

use crate::{BatchReceipt, SubmitOutcome, TellerContract};

#[derive(Debug, Default)]
struct MockedChainState {
    applied_roots: HashSet<H256>,
    submissions: Vec<H256>,
    zero_fills: u64,
    block_number: u64,
}

/// An in-process chain that behaves like the real contract at the
/// interface boundary: it applies each state root at most once, reports a
/// resubmission of an applied root as [`SubmitOutcome::AlreadyApplied`],
/// and rejects roots it is configured to reject.
#[derive(Clone, Debug, typed_builder::TypedBuilder)]
pub struct MockedChain {
    /// Roots this chain will reject, to simulate genuine verification
    /// failures.
    #[builder(default, setter(transform = |roots: Vec<H256>| roots.into_iter().collect::<HashSet<_>>()))]
    rejected_roots: HashSet<H256>,
    /// Artificial latency per chain call.
    #[builder(default = Duration::from_millis(0))]
    latency: Duration,
    #[builder(default, setter(skip))]
    state: Arc<Mutex<MockedChainState>>,
}

impl MockedChain {
    /// The roots applied so far, in submission order.
    pub fn submissions(&self) -> Vec<H256> {
        self.state.lock().submissions.clone()
    }

    /// How many times the pending batch was padded with zeros.
    pub fn zero_fill_count(&self) -> u64 {
        self.state.lock().zero_fills
    }

    fn receipt_for(root: H256, block_number: u64) -> BatchReceipt {
        let mut hasher = Sha256::new();
        hasher.update(b"veil_tx");
        hasher.update(root.as_bytes());
        hasher.update(block_number.to_be_bytes());
        BatchReceipt {
            tx_hash: Some(H256::from_slice(&hasher.finalize())),
            block_number: Some(block_number),
            already_applied: false,
        }
    }
}

#[async_trait::async_trait]
impl TellerContract for MockedChain {
    async fn submit_batch(
        &self,
        _proof: &BatchProof,
        new_root: H256,
    ) -> veil_relayer_utils::Result<SubmitOutcome> {
        tokio::time::sleep(self.latency).await;
        if self.rejected_roots.contains(&new_root) {
            return Ok(SubmitOutcome::Rejected(
                "batch proof verification failed".into(),
            ));
        }
        let mut state = self.state.lock();
        if state.applied_roots.contains(&new_root) {
            return Ok(SubmitOutcome::AlreadyApplied);
        }
        state.applied_roots.insert(new_root);
        state.submissions.push(new_root);
        state.block_number += 1;
        Ok(SubmitOutcome::Applied(Self::receipt_for(
            new_root,
            state.block_number,
        )))
    }

    async fn fill_batch_with_zeros(
        &self,
    ) -> veil_relayer_utils::Result<SubmitOutcome> {
        tokio::time::sleep(self.latency).await;
        let mut state = self.state.lock();
        state.zero_fills += 1;
        state.block_number += 1;
        Ok(SubmitOutcome::Applied(Self::receipt_for(
            H256::zero(),
            state.block_number,
        )))
    }
}
