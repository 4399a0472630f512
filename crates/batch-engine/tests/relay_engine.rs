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
use std::time::Duration;

use ethereum_types::H256;
use tokio::sync::broadcast;
use veil_batch_engine::{
    BatchingPolicy, Operation, RelayEngine, RelayableJob, TransferComponent,
};
use veil_chain_adapter::{MockedChain, SubmissionCoordinator};
use veil_proof_backends::{BatchProver, MockedBatchProver};
use veil_relayer_context::Shutdown;
use veil_relayer_store::{
    BatchSpeed, ConflictStore, InMemoryStore, JobStatus, QueueName,
    ResourceKey, StatusStore,
};
use veil_relayer_utils::Error;

type TestEngine =
    RelayEngine<Operation, InMemoryStore, MockedChain, MockedBatchProver>;

fn operation(n: u8) -> Operation {
    Operation {
        components: vec![TransferComponent {
            nullifier_a: H256::repeat_byte(n),
            nullifier_b: H256::repeat_byte(n.wrapping_add(100)),
        }],
        proof_blob: vec![0xaa; 32],
        encoded_args: vec![n],
    }
}

fn engine_with(
    store: Arc<InMemoryStore>,
    chain: MockedChain,
    policy: BatchingPolicy,
    prover: MockedBatchProver,
) -> TestEngine {
    RelayEngine::builder()
        .queue(QueueName::operations(BatchSpeed::Medium))
        .policy(policy)
        .store(store)
        .coordinator(Arc::new(SubmissionCoordinator::new(
            chain,
            Duration::from_secs(5),
        )))
        .prover(prover)
        .poll_interval(Duration::from_millis(20))
        .build()
}

fn default_engine(
    store: Arc<InMemoryStore>,
    chain: MockedChain,
    policy: BatchingPolicy,
) -> TestEngine {
    engine_with(store, chain, policy, MockedBatchProver::builder().build())
}

#[tokio::test]
async fn a_full_window_cuts_exactly_one_batch() {
    let store = Arc::new(InMemoryStore::new());
    let engine = default_engine(
        store.clone(),
        MockedChain::builder().build(),
        BatchingPolicy::new(8, Duration::from_secs(3600)),
    );

    let ids: Vec<_> = (1..=8u8)
        .map(|n| engine.admit(operation(n)).unwrap())
        .collect();
    for id in &ids {
        assert_eq!(store.get_status(id).unwrap(), Some(JobStatus::Queued));
    }

    let batch = engine.tick().unwrap().expect("full window must cut");
    assert_eq!(batch.jobs.len(), 8);
    // admission order is preserved inside the batch.
    assert_eq!(batch.job_ids(), ids);
    for id in &ids {
        assert_eq!(store.get_status(id).unwrap(), Some(JobStatus::InBatch));
    }

    // a ninth admission starts a fresh window and does not cut until it
    // goes stale.
    let ninth = engine.admit(operation(9)).unwrap();
    assert!(engine.tick().unwrap().is_none());
    assert_eq!(store.get_status(&ninth).unwrap(), Some(JobStatus::Queued));
}

#[tokio::test]
async fn a_stale_window_cuts_a_partial_batch() {
    let store = Arc::new(InMemoryStore::new());
    let engine = default_engine(
        store.clone(),
        MockedChain::builder().build(),
        BatchingPolicy::new(8, Duration::from_millis(100)),
    );

    engine.admit(operation(1)).unwrap();
    engine.admit(operation(2)).unwrap();
    assert!(engine.tick().unwrap().is_none(), "not stale yet");

    tokio::time::sleep(Duration::from_millis(150)).await;
    let batch = engine.tick().unwrap().expect("stale window must cut");
    assert_eq!(batch.jobs.len(), 2);
}

#[tokio::test]
async fn batches_preserve_fifo_across_cuts() {
    let store = Arc::new(InMemoryStore::new());
    let engine = default_engine(
        store.clone(),
        MockedChain::builder().build(),
        BatchingPolicy::new(2, Duration::from_secs(3600)),
    );

    let ids: Vec<_> = (1..=4u8)
        .map(|n| engine.admit(operation(n)).unwrap())
        .collect();
    let first = engine.tick().unwrap().unwrap();
    let second = engine.tick().unwrap().unwrap();
    assert_eq!(first.job_ids(), ids[..2]);
    assert_eq!(second.job_ids(), ids[2..]);
    // windows restart per cut: the second batch starts no earlier than
    // the first.
    assert!(second.window_start >= first.window_start);
}

#[tokio::test]
async fn conflicting_admissions_admit_exactly_one() {
    let store = Arc::new(InMemoryStore::new());
    let engine = default_engine(
        store.clone(),
        MockedChain::builder().build(),
        BatchingPolicy::new(8, Duration::from_secs(3600)),
    );

    let winner = operation(1);
    engine.admit(winner.clone()).unwrap();

    // a different operation that reuses one of the winner's nullifiers is
    // a double-spend attempt and is rejected synchronously.
    let mut rival = operation(2);
    rival.components[0].nullifier_b = winner.components[0].nullifier_a;
    let err = engine.admit(rival.clone()).unwrap_err();
    assert!(matches!(err, Error::ResourceConflict { .. }));
    // the rejected job never reached the queue: no status was recorded.
    assert_eq!(store.get_status(&rival.id()).unwrap(), None);
}

#[tokio::test]
async fn a_relayed_batch_succeeds_and_prunes_reservations() {
    let store = Arc::new(InMemoryStore::new());
    let chain = MockedChain::builder().build();
    let engine = default_engine(
        store.clone(),
        chain.clone(),
        BatchingPolicy::new(2, Duration::from_secs(3600)),
    );

    let op = operation(1);
    let nullifier_key = ResourceKey::nullifier(op.components[0].nullifier_a);
    let ids = vec![
        engine.admit(op).unwrap(),
        engine.admit(operation(2)).unwrap(),
    ];
    let batch = engine.tick().unwrap().unwrap();
    let receipt = engine.relay_batch(batch).await.unwrap();
    assert!(!receipt.already_applied);
    assert_eq!(chain.submissions().len(), 1);
    for id in &ids {
        assert_eq!(
            store.get_status(id).unwrap(),
            Some(JobStatus::ExecutedSuccess)
        );
    }
    // consumed nullifiers are pruned from the conflict store; the chain
    // rejects their reuse on its own from here on.
    assert!(!store.has_conflict(&nullifier_key).unwrap());
}

#[tokio::test]
async fn a_failed_batch_releases_its_resources_for_retry() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_with(
        store.clone(),
        MockedChain::builder().build(),
        BatchingPolicy::new(1, Duration::from_secs(3600)),
        MockedBatchProver::builder().should_fail(true).build(),
    );

    let op = operation(1);
    let id = engine.admit(op.clone()).unwrap();
    let batch = engine.tick().unwrap().unwrap();
    let err = engine.relay_batch(batch).await.unwrap_err();
    assert!(matches!(err, Error::ProofGeneration(_)));
    assert_eq!(
        store.get_status(&id).unwrap(),
        Some(JobStatus::ExecutedFailed)
    );
    // the same nullifiers can now ride in a fresh job.
    engine.admit(op).unwrap();
}

#[tokio::test]
async fn a_rejected_batch_fails_atomically() {
    let store = Arc::new(InMemoryStore::new());
    // reject precisely the root this batch will produce: compute it by
    // proving the same jobs with the same deterministic prover.
    let jobs = vec![operation(1), operation(2)];
    let expected_root = MockedBatchProver::builder()
        .build()
        .prove_batch(&jobs)
        .await
        .unwrap()
        .new_root;
    let engine = default_engine(
        store.clone(),
        MockedChain::builder()
            .rejected_roots(vec![expected_root])
            .build(),
        BatchingPolicy::new(2, Duration::from_secs(3600)),
    );

    let ids: Vec<_> = jobs
        .iter()
        .map(|op| engine.admit(op.clone()).unwrap())
        .collect();
    let batch = engine.tick().unwrap().unwrap();
    let err = engine.relay_batch(batch).await.unwrap_err();
    assert!(matches!(err, Error::ChainRejected(_)));
    // the whole batch fails together: one transaction carries the whole
    // batch's proof.
    for id in &ids {
        assert_eq!(
            store.get_status(id).unwrap(),
            Some(JobStatus::ExecutedFailed)
        );
    }
}

#[tokio::test]
async fn redundant_replicas_tolerate_duplicate_submission() {
    // two replicas of the same actor with their own stores but one chain:
    // both cut and relay the same batch; the second submission must be a
    // success via the already-applied tolerance, not a failure.
    let chain = MockedChain::builder().build();
    let policy = BatchingPolicy::new(2, Duration::from_secs(3600));
    let replica_a = default_engine(
        Arc::new(InMemoryStore::new()),
        chain.clone(),
        policy,
    );
    let replica_b = default_engine(
        Arc::new(InMemoryStore::new()),
        chain.clone(),
        policy,
    );

    for replica in [&replica_a, &replica_b] {
        replica.admit(operation(1)).unwrap();
        replica.admit(operation(2)).unwrap();
    }
    let receipt_a = replica_a
        .relay_batch(replica_a.tick().unwrap().unwrap())
        .await
        .unwrap();
    let receipt_b = replica_b
        .relay_batch(replica_b.tick().unwrap().unwrap())
        .await
        .unwrap();

    assert!(!receipt_a.already_applied);
    assert!(receipt_b.already_applied);
    // the chain applied the state exactly once.
    assert_eq!(chain.submissions().len(), 1);
}

#[tokio::test]
async fn the_engine_loop_relays_batches_until_shutdown() {
    let store = Arc::new(InMemoryStore::new());
    let chain = MockedChain::builder().build();
    let engine = Arc::new(default_engine(
        store.clone(),
        chain.clone(),
        BatchingPolicy::new(4, Duration::from_secs(3600)),
    ));

    let (notify_shutdown, _) = broadcast::channel(2);
    let shutdown = Shutdown::new(notify_shutdown.subscribe());
    let loop_handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    let ids: Vec<_> = (1..=4u8)
        .map(|n| engine.admit(operation(n)).unwrap())
        .collect();
    // give the timer a few firings to pick up the full window.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for id in &ids {
        assert_eq!(
            store.get_status(id).unwrap(),
            Some(JobStatus::ExecutedSuccess)
        );
    }
    assert_eq!(chain.submissions().len(), 1);

    let _ = notify_shutdown.send(());
    loop_handle.await.unwrap().unwrap();
}
