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

//! # Subtree Updater Service Module
//!
//! A module for starting the long-running tasks of the subtree updater.
//!
//! ## Overview
//!
//! Three tasks run for the updater's lifetime: the insertion stream
//! consumer feeding leaves into the relay engine, the engine loop cutting
//! and committing full subtree batches, and the zero-fill timer that pads
//! a stale, undersized window so the tree keeps advancing under low
//! traffic. Subtree update proofs only exist for full batches, so the
//! engine runs a full-only window policy and staleness is handled entirely
//! by the padder.

use std::sync::Arc;
use std::time::Duration;

use veil_batch_engine::{BatchingPolicy, LeafInsertion, RelayEngine};
use veil_chain_adapter::{
    MockedChain, SubmissionCoordinator, TellerContract,
};
use veil_leaf_watcher::{
    InsertionStreamConsumer, LeafEventSource, MockedLeafEventSource,
};
use veil_proof_backends::{BatchProver, MockedBatchProver};
use veil_relayer_config::ChainBackendConfig;
use veil_relayer_context::RelayerContext;
use veil_relayer_store::{
    DurableQueueStore, InsertionEntry, InsertionLogStore, QueueName,
    RelayStore, SledStore,
};
use veil_relayer_utils::Error;

/// Type alias for [Sled](https://sled.rs)-based database store
pub type Store = SledStore;

/// The updater's relay engine as the services see it: concrete store, type
/// erased chain client and prover.
pub type UpdaterEngine = RelayEngine<
    LeafInsertion,
    SledStore,
    Arc<dyn TellerContract>,
    Arc<dyn BatchProver<LeafInsertion>>,
>;

/// Builds the chain client selected by the configuration.
pub fn make_chain_client(
    ctx: &RelayerContext,
) -> Arc<dyn TellerContract> {
    match ctx.config.chain.backend {
        ChainBackendConfig::Mocked => Arc::new(MockedChain::builder().build()),
    }
}

/// Builds the insertion event source selected by the configuration.
pub fn make_event_source(_ctx: &RelayerContext) -> Arc<dyn LeafEventSource> {
    Arc::new(MockedLeafEventSource::new())
}

/// Starts all background services of the subtree updater.
///
/// This does not block; the tasks are fired on the background.
///
/// # Arguments
///
/// * `ctx` - RelayerContext that holds the configuration
/// * `store` - [Sled](https://sled.rs)-based database store
pub async fn ignite(
    ctx: &RelayerContext,
    store: Arc<Store>,
) -> veil_relayer_utils::Result<()> {
    let updater_config = ctx.config.subtree_updater;
    if !updater_config.enabled || !ctx.config.features.subtree_relay {
        tracing::warn!("subtree update relaying is not enabled");
        return Ok(());
    }

    let chain = make_chain_client(ctx);
    let coordinator = Arc::new(SubmissionCoordinator::new(
        chain,
        ctx.submission_timeout(),
    ));
    let prover: Arc<dyn BatchProver<LeafInsertion>> =
        Arc::new(MockedBatchProver::builder().build());
    let engine: Arc<UpdaterEngine> = Arc::new(
        RelayEngine::builder()
            .queue(QueueName::leaf_insertions())
            .policy(BatchingPolicy::full_only(
                updater_config.subtree_batch_size,
            ))
            .store(store.clone())
            .coordinator(coordinator.clone())
            .prover(prover)
            .poll_interval(Duration::from_millis(
                updater_config.poll_interval_millis,
            ))
            .build(),
    );

    // the engine loop, cutting and committing full subtree batches.
    {
        let engine = engine.clone();
        let shutdown = ctx.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = engine.run(shutdown).await {
                tracing::error!(?e, "relay engine task stopped abnormally");
            }
        });
    }

    // the insertion stream consumer, feeding leaves into the engine.
    {
        let consumer = InsertionStreamConsumer::builder()
            .source(make_event_source(ctx))
            .engine(engine.clone())
            .store(store.clone())
            .polling_interval(Duration::from_millis(
                updater_config.event_source.polling_interval_millis,
            ))
            .max_events_per_step(
                updater_config.event_source.max_events_per_step,
            )
            .build();
        let shutdown = ctx.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = consumer.run(shutdown).await {
                tracing::error!(
                    ?e,
                    "insertion stream consumer stopped abnormally"
                );
            }
        });
    }

    // the zero-fill timer, padding stale undersized windows.
    {
        let engine = engine.clone();
        let store = store.clone();
        let mut shutdown = ctx.shutdown_signal();
        let batch_size = updater_config.subtree_batch_size;
        let fill_window =
            Duration::from_secs(updater_config.fill_window_secs);
        let poll_interval =
            Duration::from_millis(updater_config.poll_interval_millis);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::trace!("zero-fill task shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        let padded = pad_stale_window(
                            &engine,
                            &coordinator,
                            &*store,
                            batch_size,
                            fill_window,
                        )
                        .await;
                        if let Err(e) = padded {
                            tracing::error!(?e, "zero-fill padding failed");
                        }
                    }
                }
            }
        });
    }

    Ok(())
}

/// Pads a stale, undersized insertion window up to the full batch size.
///
/// Padding happens on chain first (`fill_empty_batch` claims the slots in
/// the contract's pending batch), then the padded indices are mirrored
/// into the insertion log and admitted as zero-fill jobs, so the engine's
/// full-only policy cuts the batch on its next tick. With nothing pending
/// there is nothing to balance and the window is left alone.
pub async fn pad_stale_window<S, C, P>(
    engine: &RelayEngine<LeafInsertion, S, C, P>,
    coordinator: &SubmissionCoordinator<C>,
    store: &S,
    batch_size: usize,
    fill_window: Duration,
) -> veil_relayer_utils::Result<bool>
where
    S: RelayStore<LeafInsertion> + InsertionLogStore,
    C: TellerContract,
    P: BatchProver<LeafInsertion>,
{
    let queue = QueueName::leaf_insertions();
    let depth =
        DurableQueueStore::<LeafInsertion>::queue_depth(store, &queue)?;
    if depth == 0 || depth >= batch_size {
        return Ok(false);
    }
    let window_start =
        DurableQueueStore::<LeafInsertion>::window_start(store, &queue)?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64;
    // reuse the window policy for the staleness half of the decision; the
    // fullness half was already excluded above.
    let fill_policy = BatchingPolicy::new(batch_size, fill_window);
    if !fill_policy.should_cut(depth, window_start, now) {
        return Ok(false);
    }

    coordinator.fill_empty_batch().await?;
    let next_index = store.next_insertion_index()?;
    let pad_count = (batch_size - depth) as u64;
    for offset in 0..pad_count {
        let merkle_index = next_index + offset;
        store.record_insertion(merkle_index, InsertionEntry::ZeroFill)?;
        match engine.admit(LeafInsertion::zero_fill(merkle_index)) {
            Ok(_) => {}
            // a replica already padded this slot; its reservation stands.
            Err(Error::ResourceConflict { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    tracing::info!(
        padded = pad_count,
        from_index = next_index,
        "padded stale insertion window with zeros",
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;
    use veil_relayer_store::{InMemoryStore, JobStatus, StatusStore};

    type TestEngine = RelayEngine<
        LeafInsertion,
        InMemoryStore,
        MockedChain,
        MockedBatchProver,
    >;

    fn test_setup(
        batch_size: usize,
    ) -> (
        Arc<InMemoryStore>,
        MockedChain,
        Arc<SubmissionCoordinator<MockedChain>>,
        TestEngine,
    ) {
        let store = Arc::new(InMemoryStore::new());
        let chain = MockedChain::builder().build();
        let coordinator = Arc::new(SubmissionCoordinator::new(
            chain.clone(),
            Duration::from_secs(5),
        ));
        let engine = RelayEngine::builder()
            .queue(QueueName::leaf_insertions())
            .policy(BatchingPolicy::full_only(batch_size))
            .store(store.clone())
            .coordinator(coordinator.clone())
            .prover(MockedBatchProver::builder().build())
            .poll_interval(Duration::from_millis(20))
            .build();
        (store, chain, coordinator, engine)
    }

    fn admit_leaves(
        engine: &TestEngine,
        store: &InMemoryStore,
        range: std::ops::Range<u64>,
    ) {
        for index in range {
            store
                .record_insertion(
                    index,
                    InsertionEntry::Leaf(H256::from_low_u64_be(index + 1)),
                )
                .unwrap();
            engine
                .admit(LeafInsertion::leaf(
                    index,
                    H256::from_low_u64_be(index + 1),
                ))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn pads_a_stale_undersized_window_to_a_full_batch() {
        let (store, chain, coordinator, engine) = test_setup(4);
        admit_leaves(&engine, &store, 0..2);

        // not stale yet: nothing is padded.
        assert!(!pad_stale_window(
            &engine,
            &coordinator,
            &*store,
            4,
            Duration::from_secs(3600),
        )
        .await
        .unwrap());

        // stale: the window is padded on chain and locally.
        assert!(pad_stale_window(
            &engine,
            &coordinator,
            &*store,
            4,
            Duration::from_millis(0),
        )
        .await
        .unwrap());
        assert_eq!(chain.zero_fill_count(), 1);
        assert_eq!(
            DurableQueueStore::<LeafInsertion>::queue_depth(
                &*store,
                &QueueName::leaf_insertions()
            )
            .unwrap(),
            4
        );
        let log = store.insertions().unwrap();
        assert_eq!(log.get(&2), Some(&InsertionEntry::ZeroFill));
        assert_eq!(log.get(&3), Some(&InsertionEntry::ZeroFill));

        // the full-only policy now cuts the padded batch, and the batch
        // commits: every index holds exactly one entry, leaf or zero.
        let batch = engine.tick().unwrap().expect("padded window must cut");
        assert_eq!(batch.jobs.len(), 4);
        let ids = batch.job_ids();
        engine.relay_batch(batch).await.unwrap();
        for id in &ids {
            assert_eq!(
                store.get_status(id).unwrap(),
                Some(JobStatus::ExecutedSuccess)
            );
        }
        assert_eq!(chain.submissions().len(), 1);
    }

    #[tokio::test]
    async fn an_empty_window_is_never_padded() {
        let (store, chain, coordinator, engine) = test_setup(4);
        assert!(!pad_stale_window(
            &engine,
            &coordinator,
            &*store,
            4,
            Duration::from_millis(0),
        )
        .await
        .unwrap());
        assert_eq!(chain.zero_fill_count(), 0);
    }

    #[tokio::test]
    async fn a_full_window_is_not_padded() {
        let (store, chain, coordinator, engine) = test_setup(2);
        admit_leaves(&engine, &store, 0..2);
        assert!(!pad_stale_window(
            &engine,
            &coordinator,
            &*store,
            2,
            Duration::from_millis(0),
        )
        .await
        .unwrap());
        assert_eq!(chain.zero_fill_count(), 0);
    }
}
