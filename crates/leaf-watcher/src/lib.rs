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

//! # Leaf Watcher Module
//!
//! Consumption of the ordered tree-insertion event stream.
//!
//! ## Overview
//!
//! The insertion event source (a subgraph or an indexed event log) delivers
//! new-leaf events in a total order keyed by block number and intra-block
//! position. The consumer here persists the last fully processed index and
//! resumes from it after a restart, admitting each leaf into the subtree
//! updater's relay engine. Replayed deliveries land on an existing conflict
//! reservation and are skipped, which is what makes the resume gapless
//! *and* duplicate-free at the same time.

use std::sync::Arc;
use std::time::Duration;

use ethereum_types::H256;
use futures::TryFutureExt;
use veil_batch_engine::{LeafInsertion, RelayEngine, RelayableJob};
use veil_chain_adapter::TellerContract;
use veil_proof_backends::BatchProver;
use veil_relayer_context::Shutdown;
use veil_relayer_store::{
    InsertionEntry, InsertionLogStore, RelayStore, StatusStore,
    StreamPositionStore, TotalEntityIndex,
};
use veil_relayer_utils::{probe, retry, Error, Result};

/// A mocked event source for local development and tests.
pub mod mocked;

pub use mocked::MockedLeafEventSource;

/// The stream position key the consumer persists its progress under.
pub const LEAF_STREAM_SOURCE: &str = "leaf_insertions";

/// A new-leaf event delivered by the insertion event source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsertionEvent {
    /// The total order position of the event.
    pub total_index: TotalEntityIndex,
    /// The absolute leaf index the commitment was inserted at.
    pub merkle_index: u64,
    /// The inserted note commitment.
    pub commitment: H256,
}

/// An ordered source of tree-insertion events.
#[async_trait::async_trait]
pub trait LeafEventSource: Send + Sync {
    /// Fetches up to `limit` events strictly after `after`, in total
    /// order. `None` means from the beginning of the stream.
    async fn poll_insertions(
        &self,
        after: Option<TotalEntityIndex>,
        limit: usize,
    ) -> Result<Vec<InsertionEvent>>;
}

#[async_trait::async_trait]
impl<E> LeafEventSource for Arc<E>
where
    E: LeafEventSource + ?Sized,
{
    async fn poll_insertions(
        &self,
        after: Option<TotalEntityIndex>,
        limit: usize,
    ) -> Result<Vec<InsertionEvent>> {
        E::poll_insertions(self, after, limit).await
    }
}

/// Drives the insertion event stream into the subtree updater's relay
/// engine.
#[derive(typed_builder::TypedBuilder)]
pub struct InsertionStreamConsumer<E, S, C, P>
where
    E: LeafEventSource,
    S: RelayStore<LeafInsertion> + InsertionLogStore + StreamPositionStore,
    C: TellerContract,
    P: BatchProver<LeafInsertion>,
{
    source: E,
    engine: Arc<RelayEngine<LeafInsertion, S, C, P>>,
    store: Arc<S>,
    polling_interval: Duration,
    max_events_per_step: usize,
}

impl<E, S, C, P> InsertionStreamConsumer<E, S, C, P>
where
    E: LeafEventSource,
    S: RelayStore<LeafInsertion> + InsertionLogStore + StreamPositionStore,
    C: TellerContract,
    P: BatchProver<LeafInsertion>,
{
    /// The consumer loop: poll, process, persist progress, repeat.
    pub async fn run(&self, mut shutdown: Shutdown) -> Result<()> {
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::LeavesStream,
            starting = true,
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::trace!("insertion stream consumer shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.polling_interval) => {
                    if let Err(e) = self.poll_once().await {
                        // progress is persisted per event, so the next
                        // poll resumes exactly where this one failed.
                        tracing::error!(?e, "insertion stream poll failed");
                    }
                }
            }
        }
    }

    /// One poll step: fetch the next slice of events and process each,
    /// advancing the persisted stream position event by event.
    ///
    /// Returns the number of events fetched.
    #[tracing::instrument(skip_all)]
    pub async fn poll_once(&self) -> Result<usize> {
        let after = self.store.get_stream_position(LEAF_STREAM_SOURCE)?;
        let events = self
            .source
            .poll_insertions(after, self.max_events_per_step)
            .await?;
        let fetched = events.len();
        for event in events {
            self.process_event_with_retry(&event).await?;
            // the position moves only after the event is fully recorded,
            // so a crash in between replays the event, and the replay is
            // absorbed by the reservation it already holds.
            self.store
                .set_stream_position(LEAF_STREAM_SOURCE, event.total_index)?;
        }
        if fetched > 0 {
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::TRACE,
                kind = %probe::Kind::LeavesStream,
                fetched,
            );
        }
        Ok(fetched)
    }

    async fn process_event(&self, event: &InsertionEvent) -> Result<()> {
        self.store.record_insertion(
            event.merkle_index,
            InsertionEntry::Leaf(event.commitment),
        )?;
        let job = LeafInsertion::leaf(event.merkle_index, event.commitment);
        // a leaf whose job already ran to a terminal status has been
        // committed before; its reservation may be pruned by now, so the
        // status check is what keeps a late replay from re-admitting it.
        if self.store.get_status(&RelayableJob::id(&job))?.is_some() {
            tracing::trace!(
                merkle_index = event.merkle_index,
                "leaf already processed, skipping replayed event",
            );
            return Ok(());
        }
        match self.engine.admit(job) {
            Ok(id) => {
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::LeavesStream,
                    admitted = %id,
                    merkle_index = event.merkle_index,
                );
                Ok(())
            }
            // the leaf slot is already reserved: this is a replayed
            // delivery after a crash or a racing replica, not an error.
            Err(Error::ResourceConflict { .. }) => {
                tracing::trace!(
                    merkle_index = event.merkle_index,
                    "leaf already scheduled, skipping replayed event",
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn process_event_with_retry(
        &self,
        event: &InsertionEvent,
    ) -> Result<()> {
        const MAX_RETRY_COUNT: usize = 5;
        let backoff = retry::ConstantWithMaxRetryCount::new(
            Duration::from_millis(100),
            MAX_RETRY_COUNT,
        );
        let task = || {
            self.process_event(event).map_err(|e| match e {
                // a different entry under this index will not fix itself;
                // surface it immediately.
                Error::InconsistentInsertionLog(_) => {
                    backoff::Error::permanent(e)
                }
                _ => backoff::Error::transient(e),
            })
        };
        backoff::future::retry(backoff, task).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_batch_engine::BatchingPolicy;
    use veil_chain_adapter::{MockedChain, SubmissionCoordinator};
    use veil_proof_backends::MockedBatchProver;
    use veil_relayer_store::{
        DurableQueueStore, InMemoryStore, QueueName,
    };

    type TestConsumer = InsertionStreamConsumer<
        MockedLeafEventSource,
        InMemoryStore,
        MockedChain,
        MockedBatchProver,
    >;

    fn consumer_over(
        source: MockedLeafEventSource,
        store: Arc<InMemoryStore>,
        step: usize,
    ) -> TestConsumer {
        let engine = RelayEngine::builder()
            .queue(QueueName::leaf_insertions())
            .policy(BatchingPolicy::full_only(16))
            .store(store.clone())
            .coordinator(Arc::new(SubmissionCoordinator::new(
                MockedChain::builder().build(),
                Duration::from_secs(5),
            )))
            .prover(MockedBatchProver::builder().build())
            .poll_interval(Duration::from_millis(20))
            .build();
        InsertionStreamConsumer::builder()
            .source(source)
            .engine(Arc::new(engine))
            .store(store)
            .polling_interval(Duration::from_millis(20))
            .max_events_per_step(step)
            .build()
    }

    fn events(range: std::ops::Range<u64>) -> Vec<InsertionEvent> {
        range
            .map(|i| InsertionEvent {
                total_index: TotalEntityIndex::new(100 + i, 0),
                merkle_index: i,
                commitment: H256::from_low_u64_be(i + 1),
            })
            .collect()
    }

    #[tokio::test]
    async fn consumes_the_stream_in_order() {
        let source = MockedLeafEventSource::new();
        source.extend(events(0..5));
        let store = Arc::new(InMemoryStore::new());
        let consumer = consumer_over(source, store.clone(), 100);

        assert_eq!(consumer.poll_once().await.unwrap(), 5);
        assert_eq!(consumer.poll_once().await.unwrap(), 0);

        let log = store.insertions().unwrap();
        assert_eq!(log.len(), 5);
        assert_eq!(
            log.keys().copied().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(
            DurableQueueStore::<LeafInsertion>::queue_depth(
                &*store,
                &QueueName::leaf_insertions()
            )
            .unwrap(),
            5
        );
        assert_eq!(
            store.get_stream_position(LEAF_STREAM_SOURCE).unwrap(),
            Some(TotalEntityIndex::new(104, 0))
        );
    }

    #[tokio::test]
    async fn resuming_after_a_crash_yields_no_gaps_and_no_duplicates() {
        let source = MockedLeafEventSource::new();
        source.extend(events(0..7));
        let store = Arc::new(InMemoryStore::new());

        // first consumer processes a couple of slices, then "crashes".
        let first = consumer_over(source.clone(), store.clone(), 3);
        assert_eq!(first.poll_once().await.unwrap(), 3);
        drop(first);

        // a fresh consumer over the same store picks up from the persisted
        // position and drains the rest.
        let second = consumer_over(source, store.clone(), 100);
        assert_eq!(second.poll_once().await.unwrap(), 4);
        assert_eq!(second.poll_once().await.unwrap(), 0);

        // the combined outcome is identical to an uninterrupted run.
        let log = store.insertions().unwrap();
        assert_eq!(
            log.keys().copied().collect::<Vec<_>>(),
            (0..7).collect::<Vec<_>>()
        );
        assert_eq!(
            DurableQueueStore::<LeafInsertion>::queue_depth(
                &*store,
                &QueueName::leaf_insertions()
            )
            .unwrap(),
            7
        );
    }

    #[tokio::test]
    async fn replayed_deliveries_are_absorbed() {
        let source = MockedLeafEventSource::new();
        source.extend(events(0..4));
        let store = Arc::new(InMemoryStore::new());
        let consumer = consumer_over(source, store.clone(), 100);
        assert_eq!(consumer.poll_once().await.unwrap(), 4);

        // simulate a crash after processing but before the position was
        // persisted: rewind the position and poll again.
        store
            .set_stream_position(
                LEAF_STREAM_SOURCE,
                TotalEntityIndex::new(101, 0),
            )
            .unwrap();
        assert_eq!(consumer.poll_once().await.unwrap(), 2);

        // nothing was double-admitted and the log is unchanged.
        assert_eq!(
            DurableQueueStore::<LeafInsertion>::queue_depth(
                &*store,
                &QueueName::leaf_insertions()
            )
            .unwrap(),
            4
        );
        assert_eq!(store.insertions().unwrap().len(), 4);
    }
}
