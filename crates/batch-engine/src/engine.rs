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

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use veil_chain_adapter::{
    BatchReceipt, SubmissionCoordinator, TellerContract,
};
use veil_proof_backends::BatchProver;
use veil_relayer_context::Shutdown;
use veil_relayer_store::{
    ConflictStore, DurableQueueStore, JobId, JobStatus, QueueName,
    QueuedJob, RelayStore, ResourceKey, StatusStore,
};
use veil_relayer_utils::{probe, Error};

use crate::job::RelayableJob;
use crate::window::BatchingPolicy;

/// An ordered, contiguous slice of jobs cut from the queue together.
///
/// `window_start` is the admission timestamp of the first job, carried on
/// the batch itself rather than tracked in a separate store key, so it can
/// never drift from the batch contents.
#[derive(Clone, Debug)]
pub struct Batch<T> {
    /// The jobs of the batch, in admission order.
    pub jobs: Vec<QueuedJob<T>>,
    /// The admission timestamp of the first job, unix millis.
    pub window_start: u64,
}

impl<T> Batch<T>
where
    T: RelayableJob,
{
    /// The ids of every job in the batch, in order.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|job| job.id.clone()).collect()
    }

    /// Every resource key held by any job of the batch.
    pub fn conflict_keys(&self) -> Vec<ResourceKey> {
        self.jobs
            .iter()
            .flat_map(|job| job.inner.conflict_keys())
            .collect()
    }
}

/// The relay engine: the state machine driver from admission to finality.
///
/// Admission (request-driven) and the batch-cut timer (`run`) operate
/// concurrently against the same durable store; every cross-store step is
/// one of the store's atomic groups, so a crash or a racing replica can
/// never observe a job that is queued but unreserved, or popped but not
/// marked in-batch.
#[derive(typed_builder::TypedBuilder)]
pub struct RelayEngine<T, S, C, P>
where
    T: RelayableJob,
    S: RelayStore<T>,
    C: TellerContract,
    P: BatchProver<T>,
{
    /// The durable queue this engine serves.
    queue: QueueName,
    /// When to cut batches.
    policy: BatchingPolicy,
    /// The shared durable store.
    store: Arc<S>,
    /// The single-writer submission path.
    coordinator: Arc<SubmissionCoordinator<C>>,
    /// The proof backend for cut batches.
    prover: P,
    /// How often the batch-cut timer fires.
    poll_interval: Duration,
    #[builder(default, setter(skip))]
    _job: PhantomData<fn(T) -> T>,
}

impl<T, S, C, P> RelayEngine<T, S, C, P>
where
    T: RelayableJob,
    S: RelayStore<T>,
    C: TellerContract,
    P: BatchProver<T>,
{
    /// The queue this engine serves.
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Admits a new job.
    ///
    /// Validates the payload, fail-fast checks every resource key, then
    /// reserves the keys, enqueues the job and records
    /// [`JobStatus::Queued`] as one atomic group. A conflict is reported
    /// synchronously to the submitter; the engine never retries admission
    /// on the caller's behalf.
    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    pub fn admit(&self, job: T) -> veil_relayer_utils::Result<JobId> {
        job.validate()?;
        let keys = job.conflict_keys();
        for key in &keys {
            if self.store.has_conflict(key)? {
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::RelayEngine,
                    queue = %self.queue,
                    conflict = %key,
                );
                return Err(Error::ResourceConflict {
                    key: key.to_string(),
                });
            }
        }
        let queued = QueuedJob::new(job.id(), job);
        let id = queued.id.clone();
        // the atomic admission group re-checks the keys, so two racing
        // admissions of the same resource still admit exactly one.
        self.store.admit_job(&self.queue, &queued, &keys)?;
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::RelayEngine,
            queue = %self.queue,
            admitted = %id,
        );
        Ok(id)
    }

    /// One firing of the batch-cut timer.
    ///
    /// Consults the window policy against the current queue depth and
    /// window start; when it says cut, atomically pops up to the batch
    /// size off the queue, marking every popped job
    /// [`JobStatus::InBatch`].
    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    pub fn tick(
        &self,
    ) -> veil_relayer_utils::Result<Option<Batch<T>>> {
        let depth = self.store.queue_depth(&self.queue)?;
        if depth == 0 {
            return Ok(None);
        }
        let window_start = self.store.window_start(&self.queue)?;
        if !self.policy.should_cut(depth, window_start, now_millis()) {
            return Ok(None);
        }
        let count = core::cmp::min(depth, self.policy.max_size());
        let jobs = match self.store.pop_batch(&self.queue, count)? {
            Some(jobs) if !jobs.is_empty() => jobs,
            _ => return Ok(None),
        };
        let window_start = jobs[0].enqueued_at;
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::RelayEngine,
            queue = %self.queue,
            batch_cut = jobs.len(),
            window_start,
        );
        Ok(Some(Batch { jobs, window_start }))
    }

    /// Relays a cut batch: prove, mark in-flight, submit, then record the
    /// terminal outcome.
    ///
    /// Any failure past the cut fails the whole batch: a single on-chain
    /// transaction carries the whole batch's proof, so partial success is
    /// not modeled. Terminal failure releases every reservation, making
    /// the underlying resources retryable in fresh jobs. Terminal success
    /// also releases them: the chain itself rejects reuse of consumed
    /// resources from that point on, so the entries are only pruned.
    #[tracing::instrument(skip_all, fields(queue = %self.queue, batch_size = batch.jobs.len()))]
    pub async fn relay_batch(
        &self,
        batch: Batch<T>,
    ) -> veil_relayer_utils::Result<BatchReceipt> {
        let ids = batch.job_ids();
        let keys = batch.conflict_keys();
        let inners: Vec<T> =
            batch.jobs.iter().map(|job| job.inner.clone()).collect();

        let proven = match self.prover.prove_batch(&inners).await {
            Ok(proven) => proven,
            Err(e) => {
                tracing::error!(?e, queue = %self.queue, "batch proving failed");
                self.store.complete_batch(
                    &ids,
                    &keys,
                    JobStatus::ExecutedFailed,
                )?;
                return Err(e);
            }
        };

        for id in &ids {
            self.store.set_status(id, JobStatus::InFlight)?;
        }

        match self.coordinator.submit(&proven.proof, proven.new_root).await {
            Ok(receipt) => {
                self.store.complete_batch(
                    &ids,
                    &keys,
                    JobStatus::ExecutedSuccess,
                )?;
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::RelayEngine,
                    queue = %self.queue,
                    batch_executed = batch.jobs.len(),
                    already_applied = receipt.already_applied,
                );
                Ok(receipt)
            }
            Err(e) => {
                self.store.complete_batch(
                    &ids,
                    &keys,
                    JobStatus::ExecutedFailed,
                )?;
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::RelayEngine,
                    queue = %self.queue,
                    batch_failed = batch.jobs.len(),
                    error = %e,
                );
                Err(e)
            }
        }
    }

    /// The timer-driven engine loop.
    ///
    /// The durable queue has no push notifications, so the loop polls on a
    /// fixed interval. A cut batch is always driven to a terminal status
    /// before the loop yields to shutdown, so cancellation never leaves a
    /// half-relayed batch behind; a failed relay is already terminal and
    /// the loop keeps serving the queue.
    pub async fn run(
        &self,
        mut shutdown: Shutdown,
    ) -> veil_relayer_utils::Result<()> {
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::RelayEngine,
            queue = %self.queue,
            starting = true,
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::trace!(queue = %self.queue, "relay engine shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    let maybe_batch = match self.tick() {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::error!(?e, queue = %self.queue, "batch cut failed");
                            continue;
                        }
                    };
                    if let Some(batch) = maybe_batch {
                        if let Err(e) = self.relay_batch(batch).await {
                            tracing::error!(?e, queue = %self.queue, "failed to relay batch");
                        }
                    }
                }
            }
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
