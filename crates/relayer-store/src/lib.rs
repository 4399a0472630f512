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

//! # Relayer Store Module
//!
//! A module for managing the durable state of the relayer actors.
//!
//! ## Overview
//!
//! The relayer store module holds everything an actor must not lose across
//! a restart: the FIFO queues of admitted jobs, the conflict reservations
//! that guard each job's resources, the lifecycle status of every job, the
//! append-only log of tree insertions, and the resume position of the
//! insertion event stream. All of it is shared, externally-persisted state;
//! the in-process actors only ever mutate it through the atomic operations
//! exposed here.

use std::fmt::Display;
use std::sync::Arc;

use ethereum_types::H256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use veil_relayer_utils::Result;

/// A module for managing in-memory storage of the relayer.
pub mod mem;
/// A module for setting up and managing a [Sled](https://sled.rs)-based database.
pub mod sled;

/// A store that uses [`sled`](https://sled.rs) as the backend.
pub use self::sled::SledStore;
/// A store that uses in memory data structures as the backend.
pub use mem::InMemoryStore;

/// The unique identifier of a job, issued at admission time.
///
/// Operation jobs derive their id from a digest of their content, so
/// resubmitting the exact same operation yields the exact same id.
/// Insertion jobs use their position in the insertion stream.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new JobId from anything string-like.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Creates a JobId for a leaf insertion from its stream position.
    ///
    /// The `-1` suffix matches the entry id format of the insertion log, so
    /// a job and its log entry can be correlated directly.
    pub fn from_stream_position(merkle_index: u64) -> Self {
        Self(format!("{merkle_index}-1"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A kind-prefixed key for a logical resource that at most one in-flight
/// job may hold at a time.
///
/// Nullifiers are prefixed with `NULLIFIER_`, tree leaf slots with `LEAF_`,
/// so the two actors can never collide even if they were pointed at the
/// same database.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Creates a resource key for a nullifier.
    pub fn nullifier(nullifier: H256) -> Self {
        Self(format!("NULLIFIER_{}", hex::encode(nullifier.as_bytes())))
    }

    /// Creates a resource key for an absolute tree leaf index.
    pub fn leaf_index(merkle_index: u64) -> Self {
        Self(format!("LEAF_{merkle_index}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The batching tier an operation is admitted into.
///
/// Each tier is backed by its own named queue with its own staleness
/// window, so low-urgency operations can wait longer for peers and fill
/// larger portions of their batches.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum BatchSpeed {
    /// Short staleness window, cut quickly.
    Fast,
    /// The default tier.
    #[default]
    Medium,
    /// Long staleness window, cheapest per-operation.
    Slow,
}

impl Display for BatchSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Medium => write!(f, "medium"),
            Self::Slow => write!(f, "slow"),
        }
    }
}

/// The name of a durable FIFO queue.
///
/// One named queue exists per operation batch-speed tier, plus one for the
/// leaf insertion stream. Operation queues and the insertion queue are
/// separate namespaces and never share items.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    /// The operations queue for the given batch-speed tier.
    pub fn operations(speed: BatchSpeed) -> Self {
        Self(format!("ops_{speed}"))
    }

    /// The leaf insertions queue.
    pub fn leaf_insertions() -> Self {
        Self("leaf_insertions".into())
    }

    /// Returns the queue name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle status of a job.
///
/// Transitions only ever move forward; the relay engine is responsible for
/// never writing a backward transition, the store records blindly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Admitted, conflict-reserved, sitting in the durable queue.
    Queued,
    /// Selected into a cut batch, removed from the queue, awaiting
    /// proof generation and submission.
    InBatch,
    /// Submitted to chain, awaiting the receipt.
    InFlight,
    /// Terminal: the batch carrying this job landed on chain.
    ExecutedSuccess,
    /// Terminal: the batch carrying this job failed to land.
    ExecutedFailed,
}

impl JobStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ExecutedSuccess | Self::ExecutedFailed)
    }
}

/// The envelope stored in a durable queue: the job payload plus the
/// metadata the batching window needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob<T> {
    /// The job id, issued at admission.
    pub id: JobId,
    /// The wrapped job payload.
    pub inner: T,
    /// Unix millis timestamp of admission; the window start of any batch
    /// is the `enqueued_at` of its first job.
    pub enqueued_at: u64,
}

impl<T> QueuedJob<T> {
    /// Wraps a job for admission, stamping the current time.
    pub fn new(id: JobId, inner: T) -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("Time went backwards");
        Self {
            id,
            inner,
            enqueued_at: now.as_millis() as u64,
        }
    }
}

/// A single entry of the insertion log: what a given merkle index holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InsertionEntry {
    /// A real leaf commitment.
    Leaf(H256),
    /// The index was padded with a zero by a batch fill.
    ZeroFill,
}

/// A compound ordering key for events delivered by the insertion event
/// source: block number first, intra-block order second.
///
/// Consumers persist the last index they fully processed and resume from
/// it after a restart, so the stream is replayed without gaps; duplicate
/// deliveries are absorbed by the conflict reservations downstream.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct TotalEntityIndex {
    /// The block the event was included in.
    pub block_number: u64,
    /// The position of the event inside that block.
    pub intra_block: u32,
}

impl TotalEntityIndex {
    /// Creates a new index from its parts.
    pub fn new(block_number: u64, intra_block: u32) -> Self {
        Self {
            block_number,
            intra_block,
        }
    }

    /// Big-endian byte encoding, ordered the same way the index orders.
    pub fn to_bytes(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..8].copy_from_slice(&self.block_number.to_be_bytes());
        out[8..12].copy_from_slice(&self.intra_block.to_be_bytes());
        out
    }

    /// Decodes an index from its byte encoding.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let block: [u8; 8] = bytes.get(0..8)?.try_into().ok()?;
        let intra: [u8; 4] = bytes.get(8..12)?.try_into().ok()?;
        Some(Self {
            block_number: u64::from_be_bytes(block),
            intra_block: u32::from_be_bytes(intra),
        })
    }
}

impl Display for TotalEntityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block_number, self.intra_block)
    }
}

/// A Durable Queue Store is an ordered, persistent, append-only FIFO of
/// jobs keyed by sequence position.
///
/// All operations are atomic with respect to concurrent callers on the
/// same named queue. Store unavailability is fatal to the calling
/// operation and is propagated, never swallowed.
pub trait DurableQueueStore<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Appends a job to the back of the queue.
    fn push(&self, queue: &QueueName, job: QueuedJob<T>) -> Result<()>;

    /// Reads up to `count` jobs from the head without removing them.
    ///
    /// With `exact` set, returns `None` unless at least `count` jobs are
    /// present, which implements "full batch or nothing" reads. Without
    /// it, returns `None` only when the queue is empty.
    fn peek_range(
        &self,
        queue: &QueueName,
        count: usize,
        exact: bool,
    ) -> Result<Option<Vec<QueuedJob<T>>>>;

    /// Removes and returns up to `count` jobs from the head, or `None`
    /// when the queue is empty. The removal is all-or-nothing.
    fn pop_front(
        &self,
        queue: &QueueName,
        count: usize,
    ) -> Result<Option<Vec<QueuedJob<T>>>>;

    /// The number of jobs currently in the queue.
    fn queue_depth(&self, queue: &QueueName) -> Result<usize>;

    /// The admission timestamp of the current head job, or `None` when the
    /// queue is empty.
    ///
    /// This is the window start used for staleness-based batch cutting; it
    /// is derived from the head item itself so it can never drift from the
    /// queue contents.
    fn window_start(&self, queue: &QueueName) -> Result<Option<u64>>;
}

/// A Conflict Store maps resource keys to the job currently holding them.
///
/// At most one live reservation exists per key at any time; a key with no
/// reservation is free. Reservations are created together with admission
/// and removed only on a terminal outcome.
pub trait ConflictStore: Send + Sync {
    /// Unconditionally (re)binds `key -> owner`.
    fn reserve(&self, key: &ResourceKey, owner: &JobId) -> Result<()>;

    /// Whether `key` is currently bound to any owner.
    fn has_conflict(&self, key: &ResourceKey) -> Result<bool>;

    /// The job currently holding `key`, if any.
    fn reservation_owner(&self, key: &ResourceKey) -> Result<Option<JobId>>;

    /// Removes the binding for `key`.
    fn release(&self, key: &ResourceKey) -> Result<()>;
}

/// A Status Store records the current lifecycle state of each job.
///
/// The store performs no validation of transition legality; that is the
/// relay engine's responsibility.
pub trait StatusStore: Send + Sync {
    /// Records `status` for the job.
    fn set_status(&self, id: &JobId, status: JobStatus) -> Result<()>;

    /// Reads the last recorded status of the job, if any.
    fn get_status(&self, id: &JobId) -> Result<Option<JobStatus>>;
}

/// The append-only log of what every merkle index holds.
///
/// Entry ids are the zero-padded index followed by `-1`, so the backing
/// store's native byte ordering is index-monotonic. Once the chain has
/// confirmed up to an index, that index holds exactly one entry: a leaf or
/// a zero-fill marker, never both, never neither.
pub trait InsertionLogStore: Send + Sync {
    /// Records the entry for `merkle_index`.
    ///
    /// Recording the same entry twice is a no-op, which makes stream
    /// replays after a crash harmless. Recording a *different* entry for
    /// an index that is already taken is an error.
    fn record_insertion(
        &self,
        merkle_index: u64,
        entry: InsertionEntry,
    ) -> Result<()>;

    /// Reads the entry at `merkle_index`, if recorded.
    fn get_insertion(&self, merkle_index: u64)
        -> Result<Option<InsertionEntry>>;

    /// The next unassigned merkle index.
    fn next_insertion_index(&self) -> Result<u64>;

    /// All recorded entries, in index order.
    fn insertions(
        &self,
    ) -> Result<std::collections::BTreeMap<u64, InsertionEntry>>;
}

/// Persists the resume position of an ordered event stream, per source.
pub trait StreamPositionStore: Send + Sync {
    /// Records the last fully processed index for `source`.
    fn set_stream_position(
        &self,
        source: &str,
        index: TotalEntityIndex,
    ) -> Result<()>;

    /// Reads the last fully processed index for `source`, if any.
    fn get_stream_position(
        &self,
        source: &str,
    ) -> Result<Option<TotalEntityIndex>>;
}

/// The combined store interface the relay engine drives.
///
/// The three extra operations are the atomic groups that keep the queue,
/// the conflict reservations and the statuses consistent with each other:
/// each one either fully happens or does not happen at all, even with
/// concurrent admissions racing from other tasks or other replicas
/// sharing the same database.
pub trait RelayStore<T>:
    DurableQueueStore<T> + ConflictStore + StatusStore
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Admits a job: reserves every resource key, enqueues the job and
    /// records [`JobStatus::Queued`], all in one atomic group.
    ///
    /// Fails with [`veil_relayer_utils::Error::ResourceConflict`] if any
    /// key is already reserved, in which case nothing is written.
    fn admit_job(
        &self,
        queue: &QueueName,
        job: &QueuedJob<T>,
        keys: &[ResourceKey],
    ) -> Result<()>;

    /// Removes up to `count` jobs from the head of the queue and marks
    /// every one of them [`JobStatus::InBatch`], atomically. Returns
    /// `None` when the queue is empty.
    fn pop_batch(
        &self,
        queue: &QueueName,
        count: usize,
    ) -> Result<Option<Vec<QueuedJob<T>>>>;

    /// Records the terminal `status` for every job of a batch and
    /// releases every reservation the batch held, atomically.
    fn complete_batch(
        &self,
        ids: &[JobId],
        keys: &[ResourceKey],
        status: JobStatus,
    ) -> Result<()>;
}

impl<S, T> DurableQueueStore<T> for Arc<S>
where
    S: DurableQueueStore<T>,
    T: Serialize + DeserializeOwned + Clone,
{
    fn push(&self, queue: &QueueName, job: QueuedJob<T>) -> Result<()> {
        S::push(self, queue, job)
    }

    fn peek_range(
        &self,
        queue: &QueueName,
        count: usize,
        exact: bool,
    ) -> Result<Option<Vec<QueuedJob<T>>>> {
        S::peek_range(self, queue, count, exact)
    }

    fn pop_front(
        &self,
        queue: &QueueName,
        count: usize,
    ) -> Result<Option<Vec<QueuedJob<T>>>> {
        S::pop_front(self, queue, count)
    }

    fn queue_depth(&self, queue: &QueueName) -> Result<usize> {
        S::queue_depth(self, queue)
    }

    fn window_start(&self, queue: &QueueName) -> Result<Option<u64>> {
        S::window_start(self, queue)
    }
}

impl<S> ConflictStore for Arc<S>
where
    S: ConflictStore,
{
    fn reserve(&self, key: &ResourceKey, owner: &JobId) -> Result<()> {
        S::reserve(self, key, owner)
    }

    fn has_conflict(&self, key: &ResourceKey) -> Result<bool> {
        S::has_conflict(self, key)
    }

    fn reservation_owner(&self, key: &ResourceKey) -> Result<Option<JobId>> {
        S::reservation_owner(self, key)
    }

    fn release(&self, key: &ResourceKey) -> Result<()> {
        S::release(self, key)
    }
}

impl<S> StatusStore for Arc<S>
where
    S: StatusStore,
{
    fn set_status(&self, id: &JobId, status: JobStatus) -> Result<()> {
        S::set_status(self, id, status)
    }

    fn get_status(&self, id: &JobId) -> Result<Option<JobStatus>> {
        S::get_status(self, id)
    }
}

impl<S, T> RelayStore<T> for Arc<S>
where
    S: RelayStore<T>,
    T: Serialize + DeserializeOwned + Clone,
{
    fn admit_job(
        &self,
        queue: &QueueName,
        job: &QueuedJob<T>,
        keys: &[ResourceKey],
    ) -> Result<()> {
        S::admit_job(self, queue, job, keys)
    }

    fn pop_batch(
        &self,
        queue: &QueueName,
        count: usize,
    ) -> Result<Option<Vec<QueuedJob<T>>>> {
        S::pop_batch(self, queue, count)
    }

    fn complete_batch(
        &self,
        ids: &[JobId],
        keys: &[ResourceKey],
        status: JobStatus,
    ) -> Result<()> {
        S::complete_batch(self, ids, keys, status)
    }
}

impl<S> InsertionLogStore for Arc<S>
where
    S: InsertionLogStore,
{
    fn record_insertion(
        &self,
        merkle_index: u64,
        entry: InsertionEntry,
    ) -> Result<()> {
        S::record_insertion(self, merkle_index, entry)
    }

    fn get_insertion(
        &self,
        merkle_index: u64,
    ) -> Result<Option<InsertionEntry>> {
        S::get_insertion(self, merkle_index)
    }

    fn next_insertion_index(&self) -> Result<u64> {
        S::next_insertion_index(self)
    }

    fn insertions(
        &self,
    ) -> Result<std::collections::BTreeMap<u64, InsertionEntry>> {
        S::insertions(self)
    }
}

impl<S> StreamPositionStore for Arc<S>
where
    S: StreamPositionStore,
{
    fn set_stream_position(
        &self,
        source: &str,
        index: TotalEntityIndex,
    ) -> Result<()> {
        S::set_stream_position(self, source, index)
    }

    fn get_stream_position(
        &self,
        source: &str,
    ) -> Result<Option<TotalEntityIndex>> {
        S::get_stream_position(self, source)
    }
}
