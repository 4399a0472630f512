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

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult,
    TransactionError, TransactionResult, TransactionalTree,
};
use sled::Transactional;
use veil_relayer_utils::Error;

use super::{
    ConflictStore, DurableQueueStore, InsertionEntry, InsertionLogStore,
    JobId, JobStatus, QueueName, QueuedJob, RelayStore, ResourceKey,
    StatusStore, StreamPositionStore, TotalEntityIndex,
};

/// Prefix of every queue item key inside a queue tree.
const ITEM_PREFIX: &[u8; 4] = b"item";
/// The per-queue counter the item keys are derived from.
const LAST_ITEM_IDX_KEY: &str = "last_item_idx";

/// Conflict reservations and job statuses share one tree, so admission
/// (queue + reservations + status) and terminal completion (statuses +
/// releases) each fit in a single- or two-tree transaction. Reservation
/// keys carry their kind prefix (`NULLIFIER_`, `LEAF_`), status keys a
/// `STATUS_` prefix; the namespaces cannot collide.
const RELAY_STATE_TREE: &str = "relay_state";
const STATUS_KEY_PREFIX: &str = "STATUS_";

const INSERTION_LOG_TREE: &str = "insertion_log";
const STREAM_POSITIONS_TREE: &str = "stream_positions";

/// SledStore persists the relayer state in a [Sled](https://sled.rs)-based
/// database.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Create a new SledStore.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .temporary(cfg!(test))
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Ok(Self { db })
    }

    /// Creates a temporary SledStore.
    pub fn temporary() -> crate::Result<Self> {
        let dir = tempfile::tempdir()?;
        Self::open(dir.path())
    }

    /// Gets the total amount of data stored on disk.
    pub fn get_data_stored_size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or_default()
    }

    fn queue_tree(&self, queue: &QueueName) -> crate::Result<sled::Tree> {
        Ok(self.db.open_tree(format!("queue_{queue}"))?)
    }

    fn relay_state_tree(&self) -> crate::Result<sled::Tree> {
        Ok(self.db.open_tree(RELAY_STATE_TREE)?)
    }

    fn insertion_log_tree(&self) -> crate::Result<sled::Tree> {
        Ok(self.db.open_tree(INSERTION_LOG_TREE)?)
    }

    fn stream_positions_tree(&self) -> crate::Result<sled::Tree> {
        Ok(self.db.open_tree(STREAM_POSITIONS_TREE)?)
    }

    /// Reads and deserializes the first `count` items of the queue tree,
    /// together with their keys.
    fn head_items<T: DeserializeOwned>(
        tree: &sled::Tree,
        count: usize,
    ) -> crate::Result<Vec<(sled::IVec, QueuedJob<T>)>> {
        let mut items = Vec::with_capacity(count);
        for kv in tree.scan_prefix(ITEM_PREFIX).take(count) {
            let (key, value) = kv?;
            let job = serde_json::from_slice(&value)?;
            items.push((key, job));
        }
        Ok(items)
    }
}

/// Allocates the next item key inside a queue transaction.
///
/// Item keys are the 4 byte `item` prefix followed by 8 big-endian bytes of
/// a monotonically increasing counter, so iteration order is insertion
/// order.
fn next_item_key(
    qt: &TransactionalTree,
) -> ConflictableTransactionResult<[u8; 12], Error> {
    let last_item_idx = match qt.get(LAST_ITEM_IDX_KEY)? {
        Some(v) => {
            let mut output = [0u8; 8];
            output.copy_from_slice(&v);
            u64::from_be_bytes(output)
        }
        None => 0u64,
    };
    let next_idx = last_item_idx + 1u64;
    let idx_bytes = next_idx.to_be_bytes();
    qt.insert(LAST_ITEM_IDX_KEY, &idx_bytes)?;
    let mut item_key = [0u8; 4 + core::mem::size_of::<u64>()];
    item_key[0..4].copy_from_slice(ITEM_PREFIX);
    item_key[4..].copy_from_slice(&idx_bytes);
    Ok(item_key)
}

/// Entry ids of the insertion log: the zero-padded merkle index followed by
/// `-1`, which keeps the tree's byte ordering index-monotonic.
fn insertion_log_key(merkle_index: u64) -> String {
    format!("{merkle_index:020}-1")
}

fn parse_insertion_log_key(key: &[u8]) -> Option<u64> {
    let s = core::str::from_utf8(key).ok()?;
    s.strip_suffix("-1")?.parse().ok()
}

fn status_key(id: &JobId) -> String {
    format!("{STATUS_KEY_PREFIX}{id}")
}

impl<T> DurableQueueStore<T> for SledStore
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    #[tracing::instrument(skip_all, fields(queue = %queue, job_id = %job.id))]
    fn push(&self, queue: &QueueName, job: QueuedJob<T>) -> crate::Result<()> {
        let tree = self.queue_tree(queue)?;
        let item_bytes = serde_json::to_vec(&job)?;
        // a single transaction, so a crash mid-push can never leave the
        // counter and the item out of sync.
        tree.transaction::<_, _, Error>(|qt| {
            let item_key = next_item_key(qt)?;
            qt.insert(&item_key[..], item_bytes.as_slice())?;
            Ok(())
        })?;
        self.db.flush()?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(queue = %queue, count, exact))]
    fn peek_range(
        &self,
        queue: &QueueName,
        count: usize,
        exact: bool,
    ) -> crate::Result<Option<Vec<QueuedJob<T>>>> {
        let tree = self.queue_tree(queue)?;
        let items = Self::head_items(&tree, count)?;
        if items.is_empty() || (exact && items.len() < count) {
            return Ok(None);
        }
        Ok(Some(items.into_iter().map(|(_, job)| job).collect()))
    }

    #[tracing::instrument(skip_all, fields(queue = %queue, count))]
    fn pop_front(
        &self,
        queue: &QueueName,
        count: usize,
    ) -> crate::Result<Option<Vec<QueuedJob<T>>>> {
        loop {
            let tree = self.queue_tree(queue)?;
            let items = Self::head_items(&tree, count)?;
            if items.is_empty() {
                return Ok(None);
            }
            let result: TransactionResult<(), Error> =
                tree.transaction(|qt| {
                    for (key, _) in &items {
                        if qt.remove(key.clone())?.is_none() {
                            // a concurrent caller beat us to one of the
                            // candidates; roll the whole pop back.
                            return Err(ConflictableTransactionError::Abort(
                                Error::ForceRestart,
                            ));
                        }
                    }
                    Ok(())
                });
            match result {
                Ok(()) => {
                    self.db.flush()?;
                    return Ok(Some(
                        items.into_iter().map(|(_, job)| job).collect(),
                    ));
                }
                Err(TransactionError::Abort(_)) => continue,
                Err(TransactionError::Storage(e)) => return Err(e.into()),
            }
        }
    }

    fn queue_depth(&self, queue: &QueueName) -> crate::Result<usize> {
        let tree = self.queue_tree(queue)?;
        Ok(tree.scan_prefix(ITEM_PREFIX).flatten().count())
    }

    fn window_start(&self, queue: &QueueName) -> crate::Result<Option<u64>> {
        let tree = self.queue_tree(queue)?;
        let items: Vec<(_, QueuedJob<T>)> = Self::head_items(&tree, 1)?;
        Ok(items.first().map(|(_, job)| job.enqueued_at))
    }
}

impl ConflictStore for SledStore {
    #[tracing::instrument(skip(self))]
    fn reserve(&self, key: &ResourceKey, owner: &JobId) -> crate::Result<()> {
        let tree = self.relay_state_tree()?;
        tree.insert(key.as_str(), owner.as_str())?;
        self.db.flush()?;
        Ok(())
    }

    fn has_conflict(&self, key: &ResourceKey) -> crate::Result<bool> {
        let tree = self.relay_state_tree()?;
        Ok(tree.contains_key(key.as_str())?)
    }

    fn reservation_owner(
        &self,
        key: &ResourceKey,
    ) -> crate::Result<Option<JobId>> {
        let tree = self.relay_state_tree()?;
        let owner = tree.get(key.as_str())?.map(|v| {
            JobId::new(String::from_utf8_lossy(&v).into_owned())
        });
        Ok(owner)
    }

    #[tracing::instrument(skip(self))]
    fn release(&self, key: &ResourceKey) -> crate::Result<()> {
        let tree = self.relay_state_tree()?;
        tree.remove(key.as_str())?;
        self.db.flush()?;
        Ok(())
    }
}

impl StatusStore for SledStore {
    #[tracing::instrument(skip(self))]
    fn set_status(&self, id: &JobId, status: JobStatus) -> crate::Result<()> {
        let tree = self.relay_state_tree()?;
        tree.insert(status_key(id).as_str(), serde_json::to_vec(&status)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn get_status(&self, id: &JobId) -> crate::Result<Option<JobStatus>> {
        let tree = self.relay_state_tree()?;
        match tree.get(status_key(id).as_str())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<T> RelayStore<T> for SledStore
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    #[tracing::instrument(skip_all, fields(queue = %queue, job_id = %job.id))]
    fn admit_job(
        &self,
        queue: &QueueName,
        job: &QueuedJob<T>,
        keys: &[ResourceKey],
    ) -> crate::Result<()> {
        let qt = self.queue_tree(queue)?;
        let st = self.relay_state_tree()?;
        let item_bytes = serde_json::to_vec(job)?;
        let status_bytes = serde_json::to_vec(&JobStatus::Queued)?;
        let job_status_key = status_key(&job.id);
        // reservations, enqueue and status are one atomic group: either
        // the job is fully admitted or nothing is written, even with
        // concurrent admissions racing for the same resource keys.
        let result: TransactionResult<(), Error> =
            (&qt, &st).transaction(|(qt, st)| {
                for key in keys {
                    if st.get(key.as_str())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            Error::ResourceConflict {
                                key: key.to_string(),
                            },
                        ));
                    }
                }
                for key in keys {
                    st.insert(key.as_str(), job.id.as_str())?;
                }
                let item_key = next_item_key(qt)?;
                qt.insert(&item_key[..], item_bytes.as_slice())?;
                st.insert(
                    job_status_key.as_str(),
                    status_bytes.as_slice(),
                )?;
                Ok(())
            });
        result.map_err(Error::from)?;
        self.db.flush()?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(queue = %queue, count))]
    fn pop_batch(
        &self,
        queue: &QueueName,
        count: usize,
    ) -> crate::Result<Option<Vec<QueuedJob<T>>>> {
        let status_bytes = serde_json::to_vec(&JobStatus::InBatch)?;
        loop {
            let qt = self.queue_tree(queue)?;
            let st = self.relay_state_tree()?;
            let items = Self::head_items(&qt, count)?;
            if items.is_empty() {
                return Ok(None);
            }
            let result: TransactionResult<(), Error> =
                (&qt, &st).transaction(|(qt, st)| {
                    for (key, job) in &items {
                        if qt.remove(key.clone())?.is_none() {
                            return Err(ConflictableTransactionError::Abort(
                                Error::ForceRestart,
                            ));
                        }
                        st.insert(
                            status_key(&job.id).as_str(),
                            status_bytes.as_slice(),
                        )?;
                    }
                    Ok(())
                });
            match result {
                Ok(()) => {
                    self.db.flush()?;
                    return Ok(Some(
                        items.into_iter().map(|(_, job)| job).collect(),
                    ));
                }
                Err(TransactionError::Abort(_)) => continue,
                Err(TransactionError::Storage(e)) => return Err(e.into()),
            }
        }
    }

    #[tracing::instrument(skip_all, fields(jobs = ids.len(), ?status))]
    fn complete_batch(
        &self,
        ids: &[JobId],
        keys: &[ResourceKey],
        status: JobStatus,
    ) -> crate::Result<()> {
        let st = self.relay_state_tree()?;
        let status_bytes = serde_json::to_vec(&status)?;
        st.transaction::<_, _, Error>(|st| {
            for id in ids {
                st.insert(status_key(id).as_str(), status_bytes.as_slice())?;
            }
            for key in keys {
                st.remove(key.as_str())?;
            }
            Ok(())
        })?;
        self.db.flush()?;
        Ok(())
    }
}

impl InsertionLogStore for SledStore {
    #[tracing::instrument(skip(self))]
    fn record_insertion(
        &self,
        merkle_index: u64,
        entry: InsertionEntry,
    ) -> crate::Result<()> {
        let tree = self.insertion_log_tree()?;
        let key = insertion_log_key(merkle_index);
        let entry_bytes = serde_json::to_vec(&entry)?;
        tree.transaction::<_, _, Error>(|t| {
            match t.get(key.as_str())? {
                // replaying the exact same entry is harmless; stream
                // consumers hit this after every crash-resume.
                Some(existing) if existing == entry_bytes => Ok(()),
                Some(_) => Err(ConflictableTransactionError::Abort(
                    Error::InconsistentInsertionLog(merkle_index),
                )),
                None => {
                    t.insert(key.as_str(), entry_bytes.as_slice())?;
                    Ok(())
                }
            }
        })?;
        self.db.flush()?;
        Ok(())
    }

    fn get_insertion(
        &self,
        merkle_index: u64,
    ) -> crate::Result<Option<InsertionEntry>> {
        let tree = self.insertion_log_tree()?;
        match tree.get(insertion_log_key(merkle_index))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn next_insertion_index(&self) -> crate::Result<u64> {
        let tree = self.insertion_log_tree()?;
        match tree.last()? {
            Some((key, _)) => {
                Ok(parse_insertion_log_key(&key).map_or(0, |idx| idx + 1))
            }
            None => Ok(0),
        }
    }

    fn insertions(
        &self,
    ) -> crate::Result<BTreeMap<u64, InsertionEntry>> {
        let tree = self.insertion_log_tree()?;
        let mut out = BTreeMap::new();
        for kv in tree.iter() {
            let (key, value) = kv?;
            if let Some(index) = parse_insertion_log_key(&key) {
                out.insert(index, serde_json::from_slice(&value)?);
            }
        }
        Ok(out)
    }
}

impl StreamPositionStore for SledStore {
    #[tracing::instrument(skip(self))]
    fn set_stream_position(
        &self,
        source: &str,
        index: TotalEntityIndex,
    ) -> crate::Result<()> {
        let tree = self.stream_positions_tree()?;
        tree.insert(source, &index.to_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn get_stream_position(
        &self,
        source: &str,
    ) -> crate::Result<Option<TotalEntityIndex>> {
        let tree = self.stream_positions_tree()?;
        Ok(tree.get(source)?.and_then(|v| TotalEntityIndex::from_bytes(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, serde::Serialize, Deserialize)]
    struct TestJob {
        n: u32,
    }

    fn queued(n: u32) -> QueuedJob<TestJob> {
        QueuedJob::new(JobId::new(format!("job-{n}")), TestJob { n })
    }

    #[test]
    fn queue_is_fifo() {
        let store = SledStore::temporary().unwrap();
        let queue = QueueName::operations(crate::BatchSpeed::Medium);
        for n in 0..5u32 {
            store.push(&queue, queued(n)).unwrap();
        }
        assert_eq!(
            DurableQueueStore::<TestJob>::queue_depth(&store, &queue)
                .unwrap(),
            5
        );
        let popped: Vec<QueuedJob<TestJob>> =
            store.pop_front(&queue, 3).unwrap().unwrap();
        assert_eq!(
            popped.iter().map(|j| j.inner.n).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let popped: Vec<QueuedJob<TestJob>> =
            store.pop_front(&queue, 10).unwrap().unwrap();
        assert_eq!(
            popped.iter().map(|j| j.inner.n).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(DurableQueueStore::<TestJob>::pop_front(&store, &queue, 1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn peek_range_exact_needs_a_full_batch() {
        let store = SledStore::temporary().unwrap();
        let queue = QueueName::operations(crate::BatchSpeed::Fast);
        for n in 0..3u32 {
            store.push(&queue, queued(n)).unwrap();
        }
        let peeked: Option<Vec<QueuedJob<TestJob>>> =
            store.peek_range(&queue, 4, true).unwrap();
        assert!(peeked.is_none());
        let peeked: Vec<QueuedJob<TestJob>> =
            store.peek_range(&queue, 4, false).unwrap().unwrap();
        assert_eq!(peeked.len(), 3);
        // peeking does not remove
        assert_eq!(
            DurableQueueStore::<TestJob>::queue_depth(&store, &queue)
                .unwrap(),
            3
        );
    }

    #[test]
    fn admit_job_rejects_conflicting_reservations() {
        let store = SledStore::temporary().unwrap();
        let queue = QueueName::operations(crate::BatchSpeed::Medium);
        let shared = ResourceKey::nullifier(H256::repeat_byte(1));
        let free = ResourceKey::nullifier(H256::repeat_byte(2));
        let other = ResourceKey::nullifier(H256::repeat_byte(3));

        let first = queued(1);
        store
            .admit_job(&queue, &first, &[shared.clone(), free.clone()])
            .unwrap();
        assert_eq!(
            store.get_status(&first.id).unwrap(),
            Some(JobStatus::Queued)
        );

        let second = queued(2);
        let err = store
            .admit_job(&queue, &second, &[other.clone(), shared.clone()])
            .unwrap_err();
        assert!(matches!(
            err,
            veil_relayer_utils::Error::ResourceConflict { .. }
        ));
        // the rejected admission must leave no trace behind: no status,
        // no reservation for its non-conflicting key, no queue item.
        assert_eq!(store.get_status(&second.id).unwrap(), None);
        assert!(!store.has_conflict(&other).unwrap());
        assert_eq!(
            DurableQueueStore::<TestJob>::queue_depth(&store, &queue)
                .unwrap(),
            1
        );
    }

    #[test]
    fn pop_batch_marks_jobs_in_batch() {
        let store = SledStore::temporary().unwrap();
        let queue = QueueName::operations(crate::BatchSpeed::Medium);
        let jobs: Vec<_> = (0..4u32).map(queued).collect();
        for job in &jobs {
            store.admit_job(&queue, job, &[]).unwrap();
        }
        let popped: Vec<QueuedJob<TestJob>> =
            store.pop_batch(&queue, 4).unwrap().unwrap();
        assert_eq!(popped.len(), 4);
        for job in &jobs {
            assert_eq!(
                store.get_status(&job.id).unwrap(),
                Some(JobStatus::InBatch)
            );
        }
        assert!(RelayStore::<TestJob>::pop_batch(&store, &queue, 1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn complete_batch_releases_reservations() {
        let store = SledStore::temporary().unwrap();
        let queue = QueueName::operations(crate::BatchSpeed::Medium);
        let key = ResourceKey::nullifier(H256::repeat_byte(9));
        let job = queued(1);
        store.admit_job(&queue, &job, &[key.clone()]).unwrap();
        let _: Option<Vec<QueuedJob<TestJob>>> =
            store.pop_batch(&queue, 1).unwrap();
        RelayStore::<TestJob>::complete_batch(
            &store,
            &[job.id.clone()],
            &[key.clone()],
            JobStatus::ExecutedFailed,
        )
        .unwrap();
        assert_eq!(
            store.get_status(&job.id).unwrap(),
            Some(JobStatus::ExecutedFailed)
        );
        assert!(!store.has_conflict(&key).unwrap());
        // the resource can now be retried in a fresh job.
        let retry = queued(2);
        store.admit_job(&queue, &retry, &[key]).unwrap();
    }

    #[test]
    fn window_start_follows_the_head_item() {
        let store = SledStore::temporary().unwrap();
        let queue = QueueName::operations(crate::BatchSpeed::Slow);
        assert_eq!(
            DurableQueueStore::<TestJob>::window_start(&store, &queue)
                .unwrap(),
            None
        );
        let first = queued(1);
        let first_enqueued_at = first.enqueued_at;
        store.push(&queue, first).unwrap();
        store.push(&queue, queued(2)).unwrap();
        assert_eq!(
            DurableQueueStore::<TestJob>::window_start(&store, &queue)
                .unwrap(),
            Some(first_enqueued_at)
        );
        let _: Option<Vec<QueuedJob<TestJob>>> =
            store.pop_front(&queue, 1).unwrap();
        // the window restarts from the next oldest item.
        assert!(DurableQueueStore::<TestJob>::window_start(&store, &queue)
            .unwrap()
            .is_some());
    }

    #[test]
    fn insertion_log_is_idempotent_but_consistent() {
        let store = SledStore::temporary().unwrap();
        let leaf = InsertionEntry::Leaf(H256::repeat_byte(7));
        store.record_insertion(42, leaf).unwrap();
        // same entry again: fine, this is the replay path.
        store.record_insertion(42, leaf).unwrap();
        // a different entry for a taken index is a corruption signal.
        let err = store
            .record_insertion(42, InsertionEntry::ZeroFill)
            .unwrap_err();
        assert!(matches!(
            err,
            veil_relayer_utils::Error::InconsistentInsertionLog(42)
        ));
        assert_eq!(store.get_insertion(42).unwrap(), Some(leaf));
        assert_eq!(store.next_insertion_index().unwrap(), 43);
    }

    #[test]
    fn insertion_log_orders_by_index() {
        let store = SledStore::temporary().unwrap();
        for index in [3u64, 1, 2, 0, 10] {
            store
                .record_insertion(
                    index,
                    InsertionEntry::Leaf(H256::from_low_u64_be(index)),
                )
                .unwrap();
        }
        let indices: Vec<u64> =
            store.insertions().unwrap().keys().copied().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 10]);
        assert_eq!(store.next_insertion_index().unwrap(), 11);
    }

    #[test]
    fn stream_position_roundtrip() {
        let store = SledStore::temporary().unwrap();
        assert_eq!(store.get_stream_position("leaves").unwrap(), None);
        let index = TotalEntityIndex::new(1337, 4);
        store.set_stream_position("leaves", index).unwrap();
        assert_eq!(store.get_stream_position("leaves").unwrap(), Some(index));
    }
}
