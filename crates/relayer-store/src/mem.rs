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

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use veil_relayer_utils::Error;

use super::{
    ConflictStore, DurableQueueStore, InsertionEntry, InsertionLogStore,
    JobId, JobStatus, QueueName, QueuedJob, RelayStore, ResourceKey,
    StatusStore, StreamPositionStore, TotalEntityIndex,
};

#[derive(Default)]
struct Inner {
    /// Serialized queue items, per named queue, in FIFO order.
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    reservations: HashMap<String, JobId>,
    statuses: HashMap<String, JobStatus>,
    insertion_log: BTreeMap<u64, InsertionEntry>,
    stream_positions: HashMap<String, TotalEntityIndex>,
}

/// InMemoryStore keeps the relayer state in memory.
///
/// A single mutex guards the whole state, which gives every combined
/// operation the same all-or-nothing behavior as the sled-backed store's
/// multi-tree transactions. Items are stored in their serialized form so
/// both backends round-trip jobs the same way.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl InMemoryStore {
    /// Creates a new empty InMemoryStore.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> DurableQueueStore<T> for InMemoryStore
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    fn push(&self, queue: &QueueName, job: QueuedJob<T>) -> crate::Result<()> {
        let bytes = serde_json::to_vec(&job)?;
        let mut guard = self.inner.lock();
        guard
            .queues
            .entry(queue.as_str().to_owned())
            .or_default()
            .push_back(bytes);
        Ok(())
    }

    fn peek_range(
        &self,
        queue: &QueueName,
        count: usize,
        exact: bool,
    ) -> crate::Result<Option<Vec<QueuedJob<T>>>> {
        let guard = self.inner.lock();
        let items = match guard.queues.get(queue.as_str()) {
            Some(q) => q
                .iter()
                .take(count)
                .map(|bytes| serde_json::from_slice(bytes))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        if items.is_empty() || (exact && items.len() < count) {
            return Ok(None);
        }
        Ok(Some(items))
    }

    fn pop_front(
        &self,
        queue: &QueueName,
        count: usize,
    ) -> crate::Result<Option<Vec<QueuedJob<T>>>> {
        let mut guard = self.inner.lock();
        let q = match guard.queues.get_mut(queue.as_str()) {
            Some(q) if !q.is_empty() => q,
            _ => return Ok(None),
        };
        let taken = core::cmp::min(count, q.len());
        let items = q
            .drain(..taken)
            .map(|bytes| serde_json::from_slice(&bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(items))
    }

    fn queue_depth(&self, queue: &QueueName) -> crate::Result<usize> {
        let guard = self.inner.lock();
        Ok(guard.queues.get(queue.as_str()).map_or(0, VecDeque::len))
    }

    fn window_start(&self, queue: &QueueName) -> crate::Result<Option<u64>> {
        let guard = self.inner.lock();
        let head = match guard.queues.get(queue.as_str()).and_then(|q| {
            q.front()
        }) {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let job: QueuedJob<T> = serde_json::from_slice(head)?;
        Ok(Some(job.enqueued_at))
    }
}

impl ConflictStore for InMemoryStore {
    fn reserve(&self, key: &ResourceKey, owner: &JobId) -> crate::Result<()> {
        self.inner
            .lock()
            .reservations
            .insert(key.as_str().to_owned(), owner.clone());
        Ok(())
    }

    fn has_conflict(&self, key: &ResourceKey) -> crate::Result<bool> {
        Ok(self.inner.lock().reservations.contains_key(key.as_str()))
    }

    fn reservation_owner(
        &self,
        key: &ResourceKey,
    ) -> crate::Result<Option<JobId>> {
        Ok(self.inner.lock().reservations.get(key.as_str()).cloned())
    }

    fn release(&self, key: &ResourceKey) -> crate::Result<()> {
        self.inner.lock().reservations.remove(key.as_str());
        Ok(())
    }
}

impl StatusStore for InMemoryStore {
    fn set_status(&self, id: &JobId, status: JobStatus) -> crate::Result<()> {
        self.inner
            .lock()
            .statuses
            .insert(id.as_str().to_owned(), status);
        Ok(())
    }

    fn get_status(&self, id: &JobId) -> crate::Result<Option<JobStatus>> {
        Ok(self.inner.lock().statuses.get(id.as_str()).copied())
    }
}

impl<T> RelayStore<T> for InMemoryStore
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    fn admit_job(
        &self,
        queue: &QueueName,
        job: &QueuedJob<T>,
        keys: &[ResourceKey],
    ) -> crate::Result<()> {
        let bytes = serde_json::to_vec(job)?;
        let mut guard = self.inner.lock();
        for key in keys {
            if guard.reservations.contains_key(key.as_str()) {
                return Err(Error::ResourceConflict {
                    key: key.to_string(),
                });
            }
        }
        for key in keys {
            guard
                .reservations
                .insert(key.as_str().to_owned(), job.id.clone());
        }
        guard
            .queues
            .entry(queue.as_str().to_owned())
            .or_default()
            .push_back(bytes);
        guard
            .statuses
            .insert(job.id.as_str().to_owned(), JobStatus::Queued);
        Ok(())
    }

    fn pop_batch(
        &self,
        queue: &QueueName,
        count: usize,
    ) -> crate::Result<Option<Vec<QueuedJob<T>>>> {
        let mut guard = self.inner.lock();
        let q = match guard.queues.get_mut(queue.as_str()) {
            Some(q) if !q.is_empty() => q,
            _ => return Ok(None),
        };
        let taken = core::cmp::min(count, q.len());
        let items: Vec<QueuedJob<T>> = q
            .drain(..taken)
            .map(|bytes| serde_json::from_slice(&bytes))
            .collect::<Result<Vec<_>, _>>()?;
        for job in &items {
            guard
                .statuses
                .insert(job.id.as_str().to_owned(), JobStatus::InBatch);
        }
        Ok(Some(items))
    }

    fn complete_batch(
        &self,
        ids: &[JobId],
        keys: &[ResourceKey],
        status: JobStatus,
    ) -> crate::Result<()> {
        let mut guard = self.inner.lock();
        for id in ids {
            guard.statuses.insert(id.as_str().to_owned(), status);
        }
        for key in keys {
            guard.reservations.remove(key.as_str());
        }
        Ok(())
    }
}

impl InsertionLogStore for InMemoryStore {
    fn record_insertion(
        &self,
        merkle_index: u64,
        entry: InsertionEntry,
    ) -> crate::Result<()> {
        let mut guard = self.inner.lock();
        match guard.insertion_log.get(&merkle_index) {
            Some(existing) if *existing == entry => Ok(()),
            Some(_) => Err(Error::InconsistentInsertionLog(merkle_index)),
            None => {
                guard.insertion_log.insert(merkle_index, entry);
                Ok(())
            }
        }
    }

    fn get_insertion(
        &self,
        merkle_index: u64,
    ) -> crate::Result<Option<InsertionEntry>> {
        Ok(self.inner.lock().insertion_log.get(&merkle_index).copied())
    }

    fn next_insertion_index(&self) -> crate::Result<u64> {
        Ok(self
            .inner
            .lock()
            .insertion_log
            .keys()
            .next_back()
            .map_or(0, |idx| idx + 1))
    }

    fn insertions(
        &self,
    ) -> crate::Result<BTreeMap<u64, InsertionEntry>> {
        Ok(self.inner.lock().insertion_log.clone())
    }
}

impl StreamPositionStore for InMemoryStore {
    fn set_stream_position(
        &self,
        source: &str,
        index: TotalEntityIndex,
    ) -> crate::Result<()> {
        self.inner
            .lock()
            .stream_positions
            .insert(source.to_owned(), index);
        Ok(())
    }

    fn get_stream_position(
        &self,
        source: &str,
    ) -> crate::Result<Option<TotalEntityIndex>> {
        Ok(self.inner.lock().stream_positions.get(source).copied())
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

    #[test]
    fn concurrent_admissions_with_a_shared_key_admit_exactly_one() {
        let store = Arc::new(InMemoryStore::new());
        let queue = QueueName::operations(crate::BatchSpeed::Medium);
        let shared = ResourceKey::nullifier(H256::repeat_byte(1));

        let handles: Vec<_> = (0..8u32)
            .map(|n| {
                let store = store.clone();
                let queue = queue.clone();
                let shared = shared.clone();
                std::thread::spawn(move || {
                    let job = QueuedJob::new(
                        JobId::new(format!("job-{n}")),
                        TestJob { n },
                    );
                    store.admit_job(&queue, &job, &[shared])
                })
            })
            .collect();

        let results: Vec<_> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let conflicted = results
            .iter()
            .filter(|r| {
                matches!(r, Err(Error::ResourceConflict { .. }))
            })
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(conflicted, 7);
        assert_eq!(
            DurableQueueStore::<TestJob>::queue_depth(&*store, &queue)
                .unwrap(),
            1
        );
    }

    #[test]
    fn pop_front_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let queue = QueueName::leaf_insertions();
        for n in 0..2u32 {
            store
                .push(
                    &queue,
                    QueuedJob::new(JobId::new(format!("j{n}")), TestJob { n }),
                )
                .unwrap();
        }
        let popped: Vec<QueuedJob<TestJob>> =
            store.pop_front(&queue, 5).unwrap().unwrap();
        assert_eq!(popped.len(), 2);
        assert!(DurableQueueStore::<TestJob>::pop_front(&store, &queue, 1)
            .unwrap()
            .is_none());
    }
}
