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

use parking_lot::Mutex;
use veil_relayer_store::TotalEntityIndex;

use crate::{InsertionEvent, LeafEventSource};

/// An in-memory event source, fed by hand.
///
/// Serves events in total order regardless of the order they were pushed,
/// the same guarantee a real indexed event log provides.
#[derive(Clone, Default)]
pub struct MockedLeafEventSource {
    events: Arc<Mutex<Vec<InsertionEvent>>>,
}

impl MockedLeafEventSource {
    /// Creates a new empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single event to the stream.
    pub fn push_event(&self, event: InsertionEvent) {
        self.events.lock().push(event);
    }

    /// Adds a batch of events to the stream.
    pub fn extend<I: IntoIterator<Item = InsertionEvent>>(&self, events: I) {
        self.events.lock().extend(events);
    }
}

#[async_trait::async_trait]
impl LeafEventSource for MockedLeafEventSource {
    async fn poll_insertions(
        &self,
        after: Option<TotalEntityIndex>,
        limit: usize,
    ) -> veil_relayer_utils::Result<Vec<InsertionEvent>> {
        let mut matching: Vec<InsertionEvent> = self
            .events
            .lock()
            .iter()
            .filter(|event| match after {
                Some(after) => event.total_index > after,
                None => true,
            })
            .copied()
            .collect();
        matching.sort_by_key(|event| event.total_index);
        matching.truncate(limit);
        Ok(matching)
    }
}
