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

//! # Batch Engine Module
//!
//! The batched relay engine shared by the Veil relayer actors.
//!
//! ## Overview
//!
//! The engine drives a job from admission to on-chain finality: it
//! conflict-checks and enqueues new jobs, cuts batches when the window
//! policy says so, obtains a proof for each cut batch, and hands it to the
//! submission coordinator, recording every lifecycle step in the status
//! store. The bundler instantiates it over user operations keyed by
//! nullifiers; the subtree updater instantiates it over leaf insertions
//! keyed by merkle indices.

/// The relay engine itself.
pub mod engine;
/// The concrete job kinds the actors relay.
pub mod job;
/// The batch window policy.
pub mod window;

pub use engine::{Batch, RelayEngine};
pub use job::{LeafInsertion, Operation, RelayableJob, TransferComponent};
pub use window::BatchingPolicy;
