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

//! # Veil Subtree Updater
//!
//! The subtree updater actor consumes ordered tree-insertion events,
//! batches new leaves into fixed-size subtrees, pads stale windows with
//! zeros, and commits each proven subtree to the chain exactly once.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The long-running services of the subtree updater actor.
pub mod service;
