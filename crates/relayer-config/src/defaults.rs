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

/// The default port the bundler API will listen on. Defaults to 9955.
pub const fn relayer_port() -> u16 {
    9955
}
/// Every toggleable section is enabled unless said otherwise.
pub const fn enabled() -> bool {
    true
}
/// The default destination chain id.
pub const fn chain_id() -> u32 {
    1
}
/// The default chain RPC endpoint.
pub fn http_endpoint() -> String {
    String::from("http://localhost:8545")
}
/// Submissions are treated as failed-but-possibly-pending after 2 minutes.
pub const fn submission_timeout_secs() -> u64 {
    120
}
/// The maximum operations per batch is set to `8` by default.
pub const fn max_batch_size() -> usize {
    8
}
/// The fast tier cuts a stale batch after 15 seconds.
pub const fn fast_window_secs() -> u64 {
    15
}
/// The medium tier cuts a stale batch after 60 seconds.
pub const fn medium_window_secs() -> u64 {
    60
}
/// The slow tier cuts a stale batch after 180 seconds.
pub const fn slow_window_secs() -> u64 {
    180
}
/// The batch-cut timer fires every 500 milliseconds by default.
pub const fn poll_interval_millis() -> u64 {
    500
}
/// The fixed subtree batch size is 16 leaves by default.
pub const fn subtree_batch_size() -> usize {
    16
}
/// A partially filled subtree batch is padded after 60 seconds.
pub const fn fill_window_secs() -> u64 {
    60
}
/// The insertion event source is polled every 3 seconds by default.
pub const fn event_polling_interval_millis() -> u64 {
    3_000
}
/// The maximum events per poll step is set to `100` by default.
pub const fn max_events_per_step() -> usize {
    100
}
