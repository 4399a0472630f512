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

#![warn(missing_docs)]

//! # Relayer Configuration Module
//!
//! A module for configuring the Veil relayer actors.
//!
//! ## Overview
//!
//! The configuration is loaded from TOML/JSON files found in a config
//! directory, merged with `VEIL_`-prefixed environment variables. Possible
//! configuration includes:
//! * `port`: The port the bundler API will listen on. Defaults to 9955.
//! * `chain`: The destination chain and submission settings.
//! * `bundler`: Operation batching windows and sizes.
//! * `subtree-updater`: Leaf batching, zero-fill cadence and the insertion
//!   event source.

/// CLI configuration
#[cfg(feature = "cli")]
pub mod cli;
/// Default values for the configuration
pub mod defaults;
/// Utils for processing configuration
pub mod utils;

use serde::{Deserialize, Serialize};

/// VeilRelayerConfig is the configuration for the Veil relayer actors.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct VeilRelayerConfig {
    /// HTTP API port number.
    ///
    /// default to 9955
    #[serde(default = "defaults::relayer_port", skip_serializing)]
    pub port: u16,
    /// The destination chain and submission settings.
    #[serde(default)]
    pub chain: ChainConfig,
    /// Operation batching configuration for the bundler actor.
    #[serde(default)]
    pub bundler: BundlerConfig,
    /// Leaf batching configuration for the subtree updater actor.
    #[serde(default)]
    pub subtree_updater: SubtreeUpdaterConfig,
    /// Configuration for running the relayer.
    ///
    /// by default all features are enabled.
    /// Features:
    /// 1. Data querying over the HTTP API
    /// 2. Operation relaying
    /// 3. Subtree update relaying
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl VeilRelayerConfig {
    /// Makes sure that the config is valid, by going
    /// through the whole config and doing some basic checks.
    pub fn verify(&self) -> veil_relayer_utils::Result<()> {
        // we **must** have an account key when we are actually relaying
        // anything to the chain; a data-serving-only deployment does not
        // need one. The mocked chain backend signs nothing, so it is
        // exempt as well.
        let relaying =
            self.features.operation_relay || self.features.subtree_relay;
        let needs_secrets =
            relaying && !matches!(self.chain.backend, ChainBackendConfig::Mocked);
        if needs_secrets && self.chain.account_key.is_none() {
            return Err(veil_relayer_utils::Error::MissingSecrets);
        }
        Ok(())
    }
}

/// The destination chain and the submission path settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    /// The chain id of the destination chain.
    #[serde(default = "defaults::chain_id")]
    pub chain_id: u32,
    /// Http endpoint of the chain RPC node.
    #[serde(default = "defaults::http_endpoint")]
    pub http_endpoint: String,
    /// The relayer account key used for submissions.
    ///
    /// Submissions from one account must carry strictly increasing
    /// sequence numbers, which is why the submission path is serialized
    /// per account.
    #[serde(skip_serializing)]
    pub account_key: Option<String>,
    /// How long to wait for a submission before treating it as
    /// failed-but-possibly-pending, in seconds.
    #[serde(default = "defaults::submission_timeout_secs")]
    pub submission_timeout_secs: u64,
    /// Which chain backend implementation to submit through.
    #[serde(default)]
    pub backend: ChainBackendConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: defaults::chain_id(),
            http_endpoint: defaults::http_endpoint(),
            account_key: None,
            submission_timeout_secs: defaults::submission_timeout_secs(),
            backend: ChainBackendConfig::default(),
        }
    }
}

/// Which chain backend the submission coordinator drives.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChainBackendConfig {
    /// An in-process mocked chain, used for local development and tests.
    #[default]
    Mocked,
}

/// Operation batching configuration for the bundler actor.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundlerConfig {
    /// if the bundler is enabled or not.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    /// The maximum number of operations per batch.
    #[serde(default = "defaults::max_batch_size")]
    pub max_batch_size: usize,
    /// Staleness windows per batch-speed tier, in seconds.
    #[serde(default)]
    pub batch_windows: BatchWindowsConfig,
    /// How often the batch-cut timer fires, in milliseconds.
    #[serde(default = "defaults::poll_interval_millis")]
    pub poll_interval_millis: u64,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            max_batch_size: defaults::max_batch_size(),
            batch_windows: BatchWindowsConfig::default(),
            poll_interval_millis: defaults::poll_interval_millis(),
        }
    }
}

/// Staleness windows per batch-speed tier, in seconds.
///
/// A partially filled batch is cut once its oldest operation has waited
/// this long, so a lone operation never waits indefinitely for enough
/// peers to fill a batch.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchWindowsConfig {
    /// The fast tier window.
    #[serde(default = "defaults::fast_window_secs")]
    pub fast: u64,
    /// The medium tier window.
    #[serde(default = "defaults::medium_window_secs")]
    pub medium: u64,
    /// The slow tier window.
    #[serde(default = "defaults::slow_window_secs")]
    pub slow: u64,
}

impl Default for BatchWindowsConfig {
    fn default() -> Self {
        Self {
            fast: defaults::fast_window_secs(),
            medium: defaults::medium_window_secs(),
            slow: defaults::slow_window_secs(),
        }
    }
}

/// Leaf batching configuration for the subtree updater actor.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubtreeUpdaterConfig {
    /// if the subtree updater is enabled or not.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    /// The fixed subtree batch size; subtree update proofs only exist for
    /// full batches, undersized windows are padded with zeros.
    #[serde(default = "defaults::subtree_batch_size")]
    pub subtree_batch_size: usize,
    /// How long a partially filled batch may wait before it is padded with
    /// zeros and relayed, in seconds.
    #[serde(default = "defaults::fill_window_secs")]
    pub fill_window_secs: u64,
    /// How often the batch-cut timer fires, in milliseconds.
    #[serde(default = "defaults::poll_interval_millis")]
    pub poll_interval_millis: u64,
    /// The insertion event source poll settings.
    #[serde(default)]
    pub event_source: EventSourceConfig,
}

impl Default for SubtreeUpdaterConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            subtree_batch_size: defaults::subtree_batch_size(),
            fill_window_secs: defaults::fill_window_secs(),
            poll_interval_millis: defaults::poll_interval_millis(),
            event_source: EventSourceConfig::default(),
        }
    }
}

/// The insertion event source poll settings.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EventSourceConfig {
    /// Polling interval in milliseconds
    #[serde(default = "defaults::event_polling_interval_millis")]
    pub polling_interval_millis: u64,
    /// The maximum number of events to fetch in one request.
    #[serde(default = "defaults::max_events_per_step")]
    pub max_events_per_step: usize,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            polling_interval_millis:
                defaults::event_polling_interval_millis(),
            max_events_per_step: defaults::max_events_per_step(),
        }
    }
}

/// FeaturesConfig is the configuration for running the relayer with
/// different features.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeaturesConfig {
    /// Enable data querying over the HTTP API.
    #[serde(default = "defaults::enabled")]
    pub data_query: bool,
    /// Enable the operation relay.
    #[serde(default = "defaults::enabled")]
    pub operation_relay: bool,
    /// Enable the subtree update relay.
    #[serde(default = "defaults::enabled")]
    pub subtree_relay: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            data_query: true,
            operation_relay: true,
            subtree_relay: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_verification() {
        let config = VeilRelayerConfig::default();
        assert!(config.verify().is_ok());
        assert_eq!(config.port, 9955);
        assert_eq!(config.bundler.max_batch_size, 8);
    }

    #[test]
    fn batch_windows_deserialize_from_kebab_case() {
        let raw = r#"{
            "bundler": {
                "max-batch-size": 4,
                "batch-windows": { "fast": 5, "medium": 30, "slow": 120 }
            }
        }"#;
        let config: VeilRelayerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.bundler.max_batch_size, 4);
        assert_eq!(config.bundler.batch_windows.fast, 5);
        assert_eq!(config.bundler.batch_windows.slow, 120);
    }
}
