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
//! # Relayer Context Module
//!
//! A module for managing the context of the relayer actors.

use std::time::Duration;

use tokio::sync::broadcast;

use veil_relayer_store::SledStore;

/// RelayerContext contains the actor's configuration and shutdown signal.
#[derive(Clone)]
pub struct RelayerContext {
    /// The configuration of the relayer.
    pub config: veil_relayer_config::VeilRelayerConfig,
    /// Broadcasts a shutdown signal to all active tasks.
    ///
    /// The initial `shutdown` trigger is provided by the `run` caller. When
    /// a background task is spawned, it is passed a broadcast receiver
    /// handle. When a graceful shutdown is initiated, a `()` value is sent
    /// via the broadcast::Sender. Each active task receives it, reaches a
    /// safe terminal state, and completes.
    notify_shutdown: broadcast::Sender<()>,
    store: SledStore,
}

impl RelayerContext {
    /// Creates a new RelayerContext.
    pub fn new(
        config: veil_relayer_config::VeilRelayerConfig,
        store: SledStore,
    ) -> Self {
        let (notify_shutdown, _) = broadcast::channel(2);
        Self {
            config,
            notify_shutdown,
            store,
        }
    }

    /// Returns a broadcast receiver handle for the shutdown signal.
    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Sends a shutdown signal to all subscribed tasks.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    /// Returns the [Sled](https://sled.rs)-based database store.
    pub fn store(&self) -> &SledStore {
        &self.store
    }

    /// The configured on-chain submission timeout.
    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.config.chain.submission_timeout_secs)
    }
}

/// Listens for the shutdown signal.
///
/// Shutdown is signalled using a `broadcast::Receiver`. Only a single value
/// is ever sent. Once a value has been sent via the broadcast channel, the
/// task should shutdown.
///
/// The `Shutdown` struct listens for the signal and tracks that the signal
/// has been received. Callers may query for whether the shutdown signal has
/// been received or not.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received
    shutdown: bool,

    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        // If the shutdown signal has already been received, then return
        // immediately.
        if self.shutdown {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        // Remember that the signal has been received.
        self.shutdown = true;
    }
}
