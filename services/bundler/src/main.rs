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

//! Veil Bundler Binary.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use tokio::signal::unix;

use veil_bundler::service;
use veil_relayer_config::cli::{
    create_store, load_config, setup_logger, Opts,
};
use veil_relayer_context::RelayerContext;
use veil_relayer_utils::probe;

/// The main entry point for the bundler.
///
/// # Arguments
///
/// * `args` - The command line arguments.
#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> anyhow::Result<()> {
    setup_logger(args.verbose, "veil_bundler")?;
    match dotenv::dotenv() {
        Ok(_) => {
            tracing::trace!("Loaded .env file");
        }
        Err(e) => {
            tracing::warn!("Failed to load .env file: {}", e);
        }
    }

    // The configuration is validated and configured from the given directory
    let config = load_config(args.config_dir.clone())?;

    // persistent storage for the actor
    let store = create_store(&args).await?;

    // The RelayerContext takes a configuration, and populates objects that
    // are needed throughout the lifetime of the actor.
    let ctx = RelayerContext::new(config, store.clone());

    // start all background services and the HTTP API.
    let state = service::ignite(&ctx, Arc::new(store)).await?;
    let server_handle =
        tokio::spawn(service::build_web_services(state.clone()));
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        started = true
    );

    // watch for signals
    let mut ctrlc_signal = unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal = unix::signal(unix::SignalKind::terminate())?;
    let mut quit_signal = unix::signal(unix::SignalKind::quit())?;
    let shutdown = || {
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Lifecycle,
            shutdown = true
        );
        tracing::warn!("Shutting down...");
        // send shutdown signal to all of the application.
        ctx.shutdown();
        // also abort the server task
        server_handle.abort();
        std::thread::sleep(std::time::Duration::from_millis(300));
        tracing::info!("Clean Exit ..");
    };
    tokio::select! {
        _ = ctrlc_signal.recv() => {
            tracing::warn!("Interrupted (Ctrl+C) ...");
            shutdown();
        },
        _ = termination_signal.recv() => {
            tracing::warn!("Got Terminate signal ...");
            shutdown();
        },
        _ = quit_signal.recv() => {
            tracing::warn!("Quitting ...");
            shutdown();
        },
    }
    Ok(())
}
