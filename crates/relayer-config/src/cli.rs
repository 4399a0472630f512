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

use crate::VeilRelayerConfig;
use anyhow::Context;
use directories_next::ProjectDirs;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

/// Package identifier, where the default configuration & database are defined.
/// If the user does not start the actor with the `--config-dir`
/// it will default to read from the default location depending on the OS.
pub const PACKAGE_ID: [&str; 3] = ["tools", "webb", "veil-relayer"];

/// The Veil Relayer Command-line tool
///
/// Start an actor from a config file:
///
/// $ veil-bundler -vvv -c <CONFIG_FILE_PATH>
#[derive(StructOpt)]
#[structopt(name = "Veil Relayer")]
pub struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: i32,
    /// Directory that contains configration files.
    #[structopt(
        short = "c",
        long = "config-dir",
        value_name = "PATH",
        parse(from_os_str)
    )]
    pub config_dir: Option<PathBuf>,
    /// Create the Database Store in a temporary directory.
    /// and will be deleted when the process exits.
    #[structopt(long)]
    pub tmp: bool,
}

/// Loads the configuration from the given directory.
///
/// Returns `Ok(VeilRelayerConfig)` on success, or `Err(anyhow::Error)` on
/// failure.
///
/// # Arguments
///
/// * `config_dir` - An optional `PathBuf` representing the directory that
///   contains the configuration.
pub fn load_config<P>(
    config_dir: Option<P>,
) -> Result<VeilRelayerConfig, anyhow::Error>
where
    P: AsRef<Path>,
{
    tracing::debug!("Getting default dirs for the veil relayer");
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get config")?;
    let path = match config_dir {
        Some(p) => p.as_ref().to_path_buf(),
        None => dirs.config_dir().to_path_buf(),
    };
    // return an error if the path is not a directory.
    if !path.is_dir() {
        return Err(anyhow::anyhow!("{} is not a directory", path.display()));
    }
    tracing::trace!("Loading Config from {} ..", path.display());
    let v = crate::utils::load(path)?;
    tracing::trace!("Config loaded..");
    Ok(v)
}

/// Sets up the logger for the relayer, based on the verbosity level passed
/// in.
///
/// Returns `Ok(())` on success, or `Err(anyhow::Error)` on failure.
///
/// # Arguments
///
/// * `verbosity` - An i32 integer representing the verbosity level.
/// * `filter` - The name of the crate the default log directive is scoped
///   to.
pub fn setup_logger(verbosity: i32, filter: &str) -> anyhow::Result<()> {
    use tracing::Level;
    let log_level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let directive_1 = format!("{filter}={log_level}")
        .parse()
        .expect("valid log level");
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(directive_1);
    let logger = tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(log_level)
        .with_env_filter(env_filter);
    // if we are not compiling for integration tests, we should use pretty logs
    #[cfg(not(feature = "integration-tests"))]
    let logger = logger.pretty();
    // otherwise, we should use json, which is easy to parse.
    #[cfg(feature = "integration-tests")]
    let logger = logger.json().flatten_event(true).with_current_span(false);

    logger.init();
    Ok(())
}

/// Creates a database store for the relayer based on the configuration
/// passed in.
///
/// Returns `Ok(SledStore)` on success, or `Err(anyhow::Error)` on failure.
///
/// # Arguments
///
/// * `opts` - The configuration options for the database store.
pub async fn create_store(
    opts: &Opts,
) -> anyhow::Result<veil_relayer_store::SledStore> {
    // check if we shall use the temp dir.
    if opts.tmp {
        tracing::debug!("Using temp dir for store");
        let store = veil_relayer_store::SledStore::temporary()?;
        return Ok(store);
    }
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get config")?;
    let p = match opts.config_dir.as_ref() {
        Some(p) => p.to_path_buf(),
        None => dirs.data_local_dir().to_path_buf(),
    };
    let db_path = match opts.config_dir.as_ref().zip(p.parent()) {
        Some((_, parent)) => parent.join("store"),
        None => p.join("store"),
    };

    let store = veil_relayer_store::SledStore::open(db_path)?;
    Ok(store)
}
