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

use config::{Config, File};
use std::path::{Path, PathBuf};

use super::*;

/// A helper function that will search for all config files in the given
/// directory and return them as a vec of the paths.
///
/// Supported file extensions are:
/// - `.toml`.
/// - `.json`.
pub fn search_config_files<P: AsRef<Path>>(
    base_dir: P,
) -> veil_relayer_utils::Result<Vec<PathBuf>> {
    // A pattern that covers all toml or json files in the config directory
    // and subdirectories.
    let toml_pattern = format!("{}/**/*.toml", base_dir.as_ref().display());
    let json_pattern = format!("{}/**/*.json", base_dir.as_ref().display());
    tracing::trace!(
        "Loading config files from {} and {}",
        toml_pattern,
        json_pattern
    );
    let toml_files = glob::glob(&toml_pattern)?;
    let json_files = glob::glob(&json_pattern)?;
    toml_files
        .chain(json_files)
        .map(|v| v.map_err(veil_relayer_utils::Error::from))
        .collect()
}

/// Try to parse the [`VeilRelayerConfig`] from the given config file(s).
pub fn parse_from_files(
    files: &[PathBuf],
) -> veil_relayer_utils::Result<VeilRelayerConfig> {
    let mut builder = Config::builder();
    for config_file in files {
        tracing::trace!("Loading config file: {}", config_file.display());
        let ext = config_file
            .extension()
            .map(|e| e.to_str().unwrap_or(""))
            .unwrap_or("");
        let format = match ext {
            "toml" => config::FileFormat::Toml,
            "json" => config::FileFormat::Json,
            _ => {
                tracing::warn!("Unknown file extension: {}", ext);
                continue;
            }
        };
        builder = builder
            .add_source(File::from(config_file.as_path()).format(format));
    }

    // also merge in the environment (with a prefix of VEIL).
    let builder = builder
        .add_source(config::Environment::with_prefix("VEIL").separator("_"));
    let cfg = builder.build()?;
    // and finally deserialize the config and post-process it
    let config: Result<
        VeilRelayerConfig,
        serde_path_to_error::Error<config::ConfigError>,
    > = serde_path_to_error::deserialize(cfg);
    match config {
        Ok(c) => postloading_process(c),
        Err(e) => {
            tracing::error!("{}", e);
            Err(e.into())
        }
    }
}

/// Load the configuration files.
///
/// it is the same as using the [`search_config_files`] and
/// [`parse_from_files`] functions combined.
pub fn load<P: AsRef<Path>>(
    path: P,
) -> veil_relayer_utils::Result<VeilRelayerConfig> {
    parse_from_files(&search_config_files(path)?)
}

/// The postloading_process exists to validate configuration and standardize
/// the format of the configuration
pub fn postloading_process(
    config: VeilRelayerConfig,
) -> veil_relayer_utils::Result<VeilRelayerConfig> {
    tracing::trace!("Checking configuration sanity ...");
    if config.features.data_query && !config.bundler.enabled {
        tracing::warn!(
            "!!WARNING!!: In order to serve data queries,
            the bundler section should also be enabled"
        );
    }
    if config.bundler.max_batch_size == 0 {
        return Err(veil_relayer_utils::Error::Generic(
            "bundler max-batch-size must be greater than zero",
        ));
    }
    if config.subtree_updater.subtree_batch_size == 0 {
        return Err(veil_relayer_utils::Error::Generic(
            "subtree-batch-size must be greater than zero",
        ));
    }
    config.verify()?;
    tracing::trace!(
        "postloaded config: {}",
        serde_json::to_string_pretty(&config)?
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_config_from_a_directory_of_toml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.toml"),
            r#"
            port = 9000

            [bundler]
            max-batch-size = 4

            [bundler.batch-windows]
            fast = 5
            "#,
        )
        .unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bundler.max_batch_size, 4);
        assert_eq!(config.bundler.batch_windows.fast, 5);
        // untouched values fall back to the defaults.
        assert_eq!(config.bundler.batch_windows.medium, 60);
    }

    #[test]
    fn rejects_a_zero_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.toml"),
            "[bundler]\nmax-batch-size = 0\n",
        )
        .unwrap();
        assert!(load(dir.path()).is_err());
    }
}
