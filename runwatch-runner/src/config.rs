// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for runwatch.
//!
//! The configuration is an explicit value handed to the
//! [`RunCoordinatorBuilder`](crate::coordinator::RunCoordinatorBuilder). It is built from the
//! defaults embedded in this crate, with an optional repository-specific file layered on top.

use crate::{
    channel::{CoverageOptions, TriggerOptions},
    errors::{ConfigParseError, ConfigParseErrorKind},
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{collections::BTreeSet, time::Duration};
use tracing::warn;

/// Configuration for runwatch.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ReporterConfig {
    /// Settings for scheduling the run.
    pub run: RunSettings,

    /// Options passed to the engine when triggering a run.
    pub trigger: TriggerOptions,

    /// Options used when code coverage is requested.
    pub coverage: CoverageOptions,
}

/// Settings for scheduling the produce and consume activities of a run.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RunSettings {
    /// The delay between scheduling the consume activity and scheduling the produce activity.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// How long to wait for events in normal mode. `None` waits until end-of-stream.
    #[serde(default, with = "humantime_serde")]
    pub receive_timeout: Option<Duration>,

    /// How long to wait for events in debug mode.
    #[serde(with = "humantime_serde")]
    pub debug_timeout: Duration,

    /// Whether connections are torn down by an external harness.
    ///
    /// If true, the coordinator never runs its finalize step.
    #[serde(default)]
    pub managed_connections: bool,
}

impl ReporterConfig {
    /// The location of the repository config, relative to the workspace root.
    pub const CONFIG_PATH: &'static str = ".config/runwatch.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the config from the given file, or if not present from `.config/runwatch.toml` in
    /// the given directory.
    ///
    /// If neither exists, the default config is returned.
    pub fn from_sources(
        config_file: Option<&Utf8Path>,
        workspace_root: &Utf8Path,
    ) -> Result<Self, ConfigParseError> {
        let mut builder = Self::make_default_config();

        let file = match config_file {
            Some(file) => Some(file.to_owned()),
            None => {
                let default_file = workspace_root.join(Self::CONFIG_PATH);
                default_file.is_file().then_some(default_file)
            }
        };

        let source_name = match &file {
            Some(file) => {
                builder = builder.add_source(File::new(file.as_str(), FileFormat::Toml));
                file.clone()
            }
            None => Utf8PathBuf::from("<default config>"),
        };

        let (config, ignored) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&source_name, kind))?;

        for path in ignored {
            warn!(config_file = %source_name, "ignoring unknown configuration key `{path}`");
        }

        Ok(config)
    }

    /// Parses a config from a TOML string, layered on top of the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigParseError> {
        let builder =
            Self::make_default_config().add_source(File::from_str(toml, FileFormat::Toml));
        let (config, ignored) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new("<inline config>", kind))?;
        for path in ignored {
            warn!("ignoring unknown configuration key `{path}`");
        }
        Ok(config)
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(Self, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: Self = serde_path_to_error::deserialize(ignored_de).map_err(|error| {
            // Both serde_path_to_error and the config crate report the key. Drop the key from
            // the config error so it isn't printed twice.
            let path = error.path().clone();
            let config_error = error.into_inner();
            let error = match config_error {
                ConfigError::At { error, .. } => *error,
                other => other,
            };
            ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                path, error,
            )))
        })?;

        Ok((config, ignored))
    }
}

impl Default for ReporterConfig {
    /// Returns the config described by [`Self::DEFAULT_CONFIG`].
    fn default() -> Self {
        Self {
            run: RunSettings {
                grace_period: Duration::from_millis(200),
                receive_timeout: None,
                debug_timeout: Duration::from_secs(60 * 60),
                managed_connections: false,
            },
            trigger: TriggerOptions::default(),
            coverage: CoverageOptions::default(),
        }
    }
}
