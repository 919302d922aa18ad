// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Diagnostic logging for runwatch.
//!
//! runwatch logs through [`tracing`]. Embedders that already install a subscriber get its events
//! for free; [`init_logging`] sets up a stderr subscriber for everyone else.

use crate::errors::LogFilterParseError;
use std::sync::Once;
use tracing_subscriber::{
    Layer,
    filter::{LevelFilter, Targets},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// The environment variable controlling which events are logged.
///
/// The value uses the `tracing-subscriber` targets syntax, e.g. `debug` or
/// `runwatch_runner::processor=debug,info`. Unset or empty logs at `info` and above.
pub const LOG_ENV: &str = "RUNWATCH_LOG";

static INIT_LOGGER: Once = Once::new();

/// Installs a global subscriber that writes to stderr, filtered by [`LOG_ENV`].
///
/// Only the first call has an effect. If another global subscriber is already installed, it is
/// left in place.
pub fn init_logging() -> Result<(), LogFilterParseError> {
    let targets = targets_from_env()?;

    INIT_LOGGER.call_once(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(targets);

        // Fails only if a subscriber is already installed.
        let _ = tracing_subscriber::registry().with(layer).try_init();
    });
    Ok(())
}

fn targets_from_env() -> Result<Targets, LogFilterParseError> {
    let level_str = std::env::var_os(LOG_ENV).unwrap_or_default();
    let level_str = level_str
        .into_string()
        .map_err(|_| LogFilterParseError::NotUnicode)?;
    parse_targets(&level_str)
}

fn parse_targets(level_str: &str) -> Result<Targets, LogFilterParseError> {
    // If the level string is empty, use the standard level filter instead.
    if level_str.is_empty() {
        return Ok(Targets::new().with_default(LevelFilter::INFO));
    }
    level_str
        .parse()
        .map_err(|err| LogFilterParseError::Parse {
            input: level_str.to_owned(),
            err,
        })
}
