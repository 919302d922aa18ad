// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by runwatch.

use camino::Utf8PathBuf;
use config::ConfigError;
use runwatch_metadata::{EventDecodeError, EventEncodeError, ReporterId};
use std::{fmt, time::Duration};
use thiserror::Error;
use tokio::task::JoinError;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse runwatch config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file that failed to parse.
    ///
    /// For the built-in defaults this is `<default config>`.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error that occurred.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// An error reported by a remote engine while executing a run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    /// Creates a new engine error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the message reported by the engine.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An error that occurred while talking to an event channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The connection was closed before or during the operation.
    #[error("connection closed")]
    Closed,

    /// The stream was aborted from the other side.
    #[error("event stream for `{reporter_id}` was aborted")]
    Aborted {
        /// The run whose stream was aborted.
        reporter_id: ReporterId,
    },

    /// No event arrived before the receive timeout elapsed.
    #[error("timed out after {:?} waiting for events for `{reporter_id}`", timeout)]
    Timeout {
        /// The run being waited on.
        reporter_id: ReporterId,

        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// An event could not be decoded.
    #[error("protocol error on channel")]
    Decode(#[source] EventDecodeError),

    /// An event could not be encoded.
    #[error("failed to send event")]
    Encode(#[source] EventEncodeError),

    /// The connection has no remote engine to execute runs.
    #[error("no remote engine attached to this connection")]
    NoEngine,

    /// The remote engine reported an error.
    #[error("remote engine error")]
    Engine(#[source] EngineError),

    /// No coverage report exists for the given id.
    #[error("no coverage report available for `{coverage_id}`")]
    CoverageUnavailable {
        /// The coverage reporter id that was asked for.
        coverage_id: ReporterId,
    },
}

/// An error that occurred while building a [`RunCoordinator`](crate::coordinator::RunCoordinator).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorBuildError {
    /// No observer was available to display the run.
    #[error("no observer available to display run `{reporter_id}`")]
    ObserverUnavailable {
        /// The run that could not be started.
        reporter_id: ReporterId,
    },

    /// Debug mode was requested, but no debug host was provided.
    #[error("debug mode requested for run `{reporter_id}`, but no debug host was provided")]
    DebugHostMissing {
        /// The run that could not be started.
        reporter_id: ReporterId,
    },

    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),
}

/// Errors that occurred while executing a run.
///
/// Channel and engine errors are not represented here: they are logged and reflected in the run
/// state. This only captures activities that panicked.
#[derive(Debug)]
pub struct CoordinatorExecuteError {
    /// The reporter id of the run.
    pub reporter_id: ReporterId,

    /// Join errors (typically panics) that occurred while running activities.
    pub join_errors: Vec<JoinError>,
}

impl fmt::Display for CoordinatorExecuteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} panicked while executing run `{}`",
            self.join_errors.len(),
            if self.join_errors.len() == 1 {
                "activity"
            } else {
                "activities"
            },
            self.reporter_id,
        )
    }
}

impl std::error::Error for CoordinatorExecuteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.join_errors
            .first()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// An error that occurred while reading the `RUNWATCH_LOG` environment variable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LogFilterParseError {
    /// The variable is not valid UTF-8.
    #[error("RUNWATCH_LOG is not valid UTF-8")]
    NotUnicode,

    /// The variable is not a valid list of targets.
    #[error("unable to parse RUNWATCH_LOG `{input}`")]
    Parse {
        /// The value of the variable.
        input: String,

        /// The underlying error.
        #[source]
        err: tracing_subscriber::filter::ParseError,
    },
}

/// Displays an error along with its chain of sources.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain` for `error`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        let mut source = self.error.source();
        if source.is_some() {
            write!(f, "\n  caused by:")?;
        }
        while let Some(err) = source {
            write!(f, "\n  - {err}")?;
            source = err.source();
        }
        Ok(())
    }
}
