// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Channels carrying events from a remote engine to runwatch.
//!
//! A channel is a one-way, ordered, at-least-once delivery mechanism keyed by a
//! [`ReporterId`]. The producer side asks the engine to start a run, tagging every event it emits
//! with the reporter id; the consumer side pulls those events until the stream ends.
//!
//! The [`memory`] module contains an in-process implementation.

pub mod memory;

use crate::errors::ChannelError;
use runwatch_metadata::{ReporterId, RunEvent};
use serde::Deserialize;
use std::{ops::ControlFlow, time::Duration};

/// What to run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunRequest {
    /// The targets to run: paths to suites, packages or individual tests, as understood by the
    /// engine.
    pub path_list: Vec<String>,
}

impl RunRequest {
    /// Creates a request for the given targets.
    pub fn new(path_list: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            path_list: path_list.into_iter().map(Into::into).collect(),
        }
    }
}

/// Options passed to the engine when triggering a run.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TriggerOptions {
    /// Whether tests should run in random order.
    #[serde(default)]
    pub random_test_order: bool,

    /// The seed for random ordering. `None` lets the engine choose.
    #[serde(default)]
    pub random_test_order_seed: Option<u64>,

    /// Only run tests with at least one of these tags. Empty runs all tests.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Options for gathering code coverage alongside a run.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct CoverageOptions {
    /// Schemas to gather coverage for.
    #[serde(default)]
    pub schemas: Vec<String>,

    /// Objects to include in the report. Empty includes everything in `schemas`.
    #[serde(default)]
    pub include_objects: Vec<String>,

    /// Objects to exclude from the report.
    #[serde(default)]
    pub exclude_objects: Vec<String>,
}

/// One connection to an event channel.
///
/// A run uses two connections: one to trigger the run, and one to receive its events. The
/// trigger call may block for the full duration of the run, which is why the two sides can't
/// share a connection.
pub trait EventChannel: Send + Sync {
    /// Asks the engine to run `request`, tagging all events with `reporter_id`.
    ///
    /// Completes once the engine has finished the run.
    fn trigger(
        &self,
        reporter_id: &ReporterId,
        request: &RunRequest,
        options: &TriggerOptions,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Like [`trigger`](Self::trigger), additionally gathering code coverage that can later be
    /// fetched with `coverage_id`.
    fn trigger_with_coverage(
        &self,
        reporter_id: &ReporterId,
        coverage_id: &ReporterId,
        request: &RunRequest,
        options: &TriggerOptions,
        coverage: &CoverageOptions,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Receives events tagged with `reporter_id`, calling `consumer` once per event in arrival
    /// order.
    ///
    /// Returns `Ok(())` at end-of-stream, or as soon as `consumer` returns
    /// [`ControlFlow::Break`]. With a `timeout`, returns [`ChannelError::Timeout`] if the stream
    /// hasn't ended by then; without one, waits indefinitely.
    fn receive<F>(
        &self,
        reporter_id: &ReporterId,
        timeout: Option<Duration>,
        consumer: F,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send
    where
        F: FnMut(RunEvent) -> ControlFlow<()> + Send;

    /// Fetches the HTML coverage report gathered under `coverage_id`.
    fn fetch_coverage_report(
        &self,
        coverage_id: &ReporterId,
    ) -> impl Future<Output = Result<String, ChannelError>> + Send;

    /// Releases this connection. Operations on a closed connection fail with
    /// [`ChannelError::Closed`].
    fn close(&self) -> Result<(), ChannelError>;
}

/// A host that executes a run under a debugger, stepping through it interactively.
///
/// The call blocks until the debug session ends.
pub trait DebugHost: Send + Sync {
    /// Runs `request` under the debugger, tagging all events with `reporter_id`.
    ///
    /// This blocks the produce activity, and the run is not finalized until it returns: a debug
    /// session that never ends keeps [`RunCoordinator::execute`] from returning. The consume
    /// activity still gives up after the debug timeout.
    ///
    /// [`RunCoordinator::execute`]: crate::coordinator::RunCoordinator::execute
    fn debug(
        &self,
        reporter_id: &ReporterId,
        request: &RunRequest,
        options: &TriggerOptions,
    ) -> Result<(), ChannelError>;
}
