// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle events reported by a remote test engine.
//!
//! Events for a single run share a [`ReporterId`] and arrive in causal order:
//!
//! ```text
//! pre-run? (pre-suite pre-test post-test post-suite)* post-run?
//! ```
//!
//! A run may end without a `post-run` event if it was aborted.

use crate::{
    Counter, ReporterId,
    errors::{EventDecodeError, EventEncodeError},
};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single event, tagged with the run it belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunEvent {
    /// The correlation id of the run that produced this event.
    pub reporter_id: ReporterId,

    /// The kind of event this is.
    #[serde(flatten)]
    pub kind: RunEventKind,
}

impl RunEvent {
    /// Creates a new event for the given run.
    pub fn new(reporter_id: ReporterId, kind: impl Into<RunEventKind>) -> Self {
        Self {
            reporter_id,
            kind: kind.into(),
        }
    }

    /// Decodes an event from a single line of JSON.
    pub fn from_json_line(line: &str) -> Result<Self, EventDecodeError> {
        serde_json::from_str(line.trim_end()).map_err(|err| EventDecodeError::new(line, err))
    }

    /// Encodes this event as a single line of JSON, without a trailing newline.
    pub fn to_json_line(&self) -> Result<String, EventEncodeError> {
        serde_json::to_string(self).map_err(EventEncodeError::new)
    }
}

/// The kind of event, forming part of a [`RunEvent`].
///
/// This is a closed set: readers that encounter an unknown kind fail to decode the event.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RunEventKind {
    /// The run is about to start.
    PreRun(PreRunEvent),

    /// A suite is about to start.
    PreSuite(PreSuiteEvent),

    /// A test is about to start.
    PreTest(PreTestEvent),

    /// A test finished.
    PostTest(PostTestEvent),

    /// A suite finished.
    PostSuite(PostSuiteEvent),

    /// The run finished.
    PostRun(PostRunEvent),
}

impl RunEventKind {
    /// Returns the wire name of this event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreRun(_) => "pre-run",
            Self::PreSuite(_) => "pre-suite",
            Self::PreTest(_) => "pre-test",
            Self::PostTest(_) => "post-test",
            Self::PostSuite(_) => "post-suite",
            Self::PostRun(_) => "post-run",
        }
    }

    /// Returns true if no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PostRun(_))
    }
}

macro_rules! impl_from_event {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for RunEventKind {
                fn from(event: $ty) -> Self {
                    Self::$variant(event)
                }
            }
        )*
    };
}

impl_from_event!(
    PreRun(PreRunEvent),
    PreSuite(PreSuiteEvent),
    PreTest(PreTestEvent),
    PostTest(PostTestEvent),
    PostSuite(PostSuiteEvent),
    PostRun(PostRunEvent),
);

/// Describes the tests that are about to run.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PreRunEvent {
    /// The total number of tests in the run.
    pub total_number_of_tests: usize,

    /// The suites and tests in the run, in execution order.
    #[serde(default)]
    pub items: Vec<PreRunItem>,
}

impl PreRunEvent {
    /// Returns every test in `items`, depth-first, in the order they were declared.
    pub fn tests(&self) -> Vec<DeclaredTest<'_>> {
        PreRunItem::declared_tests(&self.items)
    }
}

fn collect_tests<'a>(
    suite_id: Option<&'a str>,
    items: &'a [PreRunItem],
    out: &mut Vec<DeclaredTest<'a>>,
) {
    for item in items {
        match item {
            PreRunItem::Suite(suite) => collect_tests(Some(&suite.id), &suite.items, out),
            PreRunItem::Test(descriptor) => out.push(DeclaredTest {
                suite_id,
                descriptor,
            }),
        }
    }
}

/// A test declared in a [`PreRunEvent`], along with the suite that encloses it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeclaredTest<'a> {
    /// The id of the innermost enclosing suite, if any.
    pub suite_id: Option<&'a str>,

    /// The test itself.
    pub descriptor: &'a TestDescriptor,
}

/// An item in the tree of suites and tests reported by a [`PreRunEvent`].
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PreRunItem {
    /// A suite, grouping further items.
    Suite(SuiteDescriptor),

    /// A leaf test.
    Test(TestDescriptor),
}

impl PreRunItem {
    /// Flattens a tree of items into its tests, depth-first, in declaration order.
    pub fn declared_tests(items: &[PreRunItem]) -> Vec<DeclaredTest<'_>> {
        let mut out = Vec::new();
        collect_tests(None, items, &mut out);
        out
    }
}

/// A suite declared by a [`PreRunEvent`].
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuiteDescriptor {
    /// The suite id as assigned by the engine.
    pub id: String,

    /// The display name of the suite.
    #[serde(default)]
    pub name: String,

    /// An optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// The suites and tests nested in this suite.
    #[serde(default)]
    pub items: Vec<PreRunItem>,
}

/// A test declared by a [`PreRunEvent`].
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestDescriptor {
    /// The test id as assigned by the engine. This is an opaque, path-like string.
    pub id: String,

    /// The 1-based position of this test within the run.
    pub test_number: usize,

    /// The display name of the test.
    #[serde(default)]
    pub name: String,

    /// An optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether the test is disabled.
    #[serde(default)]
    pub disabled: bool,
}

impl TestDescriptor {
    /// Creates a new descriptor with the given id and number, using the id as the display name.
    pub fn new(id: impl Into<String>, test_number: usize) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            test_number,
            description: None,
            disabled: false,
        }
    }
}

/// A suite is about to start.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PreSuiteEvent {
    /// The suite id.
    pub id: String,

    /// Warnings raised while entering the suite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<String>,

    /// Server output produced while entering the suite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_output: Option<String>,
}

/// A test is about to start.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PreTestEvent {
    /// The test id.
    pub id: String,

    /// The 1-based number of this test within the run.
    pub test_number: usize,
}

/// A test finished.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PostTestEvent {
    /// The test id.
    pub id: String,

    /// When the test started, according to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<FixedOffset>>,

    /// When the test finished, according to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<FixedOffset>>,

    /// How long the test took.
    #[serde(
        default,
        with = "duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_time: Option<Duration>,

    /// The outcome of this test.
    #[serde(default)]
    pub counter: Counter,

    /// The error stack, if the test errored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,

    /// Server output produced by the test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_output: Option<String>,

    /// Expectations that did not hold, in the order they were checked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_expectations: Vec<Expectation>,

    /// Warnings raised by the test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<String>,
}

/// A suite finished.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PostSuiteEvent {
    /// The suite id.
    pub id: String,

    /// When the suite started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<FixedOffset>>,

    /// When the suite finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<FixedOffset>>,

    /// How long the suite took.
    #[serde(
        default,
        with = "duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_time: Option<Duration>,

    /// The outcomes of the tests in this suite.
    #[serde(default)]
    pub counter: Counter,

    /// Warnings raised at suite scope, e.g. by before/after-all hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<String>,

    /// Server output produced at suite scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_output: Option<String>,
}

/// The run finished.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PostRunEvent {
    /// When the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<FixedOffset>>,

    /// When the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<FixedOffset>>,

    /// How long the run took.
    #[serde(
        default,
        with = "duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_time: Option<Duration>,

    /// The engine's own totals for the run.
    #[serde(default)]
    pub counter: Counter,

    /// A fatal, run-level error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,

    /// Server output produced at run scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_output: Option<String>,
}

/// An expectation that did not hold.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Expectation {
    /// What was expected, and what was found instead.
    pub description: String,

    /// Where the expectation was checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
}

impl Expectation {
    /// Returns the description and caller, joined by a newline.
    pub fn failure_text(&self) -> String {
        match &self.caller {
            Some(caller) => format!("{}\n{}", self.description, caller),
            None => self.description.clone(),
        }
    }
}

/// Serializes durations as fractional seconds, the way engines report them.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub(super) fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_f64(duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|err| D::Error::custom(format!("invalid duration {secs}: {err}")))
            })
            .transpose()
    }
}
