// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The model of a run in progress.
//!
//! A [`Run`] is mutated by the [`RunProcessor`](crate::processor::RunProcessor) on the consume
//! activity, and once more by the coordinator when the run is finalized. Observers read it
//! concurrently through a [`RunHandle`].

use crate::time::{StopwatchStart, stopwatch};
use chrono::{DateTime, FixedOffset};
use indexmap::IndexMap;
use runwatch_metadata::{Counter, DeclaredTest, Expectation, PreRunItem, ReporterId};
use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// The state of a single run.
#[derive(Clone, Debug)]
pub struct Run {
    reporter_id: ReporterId,
    coverage_reporter_id: Option<ReporterId>,
    connection_name: String,
    path_list: Vec<String>,
    stopwatch: StopwatchStart,
    start_time: DateTime<FixedOffset>,
    end_time: Option<DateTime<FixedOffset>>,
    execution_time: Option<Duration>,
    status: RunStatus,
    total_tests: Option<usize>,
    current_test_number: Option<usize>,
    current_test: Option<String>,
    counter: Counter,
    info_count: usize,
    error_stack: Option<String>,
    server_output: Option<String>,
    // Insertion order is display order.
    tests: IndexMap<String, Test>,
    diagnostics: Vec<RunDiagnostic>,
    detached: bool,
}

impl Run {
    /// Creates a new run for the given targets. The start time is set to now.
    pub fn new(
        reporter_id: ReporterId,
        connection_name: impl Into<String>,
        path_list: Vec<String>,
    ) -> Self {
        let stopwatch = stopwatch();
        Self {
            reporter_id,
            coverage_reporter_id: None,
            connection_name: connection_name.into(),
            path_list,
            start_time: stopwatch.start_time(),
            stopwatch,
            end_time: None,
            execution_time: None,
            status: RunStatus::Initialized,
            total_tests: None,
            current_test_number: None,
            current_test: None,
            counter: Counter::ZERO,
            info_count: 0,
            error_stack: None,
            server_output: None,
            tests: IndexMap::new(),
            diagnostics: Vec::new(),
            detached: false,
        }
    }

    /// Sets the id used to fetch the coverage report for this run.
    pub fn with_coverage_reporter_id(mut self, coverage_reporter_id: ReporterId) -> Self {
        self.coverage_reporter_id = Some(coverage_reporter_id);
        self
    }

    /// The correlation id of this run.
    pub fn reporter_id(&self) -> &ReporterId {
        &self.reporter_id
    }

    /// The correlation id of the coverage report, if coverage was requested.
    pub fn coverage_reporter_id(&self) -> Option<&ReporterId> {
        self.coverage_reporter_id.as_ref()
    }

    /// The name of the connection the run executes on.
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// The targets that were asked to run.
    pub fn path_list(&self) -> &[String] {
        &self.path_list
    }

    /// A display name for the run: its start time and connection.
    pub fn name(&self) -> String {
        format!(
            "{} ({})",
            self.start_time.format("%Y-%m-%d %H:%M:%S"),
            self.connection_name
        )
    }

    /// When the run started.
    pub fn start_time(&self) -> DateTime<FixedOffset> {
        self.start_time
    }

    /// When the run ended, or `None` while it is still running.
    pub fn end_time(&self) -> Option<DateTime<FixedOffset>> {
        self.end_time
    }

    /// How long the run took, once it has ended.
    pub fn execution_time(&self) -> Option<Duration> {
        self.execution_time
    }

    /// The current status of the run.
    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// The total number of tests in the run, or `None` if the engine hasn't reported it yet.
    pub fn total_tests(&self) -> Option<usize> {
        self.total_tests
    }

    /// The number of the test most recently started.
    pub fn current_test_number(&self) -> Option<usize> {
        self.current_test_number
    }

    /// The test most recently started, if it is known.
    pub fn current_test(&self) -> Option<&Test> {
        self.current_test
            .as_deref()
            .and_then(|id| self.tests.get(id))
    }

    /// The outcome counts rolled up over the whole run.
    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    /// The number of completed tests: disabled, successful, failed and errored.
    pub fn completed_tests(&self) -> usize {
        self.counter.total()
    }

    /// The number of tests that produced server output.
    pub fn info_count(&self) -> usize {
        self.info_count
    }

    /// A fatal, run-level error, if one occurred.
    pub fn error_stack(&self) -> Option<&str> {
        self.error_stack.as_deref()
    }

    /// Server output produced at run scope.
    pub fn server_output(&self) -> Option<&str> {
        self.server_output.as_deref()
    }

    /// Looks up a test by id.
    pub fn test(&self, id: &str) -> Option<&Test> {
        self.tests.get(id)
    }

    /// Iterates over all tests in display order.
    pub fn tests(&self) -> impl ExactSizeIterator<Item = &Test> {
        self.tests.values()
    }

    /// Diagnostics recorded while processing events.
    pub fn diagnostics(&self) -> &[RunDiagnostic] {
        &self.diagnostics
    }

    /// Returns true once the run has an end time.
    pub fn is_terminal(&self) -> bool {
        self.end_time.is_some()
    }

    /// Returns true once the run has been detached from its channel: no further updates follow.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// The time elapsed since this run was created, according to a monotonic clock.
    pub fn elapsed(&self) -> Duration {
        self.stopwatch.snapshot().duration
    }

    /// The wall-clock time corresponding to `start_time() + elapsed()`.
    pub fn elapsed_end_time(&self) -> DateTime<FixedOffset> {
        self.stopwatch.snapshot().end_time()
    }

    // ---
    // Mutators
    // ---

    /// Creates one test per declared item, in order. Existing tests are left untouched.
    pub fn put(&mut self, items: &[PreRunItem]) {
        for declared in PreRunItem::declared_tests(items) {
            if !self.tests.contains_key(&declared.descriptor.id) {
                self.tests.insert(
                    declared.descriptor.id.clone(),
                    Test::from_declared(declared),
                );
            }
        }
    }

    /// Looks up a test by id for mutation.
    pub fn test_mut(&mut self, id: &str) -> Option<&mut Test> {
        self.tests.get_mut(id)
    }

    /// The test most recently started, for mutation.
    pub fn current_test_mut(&mut self) -> Option<&mut Test> {
        let id = self.current_test.as_deref()?;
        self.tests.get_mut(id)
    }

    /// Sets the test most recently started. Unknown ids clear the current test.
    pub fn set_current_test(&mut self, id: Option<&str>) {
        self.current_test = id
            .filter(|id| self.tests.contains_key(*id))
            .map(str::to_owned);
    }

    /// Sets the number of the test most recently started.
    pub fn set_current_test_number(&mut self, number: usize) {
        self.current_test_number = Some(number);
    }

    /// Sets the status of the run.
    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    /// Sets the total number of tests.
    pub fn set_total_tests(&mut self, total: usize) {
        self.total_tests = Some(total);
    }

    /// Sets the start time of the run.
    pub fn set_start_time(&mut self, start_time: DateTime<FixedOffset>) {
        self.start_time = start_time;
    }

    /// Sets the end time of the run, making it terminal.
    pub fn set_end_time(&mut self, end_time: DateTime<FixedOffset>) {
        self.end_time = Some(end_time);
    }

    /// Sets how long the run took.
    pub fn set_execution_time(&mut self, execution_time: Duration) {
        self.execution_time = Some(execution_time);
    }

    /// Sets the run-level error stack.
    pub fn set_error_stack(&mut self, error_stack: impl Into<String>) {
        self.error_stack = Some(error_stack.into());
    }

    /// Sets the run-level server output.
    pub fn set_server_output(&mut self, server_output: impl Into<String>) {
        self.server_output = Some(server_output.into());
    }

    /// Returns the rolled-up counter for mutation.
    pub fn counter_mut(&mut self) -> &mut Counter {
        &mut self.counter
    }

    /// Records that one more test produced server output.
    pub fn increment_info_count(&mut self) {
        self.info_count += 1;
    }

    /// Records a diagnostic.
    pub fn push_diagnostic(&mut self, diagnostic: RunDiagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Marks the run as detached from its channel.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    /// Ends a run whose event stream stopped before the post-run event, making it terminal.
    ///
    /// The run is [`Aborted`](RunStatus::Aborted) if its tests were announced, and
    /// [`NoTestsFound`](RunStatus::NoTestsFound) otherwise. `error_stack` is only recorded if the
    /// run doesn't have one already.
    pub fn end_early(&mut self, error_stack: Option<String>) {
        self.status = match self.total_tests {
            Some(_) => RunStatus::Aborted,
            None => {
                self.total_tests = Some(0);
                RunStatus::NoTestsFound
            }
        };
        if self.error_stack.is_none() {
            self.error_stack = error_stack;
        }
        self.execution_time = Some(self.elapsed());
        self.end_time = Some(self.elapsed_end_time());
    }
}

/// The status of a run, as shown to an observer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunStatus {
    /// The run has been created, but the engine hasn't reported anything yet.
    Initialized,

    /// The engine has announced the tests in the run.
    Running,

    /// The given test is executing.
    Executing {
        /// The id of the executing test.
        test_id: String,
    },

    /// The engine reported the end of the run.
    Finished,

    /// The run ended without the engine reporting any tests.
    NoTestsFound,

    /// The event stream ended after the tests were announced, but before the engine reported the
    /// end of the run.
    Aborted,
}

impl RunStatus {
    /// Returns true if no further status changes are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::NoTestsFound | Self::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Executing { test_id } => write!(f, "{test_id}..."),
            Self::Finished => write!(f, "finished"),
            Self::NoTestsFound => write!(f, "no tests found"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// A single test within a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Test {
    /// The test id, as assigned by the engine.
    pub id: String,

    /// The id of the innermost suite enclosing this test.
    pub suite_id: Option<String>,

    /// The 1-based position of this test within the run.
    pub test_number: usize,

    /// The display name.
    pub name: String,

    /// An optional description.
    pub description: Option<String>,

    /// Whether the test was declared as disabled.
    pub disabled: bool,

    /// When the test started.
    pub start_time: Option<DateTime<FixedOffset>>,

    /// When the test finished.
    pub end_time: Option<DateTime<FixedOffset>>,

    /// How long the test took.
    pub execution_time: Option<Duration>,

    /// The outcome of this test.
    pub counter: Counter,

    /// The error stack, if the test errored.
    pub error_stack: Option<String>,

    /// Expectations that did not hold.
    pub failed_expectations: Vec<Expectation>,

    /// Warnings raised by the test or by its enclosing suites.
    pub warnings: Option<String>,

    /// Server output produced by the test or by its enclosing suites.
    pub server_output: Option<String>,
}

impl Test {
    fn from_declared(declared: DeclaredTest<'_>) -> Self {
        let descriptor = declared.descriptor;
        Self {
            id: descriptor.id.clone(),
            suite_id: declared.suite_id.map(str::to_owned),
            test_number: descriptor.test_number,
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            disabled: descriptor.disabled,
            start_time: None,
            end_time: None,
            execution_time: None,
            counter: Counter::ZERO,
            error_stack: None,
            failed_expectations: Vec::new(),
            warnings: None,
            server_output: None,
        }
    }

    /// Derives the status of this test from its timings and outcome.
    pub fn status(&self) -> TestStatus {
        let c = &self.counter;
        if c.error > 0 {
            TestStatus::Error
        } else if c.failure > 0 {
            TestStatus::Failure
        } else if c.success > 0 {
            TestStatus::Success
        } else if self.disabled || c.disabled > 0 {
            TestStatus::Disabled
        } else if self.start_time.is_some() && self.end_time.is_none() {
            TestStatus::Running
        } else {
            TestStatus::Pending
        }
    }

    /// Returns true if this test has non-empty warnings text.
    pub fn has_warnings(&self) -> bool {
        self.warnings.as_deref().is_some_and(|text| !text.is_empty())
    }
}

/// The status of a test, derived by [`Test::status`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TestStatus {
    /// The test hasn't started yet.
    Pending,

    /// The test has started but not finished.
    Running,

    /// The test is disabled.
    Disabled,

    /// The test passed.
    Success,

    /// An expectation in the test didn't hold.
    Failure,

    /// The test raised an unexpected error.
    Error,
}

/// A non-fatal problem found while processing events.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunDiagnostic {
    /// The run the event belonged to.
    pub reporter_id: ReporterId,

    /// The wire name of the event being processed.
    pub event: &'static str,

    /// What went wrong.
    pub kind: RunDiagnosticKind,
}

/// The kind of [`RunDiagnostic`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunDiagnosticKind {
    /// An event referred to a test that wasn't declared by the pre-run event.
    UnknownTestId {
        /// The unknown test id.
        test_id: String,
    },

    /// A suite produced output or warnings, but no test was executing to attribute them to.
    NoCurrentTest {
        /// The suite that produced the output.
        suite_id: String,
    },
}

impl fmt::Display for RunDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RunDiagnosticKind::UnknownTestId { test_id } => {
                write!(f, "{}: unknown test id `{test_id}`", self.event)
            }
            RunDiagnosticKind::NoCurrentTest { suite_id } => write!(
                f,
                "{}: no current test to attribute output of suite `{suite_id}` to",
                self.event
            ),
        }
    }
}

/// A shared, read-mostly handle to a [`Run`].
///
/// Observers read the run through this handle while the consume activity is writing to it. Reads
/// always see a consistent state: writes happen under a lock, one event at a time.
#[derive(Clone, Debug)]
pub struct RunHandle {
    inner: Arc<RwLock<Run>>,
}

impl RunHandle {
    /// Wraps a run in a new handle.
    pub fn new(run: Run) -> Self {
        Self {
            inner: Arc::new(RwLock::new(run)),
        }
    }

    /// Locks the run for reading.
    ///
    /// Hold the guard briefly: the consume activity is blocked from applying events while it is
    /// alive.
    pub fn read(&self) -> RwLockReadGuard<'_, Run> {
        // A panic while writing leaves the run in a state that is still worth showing.
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the current state of the run.
    pub fn snapshot(&self) -> Run {
        self.read().clone()
    }

    /// Returns the correlation id of the run.
    pub fn reporter_id(&self) -> ReporterId {
        self.read().reporter_id().clone()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Run> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
