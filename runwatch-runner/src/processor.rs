// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Folds events into the state of a run.
//!
//! The [`RunProcessor`] is the only writer of a [`Run`]. Each event is applied under the write
//! lock, and the observer is notified once the lock has been released.

use crate::{
    errors::{ChannelError, DisplayErrorChain},
    observer::RunObserver,
    run_state::{Run, RunDiagnostic, RunDiagnosticKind, RunHandle, RunStatus},
    time,
};
use runwatch_metadata::{
    PostRunEvent, PostSuiteEvent, PostTestEvent, PreRunEvent, PreTestEvent, ReporterId, RunEvent,
    RunEventKind,
};
use std::{ops::ControlFlow, sync::Arc};
use tracing::{debug, error, warn};

/// Applies events to a run, notifying an observer after every change.
pub struct RunProcessor {
    run: RunHandle,
    observer: Arc<dyn RunObserver>,
    reporter_id: ReporterId,
    saw_post_run: bool,
}

impl RunProcessor {
    /// Creates a new processor writing to `run`.
    pub fn new(run: RunHandle, observer: Arc<dyn RunObserver>) -> Self {
        let reporter_id = run.reporter_id();
        Self {
            run,
            observer,
            reporter_id,
            saw_post_run: false,
        }
    }

    /// Returns the run being written to.
    pub fn run(&self) -> &RunHandle {
        &self.run
    }

    /// Returns true once the post-run event has been processed.
    pub fn saw_post_run(&self) -> bool {
        self.saw_post_run
    }

    /// Applies a single event.
    ///
    /// Returns [`ControlFlow::Break`] once the run has ended, after which no further events are
    /// expected.
    pub fn process(&mut self, event: RunEvent) -> ControlFlow<()> {
        let name = event.kind.name();
        debug!(reporter_id = %self.reporter_id, event = name, "processing event");

        let notify = {
            let mut run = self.run.write();
            match event.kind {
                RunEventKind::PreRun(event) => {
                    on_pre_run(&mut run, event);
                    true
                }
                RunEventKind::PreSuite(_) => false,
                RunEventKind::PreTest(event) => {
                    on_pre_test(&mut run, event);
                    true
                }
                RunEventKind::PostTest(event) => {
                    on_post_test(&mut run, event);
                    true
                }
                RunEventKind::PostSuite(event) => {
                    on_post_suite(&mut run, event);
                    true
                }
                RunEventKind::PostRun(event) => {
                    on_post_run(&mut run, event);
                    self.saw_post_run = true;
                    true
                }
            }
        };

        if notify {
            self.observer.update(&self.reporter_id);
        }

        if self.saw_post_run {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Finalizes the run after the event stream has ended, with `error` if it ended abnormally.
    ///
    /// Does nothing if the post-run event was seen and the stream ended cleanly.
    pub fn finish(&mut self, error: Option<&ChannelError>) {
        if self.saw_post_run && error.is_none() {
            return;
        }

        {
            let mut run = self.run.write();
            run.end_early(error.map(|error| DisplayErrorChain::new(error).to_string()));
            debug!(
                reporter_id = %self.reporter_id,
                status = %run.status(),
                "event stream ended without post-run"
            );
        }

        self.observer.update(&self.reporter_id);
    }

    /// Logs a decode error, which fails the run.
    pub(crate) fn log_decode_error(&self, error: &ChannelError) {
        error!(
            reporter_id = %self.reporter_id,
            "failed to decode event: {}",
            DisplayErrorChain::new(error),
        );
    }
}

fn on_pre_run(run: &mut Run, event: PreRunEvent) {
    run.set_total_tests(event.total_number_of_tests);
    run.put(&event.items);
    run.set_status(RunStatus::Running);
}

fn on_pre_test(run: &mut Run, event: PreTestEvent) {
    match run.test_mut(&event.id) {
        Some(test) => test.start_time = Some(time::now()),
        None => diagnose(
            run,
            "pre-test",
            RunDiagnosticKind::UnknownTestId {
                test_id: event.id.clone(),
            },
        ),
    }

    run.set_current_test(Some(&event.id));
    run.set_current_test_number(event.test_number);
    run.set_status(RunStatus::Executing { test_id: event.id });
}

fn on_post_test(run: &mut Run, event: PostTestEvent) {
    let outcomes = event.counter.outcomes();

    match run.test_mut(&event.id) {
        Some(test) => {
            let had_output = has_text(test.server_output.as_deref());

            if event.start_time.is_some() {
                test.start_time = event.start_time;
            }
            if event.end_time.is_some() {
                test.end_time = event.end_time;
            }
            if event.execution_time.is_some() {
                test.execution_time = event.execution_time;
            }
            test.counter = event.counter;
            if event.error_stack.is_some() {
                test.error_stack = event.error_stack;
            }
            if has_text(event.server_output.as_deref()) {
                test.server_output = event.server_output;
            }
            test.failed_expectations = event.failed_expectations;
            if has_text(event.warnings.as_deref()) {
                test.warnings = event.warnings;
            }

            // The engine's raw warning count is replaced by whether any warnings text exists.
            test.counter.warning = usize::from(test.has_warnings());

            let first_output = !had_output && has_text(test.server_output.as_deref());
            let warning = test.counter.warning;
            if first_output {
                run.increment_info_count();
            }
            run.counter_mut().warning += warning;
        }
        None => diagnose(
            run,
            "post-test",
            RunDiagnosticKind::UnknownTestId { test_id: event.id },
        ),
    }

    *run.counter_mut() += outcomes;
}

fn on_post_suite(run: &mut Run, event: PostSuiteEvent) {
    let warnings = event.warnings.filter(|text| !text.is_empty());
    let server_output = event.server_output.filter(|text| !text.is_empty());
    if warnings.is_none() && server_output.is_none() {
        return;
    }

    let Some(test) = run.current_test_mut() else {
        diagnose(
            run,
            "post-suite",
            RunDiagnosticKind::NoCurrentTest { suite_id: event.id },
        );
        return;
    };

    let mut first_output = false;
    if let Some(output) = server_output {
        first_output = !has_text(test.server_output.as_deref());
        append_suite_text(&mut test.server_output, &event.id, &output);
    }

    let mut first_warning = false;
    if let Some(text) = warnings {
        first_warning = !test.has_warnings();
        append_suite_text(&mut test.warnings, &event.id, &text);
        if first_warning {
            test.counter.warning = 1;
        }
    }

    if first_output {
        run.increment_info_count();
    }
    if first_warning {
        run.counter_mut().warning += 1;
    }
}

fn on_post_run(run: &mut Run, event: PostRunEvent) {
    if let Some(start_time) = event.start_time {
        run.set_start_time(start_time);
    }
    let end_time = event.end_time.unwrap_or_else(|| run.elapsed_end_time());
    run.set_end_time(end_time);
    let execution_time = event.execution_time.unwrap_or_else(|| run.elapsed());
    run.set_execution_time(execution_time);
    if let Some(error_stack) = event.error_stack {
        run.set_error_stack(error_stack);
    }
    if let Some(server_output) = event.server_output {
        run.set_server_output(server_output);
    }
    run.set_status(RunStatus::Finished);
}

fn diagnose(run: &mut Run, event: &'static str, kind: RunDiagnosticKind) {
    let diagnostic = RunDiagnostic {
        reporter_id: run.reporter_id().clone(),
        event,
        kind,
    };
    warn!(reporter_id = %diagnostic.reporter_id, "{diagnostic}");
    run.push_diagnostic(diagnostic);
}

fn has_text(text: Option<&str>) -> bool {
    text.is_some_and(|text| !text.is_empty())
}

/// Appends a suite-scoped contribution to `existing`, under a header naming the suite.
fn append_suite_text(existing: &mut Option<String>, suite_id: &str, text: &str) {
    let contribution = format!("=== suite {suite_id} ===\n{text}");
    match existing {
        Some(existing) if !existing.is_empty() => {
            existing.push_str("\n\n");
            existing.push_str(&contribution);
        }
        _ => *existing = Some(contribution),
    }
}
