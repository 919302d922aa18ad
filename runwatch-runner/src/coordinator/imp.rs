// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::finalize::{FinalizeContext, Finalizer};
use crate::{
    channel::{DebugHost, EventChannel, RunRequest},
    config::ReporterConfig,
    errors::{ChannelError, CoordinatorBuildError, CoordinatorExecuteError, DisplayErrorChain},
    observer::RunObserver,
    processor::RunProcessor,
    run_state::{Run, RunHandle},
};
use async_scoped::TokioScope;
use debug_ignore::DebugIgnore;
use runwatch_metadata::ReporterId;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::runtime::Runtime;
use tracing::{debug, error, warn};

/// Per-run choices, as opposed to the [`ReporterConfig`] shared by all runs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunOptions {
    /// Run under a [`DebugHost`] instead of triggering the run directly.
    pub debug: bool,

    /// Gather code coverage and show the report once the run completes.
    pub coverage: bool,
}

/// The lifecycle state of a [`RunCoordinator`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CoordinatorState {
    /// Built, but not yet executed.
    Idle,

    /// Handing the run to the observer.
    Starting,

    /// Both activities have been scheduled.
    Running,

    /// The consume activity completed: the event stream ended normally.
    Finished,

    /// The consume activity failed or panicked.
    Aborted,
}

/// How an activity ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActivityStatus {
    /// The activity completed normally.
    Completed,

    /// The activity failed with the given message.
    Failed(String),

    /// The activity panicked, or was cancelled before it could finish.
    Panicked,
}

/// One of the two activities of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Activity {
    Produce,
    Consume,
}

impl Activity {
    pub(super) fn index(self) -> usize {
        match self {
            Self::Produce => 0,
            Self::Consume => 1,
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Produce => write!(f, "produce"),
            Self::Consume => write!(f, "consume"),
        }
    }
}

/// The result of [`RunCoordinator::execute`].
#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// The final state of the coordinator: [`Finished`](CoordinatorState::Finished) or
    /// [`Aborted`](CoordinatorState::Aborted).
    pub state: CoordinatorState,

    /// The run as of the end of execution.
    pub run: Run,

    /// How the produce activity ended.
    pub produce: ActivityStatus,

    /// How the consume activity ended.
    pub consume: ActivityStatus,

    /// The coverage report, if coverage was requested and fetched.
    pub coverage_report: Option<String>,

    /// Whether the finalize step ran.
    pub finalized: bool,
}

/// Builder for a [`RunCoordinator`].
#[derive(Debug)]
pub struct RunCoordinatorBuilder {
    config: ReporterConfig,
    options: RunOptions,
    connection_name: String,
    debug_host: DebugIgnore<Option<Arc<dyn DebugHost>>>,
}

impl RunCoordinatorBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(config: ReporterConfig) -> Self {
        Self {
            config,
            options: RunOptions::default(),
            connection_name: "default".to_owned(),
            debug_host: DebugIgnore(None),
        }
    }

    /// Sets the per-run options.
    pub fn set_options(&mut self, options: RunOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Sets the name of the connection the run executes on, used for display.
    pub fn set_connection_name(&mut self, connection_name: impl Into<String>) -> &mut Self {
        self.connection_name = connection_name.into();
        self
    }

    /// Sets the host used to run under a debugger. Required in debug mode.
    pub fn set_debug_host(&mut self, debug_host: Arc<dyn DebugHost>) -> &mut Self {
        self.debug_host = DebugIgnore(Some(debug_host));
        self
    }

    /// Creates a new coordinator for `request`.
    ///
    /// `producer` and `consumer` must be two distinct connections to the same channel. Fails if
    /// there is no observer to display the run, or if debug mode was requested without a debug
    /// host.
    pub fn build<C: EventChannel>(
        self,
        request: RunRequest,
        producer: C,
        consumer: C,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> Result<RunCoordinator<C>, CoordinatorBuildError> {
        let reporter_id = ReporterId::new_random();

        let Some(observer) = observer else {
            error!(%reporter_id, "no observer available to display run");
            return Err(CoordinatorBuildError::ObserverUnavailable { reporter_id });
        };

        let debug_host = match (self.options.debug, self.debug_host.0) {
            (true, None) => {
                error!(%reporter_id, "debug mode requested without a debug host");
                return Err(CoordinatorBuildError::DebugHostMissing { reporter_id });
            }
            (true, Some(host)) => Some(host),
            (false, _) => None,
        };

        let coverage_reporter_id = self.options.coverage.then(ReporterId::new_random);
        let mut run = Run::new(
            reporter_id.clone(),
            self.connection_name,
            request.path_list.clone(),
        );
        if let Some(coverage_reporter_id) = &coverage_reporter_id {
            run = run.with_coverage_reporter_id(coverage_reporter_id.clone());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("runwatch-worker")
            .build()
            .map_err(CoordinatorBuildError::TokioRuntimeCreate)?;

        debug!(%reporter_id, path_list = ?request.path_list, "built run coordinator");

        Ok(RunCoordinator {
            inner: CoordinatorInner {
                reporter_id,
                coverage_reporter_id,
                config: self.config,
                options: self.options,
                request,
                producer,
                consumer,
                observer: DebugIgnore(observer),
                debug_host: DebugIgnore(debug_host),
                run: RunHandle::new(run),
            },
            state: CoordinatorState::Idle,
            runtime,
        })
    }
}

/// Drives a single run: triggers it on one connection while consuming its events on another.
#[derive(Debug)]
pub struct RunCoordinator<C> {
    inner: CoordinatorInner<C>,
    state: CoordinatorState,
    runtime: Runtime,
}

impl<C: EventChannel> RunCoordinator<C> {
    /// Returns the correlation id of the run.
    pub fn reporter_id(&self) -> &ReporterId {
        &self.inner.reporter_id
    }

    /// Returns the correlation id of the coverage report, if coverage was requested.
    pub fn coverage_reporter_id(&self) -> Option<&ReporterId> {
        self.inner.coverage_reporter_id.as_ref()
    }

    /// Returns a handle to the run.
    pub fn run(&self) -> &RunHandle {
        &self.inner.run
    }

    /// Returns the current state of the coordinator.
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Executes the run, blocking until both activities have ended.
    ///
    /// Channel failures are not returned: they are logged and show up in the run and in the
    /// returned [`RunOutcome`]. Returns an error if either activity panicked; the run has been
    /// finalized by then.
    pub fn execute(mut self) -> Result<RunOutcome, CoordinatorExecuteError> {
        self.set_state(CoordinatorState::Starting);
        self.inner.observer.set_model(self.inner.run.clone());
        self.inner.observer.update(&self.inner.reporter_id);

        self.set_state(CoordinatorState::Running);
        let (outcome, join_errors) = {
            let _guard = self.runtime.enter();
            self.inner.execute()
        };

        // Both activities have been joined by now. Only tasks they detached are left.
        self.runtime.shutdown_background();

        if !join_errors.is_empty() {
            return Err(CoordinatorExecuteError {
                reporter_id: self.inner.reporter_id,
                join_errors,
            });
        }
        debug!(
            reporter_id = %self.inner.reporter_id,
            state = ?outcome.state,
            "run coordinator done"
        );
        Ok(outcome)
    }

    fn set_state(&mut self, state: CoordinatorState) {
        debug!(reporter_id = %self.inner.reporter_id, ?state, "coordinator state changed");
        self.state = state;
    }
}

#[derive(Debug)]
struct CoordinatorInner<C> {
    reporter_id: ReporterId,
    coverage_reporter_id: Option<ReporterId>,
    config: ReporterConfig,
    options: RunOptions,
    request: RunRequest,
    producer: C,
    consumer: C,
    observer: DebugIgnore<Arc<dyn RunObserver>>,
    debug_host: DebugIgnore<Option<Arc<dyn DebugHost>>>,
    run: RunHandle,
}

impl<C: EventChannel> CoordinatorInner<C> {
    fn execute(&self) -> (RunOutcome, Vec<tokio::task::JoinError>) {
        let finalizer = Finalizer::new(FinalizeContext {
            reporter_id: &self.reporter_id,
            producer: &self.producer,
            consumer: &self.consumer,
            observer: &**self.observer,
            run: &self.run,
            managed_connections: self.config.run.managed_connections,
        });
        let coverage_report = Mutex::new(None);

        let finalizer_ref = &finalizer;
        let coverage_report_ref = &coverage_report;

        let ((), results) = TokioScope::scope_and_block(move |scope| {
            // Consume is scheduled first, so the listener is in place before the engine is asked
            // to start.
            let consume_fut = async move {
                let guard = finalizer_ref.guard(Activity::Consume);
                let (status, report) = self.consume().await;
                if let Some(report) = report {
                    *coverage_report_ref
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(report);
                }
                guard.complete(status);
            };
            scope.spawn_cancellable(consume_fut, || ());

            let produce_fut = async move {
                let guard = finalizer_ref.guard(Activity::Produce);
                tokio::time::sleep(self.config.run.grace_period).await;
                let status = self.produce().await;
                guard.complete(status);
            };
            scope.spawn_cancellable(produce_fut, || ());
        });

        let join_errors = results
            .into_iter()
            .filter_map(|r| r.err())
            .collect::<Vec<_>>();

        let consume = finalizer.status(Activity::Consume);
        let state = if consume == ActivityStatus::Completed {
            CoordinatorState::Finished
        } else {
            CoordinatorState::Aborted
        };
        let outcome = RunOutcome {
            state,
            run: self.run.snapshot(),
            produce: finalizer.status(Activity::Produce),
            consume,
            coverage_report: coverage_report
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            finalized: finalizer.finalized(),
        };
        (outcome, join_errors)
    }

    /// Receives events until the stream ends, then fetches the coverage report if one was
    /// requested.
    async fn consume(&self) -> (ActivityStatus, Option<String>) {
        let mut processor = RunProcessor::new(self.run.clone(), (*self.observer).clone());
        let timeout = self.receive_timeout();
        debug!(reporter_id = %self.reporter_id, ?timeout, "receiving events");

        let res = self
            .consumer
            .receive(&self.reporter_id, timeout, |event| processor.process(event))
            .await;

        match &res {
            Ok(()) => {}
            Err(err @ ChannelError::Decode(_)) => processor.log_decode_error(err),
            Err(err) => warn!(
                reporter_id = %self.reporter_id,
                activity = %Activity::Consume,
                "receiving events failed: {}",
                DisplayErrorChain::new(err),
            ),
        }
        processor.finish(res.as_ref().err());

        if let Err(err) = res {
            return (
                ActivityStatus::Failed(DisplayErrorChain::new(err).to_string()),
                None,
            );
        }

        let report = match &self.coverage_reporter_id {
            Some(coverage_id) => self.fetch_coverage(coverage_id).await,
            None => None,
        };
        (ActivityStatus::Completed, report)
    }

    async fn fetch_coverage(&self, coverage_id: &ReporterId) -> Option<String> {
        match self.consumer.fetch_coverage_report(coverage_id).await {
            Ok(html) => {
                self.observer.show_coverage(&self.reporter_id, &html);
                Some(html)
            }
            Err(err) => {
                warn!(
                    reporter_id = %self.reporter_id,
                    %coverage_id,
                    "failed to fetch coverage report: {}",
                    DisplayErrorChain::new(err),
                );
                None
            }
        }
    }

    /// Asks the engine to start the run.
    async fn produce(&self) -> ActivityStatus {
        let trigger = &self.config.trigger;
        debug!(reporter_id = %self.reporter_id, debug = self.options.debug, "triggering run");

        let res = if let Some(debug_host) = &*self.debug_host {
            tokio::task::block_in_place(|| {
                debug_host.debug(&self.reporter_id, &self.request, trigger)
            })
        } else if let Some(coverage_id) = &self.coverage_reporter_id {
            self.producer
                .trigger_with_coverage(
                    &self.reporter_id,
                    coverage_id,
                    &self.request,
                    trigger,
                    &self.config.coverage,
                )
                .await
        } else {
            self.producer
                .trigger(&self.reporter_id, &self.request, trigger)
                .await
        };

        match res {
            Ok(()) => ActivityStatus::Completed,
            Err(err) => {
                warn!(
                    reporter_id = %self.reporter_id,
                    activity = %Activity::Produce,
                    "triggering run failed: {}",
                    DisplayErrorChain::new(&err),
                );
                ActivityStatus::Failed(DisplayErrorChain::new(err).to_string())
            }
        }
    }

    fn receive_timeout(&self) -> Option<Duration> {
        if self.options.debug {
            Some(self.config.run.debug_timeout)
        } else {
            self.config.run.receive_timeout
        }
    }
}
