// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, bail, ensure};
use runwatch_metadata::{
    Counter, PostRunEvent, PostTestEvent, PreRunEvent, PreRunItem, ReporterId, RunEvent,
    RunEventKind, TestDescriptor,
};
use runwatch_runner::{
    channel::{
        CoverageOptions, DebugHost, RunRequest, TriggerOptions,
        memory::{MemoryBroker, MemoryChannel, ScriptedEngine},
    },
    config::ReporterConfig,
    coordinator::{
        ActivityStatus, CoordinatorState, RunCoordinator, RunCoordinatorBuilder, RunOptions,
    },
    errors::{ChannelError, CoordinatorBuildError},
    observer::RunObserver,
    run_state::{RunDiagnosticKind, RunStatus, TestStatus},
};
use pretty_assertions::assert_eq;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

struct Harness {
    broker: MemoryBroker,
    engine: Arc<ScriptedEngine>,
    producer: MemoryChannel,
    consumer: MemoryChannel,
    observer: Arc<RecordingObserver>,
}

impl Harness {
    fn new(engine: ScriptedEngine) -> Self {
        let broker = MemoryBroker::new();
        let engine = Arc::new(engine);
        let producer = broker.connect_to_engine(engine.clone());
        let consumer = broker.connect();
        Self {
            broker,
            engine,
            producer,
            consumer,
            observer: Arc::new(RecordingObserver::default()),
        }
    }

    fn coordinator(
        &self,
        config: ReporterConfig,
        options: RunOptions,
    ) -> Result<RunCoordinator<MemoryChannel>> {
        let mut builder = RunCoordinatorBuilder::new(config);
        builder.set_options(options).set_connection_name("local");
        let coordinator = builder.build(
            RunRequest::new(["app.suite"]),
            self.producer.clone(),
            self.consumer.clone(),
            Some(self.observer.clone()),
        )?;
        Ok(coordinator)
    }
}

#[test]
fn two_test_run() -> Result<()> {
    test_init();
    let harness = Harness::new(ScriptedEngine::new(two_test_script()));
    let coordinator = harness.coordinator(test_config(), RunOptions::default())?;
    ensure!(coordinator.state() == CoordinatorState::Idle, "built coordinator is idle");
    let reporter_id = coordinator.reporter_id().clone();

    let outcome = coordinator.execute()?;

    assert_eq!(outcome.state, CoordinatorState::Finished);
    assert_eq!(outcome.produce, ActivityStatus::Completed);
    assert_eq!(outcome.consume, ActivityStatus::Completed);
    assert!(outcome.finalized, "finalize ran");
    assert_eq!(outcome.coverage_report, None);

    let run = &outcome.run;
    assert_eq!(run.reporter_id(), &reporter_id);
    assert_eq!(run.connection_name(), "local");
    assert_eq!(run.path_list(), ["app.suite".to_owned()]);
    assert_eq!(run.total_tests(), Some(2));
    assert_eq!(
        *run.counter(),
        Counter {
            success: 1,
            failure: 1,
            ..Counter::ZERO
        }
    );
    assert_eq!(run.completed_tests(), 2);
    assert_eq!(*run.status(), RunStatus::Finished);
    assert_eq!(run.execution_time(), Some(Duration::from_millis(250)));
    assert!(run.is_terminal());
    assert!(run.is_detached());
    assert!(run.diagnostics().is_empty());

    let t1 = run.test("t1").expect("t1 declared");
    assert!(t1.start_time.is_some());
    assert_eq!(t1.execution_time, Some(Duration::from_millis(120)));
    assert_eq!(t1.status(), TestStatus::Success);

    let t2 = run.test("t2").expect("t2 declared");
    assert!(t2.start_time.is_some());
    assert_eq!(t2.status(), TestStatus::Failure);
    assert_eq!(t2.error_stack.as_deref(), Some("expected 1, got 2"));
    // The suite's output lands on the test that was executing when the suite ended.
    assert_eq!(
        t2.server_output.as_deref(),
        Some("=== suite app.suite ===\nteardown done")
    );
    assert_eq!(run.info_count(), 1);

    let calls = harness.observer.calls();
    assert_eq!(calls.set_model, 1);
    // One initial update, then one per event except pre-suite.
    assert_eq!(calls.updates, 8);
    assert_eq!(calls.dispose, 1);
    let model = calls.model.expect("model was set");
    assert_eq!(model.reporter_id(), reporter_id);
    assert_eq!(*model.read().status(), RunStatus::Finished);

    assert_eq!(harness.producer.close_count(), 1);
    assert_eq!(harness.consumer.close_count(), 1);

    let requests = harness.engine.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].reporter_id, reporter_id);
    assert_eq!(requests[0].options, test_config().trigger);
    Ok(())
}

#[test]
fn undeclared_test_id() -> Result<()> {
    test_init();
    let harness = Harness::new(ScriptedEngine::new([
        RunEventKind::PreRun(PreRunEvent {
            total_number_of_tests: 1,
            items: vec![PreRunItem::Test(TestDescriptor::new("t1", 1))],
        }),
        RunEventKind::PostTest(PostTestEvent {
            id: "t9".to_owned(),
            counter: failure(),
            ..PostTestEvent::default()
        }),
        RunEventKind::PostRun(PostRunEvent::default()),
    ]));

    let outcome = harness
        .coordinator(test_config(), RunOptions::default())?
        .execute()?;

    let run = &outcome.run;
    assert_eq!(run.counter().failure, 1);
    assert_eq!(run.test("t1").expect("t1 declared").counter, Counter::ZERO);
    assert_eq!(run.test("t9"), None);
    assert_eq!(
        run.diagnostics()
            .iter()
            .map(|diagnostic| &diagnostic.kind)
            .collect::<Vec<_>>(),
        vec![&RunDiagnosticKind::UnknownTestId {
            test_id: "t9".to_owned()
        }]
    );
    assert_eq!(*run.status(), RunStatus::Finished);
    Ok(())
}

#[test]
fn no_events() -> Result<()> {
    test_init();
    let harness = Harness::new(ScriptedEngine::default());
    let outcome = harness
        .coordinator(test_config(), RunOptions::default())?
        .execute()?;

    assert_eq!(outcome.state, CoordinatorState::Finished);
    let run = &outcome.run;
    assert_eq!(run.total_tests(), Some(0));
    assert_eq!(*run.status(), RunStatus::NoTestsFound);
    assert!(run.end_time().is_some(), "end time set");
    assert!(run.execution_time().is_some(), "execution time set");
    assert_eq!(run.tests().len(), 0);
    assert_eq!(harness.observer.calls().dispose, 1);
    Ok(())
}

#[test]
fn managed_connections_skip_finalize() -> Result<()> {
    test_init();
    let harness = Harness::new(ScriptedEngine::new(two_test_script()));
    let mut config = test_config();
    config.run.managed_connections = true;

    let outcome = harness.coordinator(config, RunOptions::default())?.execute()?;

    assert_eq!(outcome.state, CoordinatorState::Finished);
    assert!(!outcome.finalized, "finalize skipped");
    assert!(!outcome.run.is_detached());
    assert_eq!(harness.observer.calls().dispose, 0);
    assert_eq!(harness.producer.close_count(), 0);
    assert_eq!(harness.consumer.close_count(), 0);
    Ok(())
}

#[test]
fn coverage_after_successful_run() -> Result<()> {
    test_init();
    let harness = Harness::new(
        ScriptedEngine::new(two_test_script()).with_coverage_report("<html>87%</html>"),
    );
    let mut config = test_config();
    config.coverage = CoverageOptions {
        schemas: vec!["app".to_owned()],
        ..CoverageOptions::default()
    };

    let coordinator = harness.coordinator(
        config.clone(),
        RunOptions {
            coverage: true,
            ..RunOptions::default()
        },
    )?;
    let coverage_id = coordinator
        .coverage_reporter_id()
        .expect("coverage requested")
        .clone();
    ensure!(
        coverage_id != *coordinator.reporter_id(),
        "coverage uses its own correlation id"
    );

    let outcome = coordinator.execute()?;

    assert_eq!(outcome.coverage_report.as_deref(), Some("<html>87%</html>"));
    assert_eq!(outcome.run.coverage_reporter_id(), Some(&coverage_id));
    assert_eq!(
        harness.observer.calls().coverage,
        vec!["<html>87%</html>".to_owned()]
    );
    let requests = harness.engine.requests();
    assert_eq!(requests[0].coverage, Some(config.coverage));
    Ok(())
}

#[test]
fn no_coverage_after_aborted_run() -> Result<()> {
    test_init();
    let broker = MemoryBroker::new();
    // The producer has no engine, so the run never starts and the stream is aborted.
    let producer = broker.connect();
    let consumer = broker.connect();
    let observer = Arc::new(RecordingObserver::default());

    let mut builder = RunCoordinatorBuilder::new(test_config());
    builder.set_options(RunOptions {
        coverage: true,
        ..RunOptions::default()
    });
    let coordinator = builder.build(
        RunRequest::default(),
        producer,
        consumer,
        Some(observer.clone()),
    )?;
    let coverage_id = coordinator
        .coverage_reporter_id()
        .expect("coverage requested")
        .clone();
    broker.store_coverage_report(&coverage_id, "<html>stale</html>");

    let outcome = coordinator.execute()?;

    assert_eq!(outcome.state, CoordinatorState::Aborted);
    assert!(matches!(outcome.produce, ActivityStatus::Failed(_)));
    assert!(matches!(outcome.consume, ActivityStatus::Failed(_)));
    assert_eq!(outcome.coverage_report, None);
    assert!(observer.calls().coverage.is_empty(), "coverage not shown");
    assert!(outcome.finalized);

    // Nothing was announced before the stream was aborted.
    let run = &outcome.run;
    assert_eq!(*run.status(), RunStatus::NoTestsFound);
    assert_eq!(run.total_tests(), Some(0));
    let error_stack = run.error_stack().expect("error stack set");
    assert!(error_stack.starts_with("event stream for"), "{error_stack}");
    assert!(run.is_terminal());
    Ok(())
}

#[test]
fn unknown_event_kind_fails_consume() -> Result<()> {
    test_init();
    let harness = Harness::new(ScriptedEngine::new(two_test_script()));
    let coordinator = harness.coordinator(test_config(), RunOptions::default())?;
    let reporter_id = coordinator.reporter_id().clone();
    harness.broker.publish_line(
        &reporter_id,
        format!(r#"{{"reporter-id":"{reporter_id}","event":"pre-flight"}}"#),
    );

    let outcome = coordinator.execute()?;

    assert_eq!(outcome.state, CoordinatorState::Aborted);
    let ActivityStatus::Failed(message) = &outcome.consume else {
        bail!("consume should have failed, was {:?}", outcome.consume);
    };
    assert!(message.starts_with("protocol error on channel"), "{message}");
    assert_eq!(outcome.produce, ActivityStatus::Completed);

    // The bad line came before the pre-run event.
    let run = &outcome.run;
    assert_eq!(*run.status(), RunStatus::NoTestsFound);
    assert_eq!(run.error_stack(), Some(message.as_str()));
    assert_eq!(run.total_tests(), Some(0));
    assert!(run.is_terminal());
    assert!(outcome.finalized);
    Ok(())
}

#[test]
fn produce_failure_does_not_stop_consume() -> Result<()> {
    test_init();
    let harness =
        Harness::new(ScriptedEngine::new(two_test_script()).with_failure("listener crashed"));

    let outcome = harness
        .coordinator(test_config(), RunOptions::default())?
        .execute()?;

    assert_eq!(outcome.state, CoordinatorState::Finished);
    assert_eq!(
        outcome.produce,
        ActivityStatus::Failed("remote engine error\n  caused by:\n  - listener crashed".to_owned())
    );
    assert_eq!(outcome.consume, ActivityStatus::Completed);
    assert_eq!(*outcome.run.status(), RunStatus::Finished);
    assert_eq!(outcome.run.completed_tests(), 2);
    assert!(outcome.finalized);
    Ok(())
}

#[test]
fn receive_timeout_aborts_run() -> Result<()> {
    test_init();
    let broker = MemoryBroker::new();
    let engine = ScriptedEngine::new([
        RunEventKind::PreRun(PreRunEvent {
            total_number_of_tests: 1,
            items: vec![PreRunItem::Test(TestDescriptor::new("t1", 1))],
        }),
        RunEventKind::PostRun(PostRunEvent::default()),
    ]);
    let producer = broker
        .connect_to_engine(Arc::new(engine))
        .with_event_interval(Duration::from_millis(500));
    let observer = Arc::new(RecordingObserver::default());
    let mut config = test_config();
    config.run.receive_timeout = Some(Duration::from_millis(100));

    let outcome = RunCoordinatorBuilder::new(config)
        .build(
            RunRequest::default(),
            producer,
            broker.connect(),
            Some(observer.clone()),
        )?
        .execute()?;

    assert_eq!(outcome.state, CoordinatorState::Aborted);
    let run = &outcome.run;
    assert_eq!(*run.status(), RunStatus::Aborted);
    let error_stack = run.error_stack().expect("error stack set");
    assert!(error_stack.starts_with("timed out after 100ms"), "{error_stack}");
    assert_eq!(observer.calls().dispose, 1);
    Ok(())
}

#[test]
fn debug_mode_uses_debug_host() -> Result<()> {
    test_init();
    let broker = MemoryBroker::new();
    let engine = Arc::new(ScriptedEngine::new(two_test_script()));
    let host = broker.connect_to_engine(engine.clone());
    let observer = Arc::new(RecordingObserver::default());

    let mut builder = RunCoordinatorBuilder::new(test_config());
    builder
        .set_options(RunOptions {
            debug: true,
            ..RunOptions::default()
        })
        .set_debug_host(Arc::new(host));
    // Neither connection has an engine: only the debug host can start the run.
    let outcome = builder
        .build(
            RunRequest::new(["app.suite"]),
            broker.connect(),
            broker.connect(),
            Some(observer.clone()),
        )?
        .execute()?;

    assert_eq!(outcome.state, CoordinatorState::Finished);
    assert_eq!(outcome.produce, ActivityStatus::Completed);
    assert_eq!(*outcome.run.status(), RunStatus::Finished);
    assert_eq!(engine.requests().len(), 1);
    Ok(())
}

/// Announces one test, then holds on to the run without ending its stream.
struct StallingDebugHost {
    broker: MemoryBroker,
    stall: Duration,
}

impl DebugHost for StallingDebugHost {
    fn debug(
        &self,
        reporter_id: &ReporterId,
        _request: &RunRequest,
        _options: &TriggerOptions,
    ) -> Result<(), ChannelError> {
        self.broker.publish(&RunEvent::new(
            reporter_id.clone(),
            RunEventKind::PreRun(PreRunEvent {
                total_number_of_tests: 1,
                items: vec![PreRunItem::Test(TestDescriptor::new("t1", 1))],
            }),
        ))?;
        std::thread::sleep(self.stall);
        Ok(())
    }
}

#[test]
fn debug_mode_waits_for_debug_timeout() -> Result<()> {
    test_init();
    let broker = MemoryBroker::new();
    let observer = Arc::new(RecordingObserver::default());
    let mut config = test_config();
    config.run.debug_timeout = Duration::from_millis(100);
    // Not used in debug mode.
    config.run.receive_timeout = Some(Duration::from_secs(30));

    let mut builder = RunCoordinatorBuilder::new(config);
    builder
        .set_options(RunOptions {
            debug: true,
            ..RunOptions::default()
        })
        .set_debug_host(Arc::new(StallingDebugHost {
            broker: broker.clone(),
            stall: Duration::from_millis(300),
        }));
    let outcome = builder
        .build(
            RunRequest::default(),
            broker.connect(),
            broker.connect(),
            Some(observer.clone()),
        )?
        .execute()?;

    assert_eq!(outcome.state, CoordinatorState::Aborted);
    assert_eq!(outcome.produce, ActivityStatus::Completed);
    let run = &outcome.run;
    assert_eq!(*run.status(), RunStatus::Aborted);
    assert_eq!(run.total_tests(), Some(1));
    let error_stack = run.error_stack().expect("error stack set");
    assert!(error_stack.starts_with("timed out after 100ms"), "{error_stack}");
    assert!(run.is_terminal());
    assert_eq!(observer.calls().dispose, 1);
    Ok(())
}

#[test]
fn build_errors() {
    test_init();
    let broker = MemoryBroker::new();

    let err = RunCoordinatorBuilder::new(test_config())
        .build(RunRequest::default(), broker.connect(), broker.connect(), None)
        .expect_err("no observer");
    assert!(
        matches!(err, CoordinatorBuildError::ObserverUnavailable { .. }),
        "{err:?}"
    );

    let mut builder = RunCoordinatorBuilder::new(test_config());
    builder.set_options(RunOptions {
        debug: true,
        ..RunOptions::default()
    });
    let observer: Arc<dyn RunObserver> = Arc::new(RecordingObserver::default());
    let err = builder
        .build(
            RunRequest::default(),
            broker.connect(),
            broker.connect(),
            Some(observer),
        )
        .expect_err("no debug host");
    assert!(
        matches!(err, CoordinatorBuildError::DebugHostMissing { .. }),
        "{err:?}"
    );
}

/// Panics on the first update caused by an event.
#[derive(Default)]
struct PanickingObserver {
    inner: RecordingObserver,
    updates: AtomicUsize,
}

impl RunObserver for PanickingObserver {
    fn set_model(&self, run: runwatch_runner::run_state::RunHandle) {
        self.inner.set_model(run);
    }

    fn update(&self, reporter_id: &ReporterId) {
        if self.updates.fetch_add(1, Ordering::SeqCst) == 1 {
            panic!("observer panicked");
        }
        self.inner.update(reporter_id);
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

#[test]
fn consume_panic_still_finalizes() -> Result<()> {
    test_init();
    let broker = MemoryBroker::new();
    let producer = broker.connect_to_engine(Arc::new(ScriptedEngine::new(two_test_script())));
    let consumer = broker.connect();
    let observer = Arc::new(PanickingObserver::default());

    let err = RunCoordinatorBuilder::new(test_config())
        .build(
            RunRequest::default(),
            producer.clone(),
            consumer.clone(),
            Some(observer.clone()),
        )?
        .execute()
        .expect_err("consume panicked");

    assert_eq!(err.join_errors.len(), 1);
    ensure!(err.join_errors[0].is_panic(), "join error is a panic");
    assert_eq!(observer.inner.calls().dispose, 1);
    assert_eq!(producer.close_count(), 1);
    assert_eq!(consumer.close_count(), 1);

    // The panic hit the update for the pre-run event, so the run was ended by finalize.
    let model = observer.inner.calls().model.expect("model was set");
    let run = model.read();
    assert!(run.is_terminal(), "run left terminal");
    assert!(run.is_detached());
    assert_eq!(*run.status(), RunStatus::Aborted);
    assert_eq!(run.total_tests(), Some(2));
    assert!(run.execution_time().is_some());
    assert_eq!(
        run.error_stack(),
        Some("consume activity ended before the run finished")
    );
    Ok(())
}
