// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use runwatch_metadata::{
    Counter, PostRunEvent, PostSuiteEvent, PostTestEvent, PreRunEvent, PreRunItem, PreSuiteEvent,
    PreTestEvent, ReporterId, RunEventKind, SuiteDescriptor, TestDescriptor,
};
use runwatch_runner::{
    config::ReporterConfig, observer::RunObserver, run_state::RunHandle,
};
use std::{
    sync::{Mutex, Once},
    time::Duration,
};

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Other test binaries may have installed a hook already.
        let _ = color_eyre::install();
    });
}

/// The default config, with a short grace period to keep tests fast.
pub(crate) fn test_config() -> ReporterConfig {
    let mut config = ReporterConfig::default();
    config.run.grace_period = Duration::from_millis(10);
    config
}

/// An observer that records every call it receives.
#[derive(Debug, Default)]
pub(crate) struct RecordingObserver {
    calls: Mutex<ObserverCalls>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ObserverCalls {
    pub(crate) set_model: usize,
    pub(crate) updates: usize,
    pub(crate) coverage: Vec<String>,
    pub(crate) dispose: usize,
    pub(crate) model: Option<RunHandle>,
}

impl RecordingObserver {
    pub(crate) fn calls(&self) -> ObserverCalls {
        self.calls.lock().unwrap().clone()
    }
}

impl RunObserver for RecordingObserver {
    fn set_model(&self, run: RunHandle) {
        let mut calls = self.calls.lock().unwrap();
        calls.set_model += 1;
        calls.model = Some(run);
    }

    fn update(&self, _reporter_id: &ReporterId) {
        self.calls.lock().unwrap().updates += 1;
    }

    fn show_coverage(&self, _reporter_id: &ReporterId, html: &str) {
        self.calls.lock().unwrap().coverage.push(html.to_owned());
    }

    fn dispose(&self) {
        self.calls.lock().unwrap().dispose += 1;
    }
}

pub(crate) fn success() -> Counter {
    Counter {
        success: 1,
        ..Counter::ZERO
    }
}

pub(crate) fn failure() -> Counter {
    Counter {
        failure: 1,
        ..Counter::ZERO
    }
}

/// Two tests in one suite: `t1` passes and `t2` fails.
pub(crate) fn two_test_script() -> Vec<RunEventKind> {
    vec![
        PreRunEvent {
            total_number_of_tests: 2,
            items: vec![PreRunItem::Suite(SuiteDescriptor {
                id: "app.suite".to_owned(),
                name: "suite".to_owned(),
                description: None,
                items: vec![
                    PreRunItem::Test(TestDescriptor::new("t1", 1)),
                    PreRunItem::Test(TestDescriptor::new("t2", 2)),
                ],
            })],
        }
        .into(),
        PreSuiteEvent {
            id: "app.suite".to_owned(),
            warnings: None,
            server_output: None,
        }
        .into(),
        PreTestEvent {
            id: "t1".to_owned(),
            test_number: 1,
        }
        .into(),
        PostTestEvent {
            id: "t1".to_owned(),
            execution_time: Some(Duration::from_millis(120)),
            counter: success(),
            ..PostTestEvent::default()
        }
        .into(),
        PreTestEvent {
            id: "t2".to_owned(),
            test_number: 2,
        }
        .into(),
        PostTestEvent {
            id: "t2".to_owned(),
            execution_time: Some(Duration::from_millis(80)),
            counter: failure(),
            error_stack: Some("expected 1, got 2".to_owned()),
            ..PostTestEvent::default()
        }
        .into(),
        PostSuiteEvent {
            id: "app.suite".to_owned(),
            server_output: Some("teardown done".to_owned()),
            ..PostSuiteEvent::default()
        }
        .into(),
        PostRunEvent {
            execution_time: Some(Duration::from_millis(250)),
            counter: Counter {
                success: 1,
                failure: 1,
                ..Counter::ZERO
            },
            ..PostRunEvent::default()
        }
        .into(),
    ]
}
