// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An in-process event channel.
//!
//! A [`MemoryBroker`] holds one queue of JSON lines per reporter id. Each [`MemoryChannel`] is a
//! connection to a broker; connections attached to a [`RemoteEngine`] can trigger runs, whose
//! events are encoded onto the broker and decoded again by the receiving connection.
//!
//! The broker only holds on to a stream until it has ended and been picked up, and to a coverage
//! report until it has been fetched.

use super::{CoverageOptions, DebugHost, EventChannel, RunRequest, TriggerOptions};
use crate::errors::{ChannelError, EngineError};
use debug_ignore::DebugIgnore;
use runwatch_metadata::{ReporterId, RunEvent, RunEventKind};
use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        watch,
    },
    time::Instant,
};
use tracing::debug;

/// A message on a broker queue.
#[derive(Debug)]
enum Message {
    Line(String),
    EndOfStream,
    Abort,
}

impl Message {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Abort)
    }
}

#[derive(Debug)]
struct Queue {
    tx: UnboundedSender<Message>,
    // Taken by the first connection that receives from this queue.
    rx: Option<UnboundedReceiver<Message>>,
    // Set once the end of stream or an abort has been queued.
    ended: bool,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            ended: false,
        }
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    queues: HashMap<ReporterId, Queue>,
    coverage_reports: HashMap<ReporterId, String>,
}

impl BrokerInner {
    fn queue(&mut self, reporter_id: &ReporterId) -> &mut Queue {
        self.queues
            .entry(reporter_id.clone())
            .or_insert_with(Queue::new)
    }
}

/// The shared state behind a set of [`MemoryChannel`] connections.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
    /// Creates a new, empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection to this broker with no engine attached.
    ///
    /// Such a connection can receive events, but can't trigger runs.
    pub fn connect(&self) -> MemoryChannel {
        MemoryChannel::new(self.clone(), None)
    }

    /// Opens a new connection to this broker, attached to `engine`.
    pub fn connect_to_engine(&self, engine: Arc<dyn RemoteEngine>) -> MemoryChannel {
        MemoryChannel::new(self.clone(), Some(engine))
    }

    /// Publishes an event onto the queue for its reporter id.
    pub fn publish(&self, event: &RunEvent) -> Result<(), ChannelError> {
        let line = event.to_json_line().map_err(ChannelError::Encode)?;
        self.publish_line(&event.reporter_id, line);
        Ok(())
    }

    /// Publishes a raw line onto the queue for `reporter_id`.
    ///
    /// The line is decoded by the receiving connection.
    pub fn publish_line(&self, reporter_id: &ReporterId, line: impl Into<String>) {
        self.send(reporter_id, Message::Line(line.into()));
    }

    /// Marks the end of the stream for `reporter_id`.
    pub fn end_of_stream(&self, reporter_id: &ReporterId) {
        self.send(reporter_id, Message::EndOfStream);
    }

    /// Aborts the stream for `reporter_id`. The receiving connection fails with
    /// [`ChannelError::Aborted`].
    pub fn abort(&self, reporter_id: &ReporterId) {
        self.send(reporter_id, Message::Abort);
    }

    /// Stores a coverage report, to be fetched with `coverage_id`.
    pub fn store_coverage_report(&self, coverage_id: &ReporterId, html: impl Into<String>) {
        self.lock()
            .coverage_reports
            .insert(coverage_id.clone(), html.into());
    }

    /// Queues `message` for `reporter_id`.
    ///
    /// A queue is dropped from the broker once its stream has ended and its receiver has been
    /// taken. Messages already queued stay readable through the receiver.
    fn send(&self, reporter_id: &ReporterId, message: Message) {
        let mut inner = self.lock();
        let terminal = message.is_terminal();
        let queue = inner.queue(reporter_id);
        // The receiver may have been dropped after the consumer stopped early: nothing is
        // listening, so there's nothing to do.
        let _ = queue.tx.send(message);

        if terminal {
            if queue.rx.is_some() {
                queue.ended = true;
            } else {
                inner.queues.remove(reporter_id);
            }
        }
    }

    fn take_receiver(&self, reporter_id: &ReporterId) -> Option<UnboundedReceiver<Message>> {
        let mut inner = self.lock();
        let queue = inner.queue(reporter_id);
        let rx = queue.rx.take();
        if queue.ended {
            inner.queues.remove(reporter_id);
        }
        rx
    }

    /// Removes and returns the coverage report stored under `coverage_id`.
    fn take_coverage_report(&self, coverage_id: &ReporterId) -> Option<String> {
        self.lock().coverage_reports.remove(coverage_id)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A request handed to a [`RemoteEngine`].
#[derive(Clone, Copy, Debug)]
pub struct EngineRequest<'a> {
    /// The correlation id to tag events with.
    pub reporter_id: &'a ReporterId,

    /// What to run.
    pub request: &'a RunRequest,

    /// Options for the run.
    pub options: &'a TriggerOptions,

    /// Coverage options, if coverage was requested.
    pub coverage: Option<&'a CoverageOptions>,
}

/// The engine behind a [`MemoryChannel`], executing runs and emitting their events.
pub trait RemoteEngine: Send + Sync {
    /// Executes a run, calling `emit` once per event in order.
    ///
    /// This is called from an async context and must not block.
    fn execute(
        &self,
        request: &EngineRequest<'_>,
        emit: &mut dyn FnMut(RunEventKind),
    ) -> Result<(), EngineError>;

    /// Returns the HTML coverage report for a run executed with coverage.
    fn coverage_report(&self, request: &EngineRequest<'_>) -> Option<String> {
        let _ = request;
        None
    }
}

/// A connection to a [`MemoryBroker`].
#[derive(Clone, Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    engine: DebugIgnore<Option<Arc<dyn RemoteEngine>>>,
    event_interval: Duration,
    closed: Arc<watch::Sender<bool>>,
    close_count: Arc<AtomicUsize>,
}

impl MemoryChannel {
    fn new(broker: MemoryBroker, engine: Option<Arc<dyn RemoteEngine>>) -> Self {
        Self {
            broker,
            engine: DebugIgnore(engine),
            event_interval: Duration::ZERO,
            closed: Arc::new(watch::Sender::new(false)),
            close_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets a delay between publishing consecutive events, simulating a run in progress.
    pub fn with_event_interval(mut self, event_interval: Duration) -> Self {
        self.event_interval = event_interval;
        self
    }

    /// Returns the broker this connection belongs to.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Returns true if [`close`](EventChannel::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Returns the number of times [`close`](EventChannel::close) has been called.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }

    fn run_engine(&self, request: &EngineRequest<'_>) -> (Vec<RunEvent>, Result<(), EngineError>) {
        let Some(engine) = self.engine.as_ref() else {
            return (Vec::new(), Err(EngineError::new("no engine attached")));
        };

        let mut events = Vec::new();
        let res = engine.execute(request, &mut |kind| {
            events.push(RunEvent::new(request.reporter_id.clone(), kind));
        });
        (events, res)
    }

    async fn execute(
        &self,
        request: EngineRequest<'_>,
        coverage_id: Option<&ReporterId>,
    ) -> Result<(), ChannelError> {
        let ready = self.check_open().and_then(|()| match *self.engine {
            Some(_) => Ok(()),
            None => Err(ChannelError::NoEngine),
        });
        if let Err(err) = ready {
            // The run never started, so the stream will never end on its own.
            self.broker.abort(request.reporter_id);
            return Err(err);
        }

        let (events, res) = self.run_engine(&request);
        debug!(
            reporter_id = %request.reporter_id,
            count = events.len(),
            "engine produced events"
        );

        for (index, event) in events.iter().enumerate() {
            if index > 0 && !self.event_interval.is_zero() {
                tokio::time::sleep(self.event_interval).await;
            }
            if self.is_closed() {
                // The run was aborted by closing this connection.
                self.broker.abort(request.reporter_id);
                return Err(ChannelError::Closed);
            }
            self.broker.publish(event)?;
        }

        if let Some(coverage_id) = coverage_id
            && let Some(engine) = self.engine.as_ref()
            && let Some(html) = engine.coverage_report(&request)
        {
            self.broker.store_coverage_report(coverage_id, html);
        }

        self.broker.end_of_stream(request.reporter_id);
        res.map_err(ChannelError::Engine)
    }
}

impl EventChannel for MemoryChannel {
    async fn trigger(
        &self,
        reporter_id: &ReporterId,
        request: &RunRequest,
        options: &TriggerOptions,
    ) -> Result<(), ChannelError> {
        let engine_request = EngineRequest {
            reporter_id,
            request,
            options,
            coverage: None,
        };
        self.execute(engine_request, None).await
    }

    async fn trigger_with_coverage(
        &self,
        reporter_id: &ReporterId,
        coverage_id: &ReporterId,
        request: &RunRequest,
        options: &TriggerOptions,
        coverage: &CoverageOptions,
    ) -> Result<(), ChannelError> {
        let engine_request = EngineRequest {
            reporter_id,
            request,
            options,
            coverage: Some(coverage),
        };
        self.execute(engine_request, Some(coverage_id)).await
    }

    async fn receive<F>(
        &self,
        reporter_id: &ReporterId,
        timeout: Option<Duration>,
        mut consumer: F,
    ) -> Result<(), ChannelError>
    where
        F: FnMut(RunEvent) -> ControlFlow<()> + Send,
    {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(ChannelError::Closed);
        }
        let Some(mut rx) = self.broker.take_receiver(reporter_id) else {
            // Another connection is already receiving this stream.
            return Err(ChannelError::Closed);
        };
        let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));

        loop {
            let message = tokio::select! {
                message = rx.recv() => message,
                _ = closed_rx.changed() => return Err(ChannelError::Closed),
                () = sleep_until(deadline.map(|(at, _)| at)) => {
                    let timeout = deadline.map_or(Duration::ZERO, |(_, timeout)| timeout);
                    return Err(ChannelError::Timeout {
                        reporter_id: reporter_id.clone(),
                        timeout,
                    });
                }
            };

            match message {
                Some(Message::Line(line)) => {
                    let event = RunEvent::from_json_line(&line).map_err(ChannelError::Decode)?;
                    if event.reporter_id != *reporter_id {
                        debug!(
                            reporter_id = %reporter_id,
                            other = %event.reporter_id,
                            "ignoring event for another run"
                        );
                        continue;
                    }
                    if consumer(event).is_break() {
                        return Ok(());
                    }
                }
                Some(Message::EndOfStream) | None => return Ok(()),
                Some(Message::Abort) => {
                    return Err(ChannelError::Aborted {
                        reporter_id: reporter_id.clone(),
                    });
                }
            }
        }
    }

    async fn fetch_coverage_report(&self, coverage_id: &ReporterId) -> Result<String, ChannelError> {
        self.check_open()?;
        self.broker
            .take_coverage_report(coverage_id)
            .ok_or_else(|| ChannelError::CoverageUnavailable {
                coverage_id: coverage_id.clone(),
            })
    }

    fn close(&self) -> Result<(), ChannelError> {
        self.close_count.fetch_add(1, Ordering::AcqRel);
        self.closed.send_replace(true);
        Ok(())
    }
}

impl DebugHost for MemoryChannel {
    fn debug(
        &self,
        reporter_id: &ReporterId,
        request: &RunRequest,
        options: &TriggerOptions,
    ) -> Result<(), ChannelError> {
        self.check_open()?;
        if self.engine.is_none() {
            return Err(ChannelError::NoEngine);
        }

        let (events, res) = self.run_engine(&EngineRequest {
            reporter_id,
            request,
            options,
            coverage: None,
        });
        for event in &events {
            self.broker.publish(event)?;
        }
        self.broker.end_of_stream(reporter_id);
        res.map_err(ChannelError::Engine)
    }
}

/// Sleeps until `deadline`, or forever if there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A [`RemoteEngine`] that replays a fixed list of events.
#[derive(Clone, Debug, Default)]
pub struct ScriptedEngine {
    events: Vec<RunEventKind>,
    failure: Option<EngineError>,
    coverage_report: Option<String>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedEngine {
    /// Creates an engine that emits `events` for every run.
    pub fn new(events: impl IntoIterator<Item = RunEventKind>) -> Self {
        Self {
            events: events.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Makes every run fail with `message` after emitting its events.
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(EngineError::new(message));
        self
    }

    /// Sets the coverage report served for runs executed with coverage.
    pub fn with_coverage_report(mut self, html: impl Into<String>) -> Self {
        self.coverage_report = Some(html.into());
        self
    }

    /// Returns the requests this engine has executed so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RemoteEngine for ScriptedEngine {
    fn execute(
        &self,
        request: &EngineRequest<'_>,
        emit: &mut dyn FnMut(RunEventKind),
    ) -> Result<(), EngineError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                reporter_id: request.reporter_id.clone(),
                path_list: request.request.path_list.clone(),
                options: request.options.clone(),
                coverage: request.coverage.cloned(),
            });

        for event in &self.events {
            emit(event.clone());
        }

        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn coverage_report(&self, request: &EngineRequest<'_>) -> Option<String> {
        request.coverage.and(self.coverage_report.clone())
    }
}

/// A request recorded by a [`ScriptedEngine`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedRequest {
    /// The correlation id events were tagged with.
    pub reporter_id: ReporterId,

    /// The targets that were asked to run.
    pub path_list: Vec<String>,

    /// The options for the run.
    pub options: TriggerOptions,

    /// Coverage options, if coverage was requested.
    pub coverage: Option<CoverageOptions>,
}
