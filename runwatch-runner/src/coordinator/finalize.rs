// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::imp::{Activity, ActivityStatus};
use crate::{channel::EventChannel, observer::RunObserver, run_state::RunHandle};
use runwatch_metadata::ReporterId;
use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tracing::{debug, error, warn};

/// Tears down a run once both of its activities have ended.
///
/// Each activity holds an [`ActivityGuard`]. The guard is dropped when the activity ends, whether
/// it returns, panics or is cancelled, and the last guard to drop runs the finalize step.
pub(super) struct Finalizer<'a, C> {
    remaining: AtomicUsize,
    finalized: AtomicBool,
    statuses: Mutex<[Option<ActivityStatus>; 2]>,
    cx: FinalizeContext<'a, C>,
}

pub(super) struct FinalizeContext<'a, C> {
    pub(super) reporter_id: &'a ReporterId,
    pub(super) producer: &'a C,
    pub(super) consumer: &'a C,
    pub(super) observer: &'a dyn RunObserver,
    pub(super) run: &'a RunHandle,
    pub(super) managed_connections: bool,
}

impl<'a, C: EventChannel> Finalizer<'a, C> {
    pub(super) fn new(cx: FinalizeContext<'a, C>) -> Self {
        Self {
            remaining: AtomicUsize::new(2),
            finalized: AtomicBool::new(false),
            statuses: Mutex::new([None, None]),
            cx,
        }
    }

    pub(super) fn guard(&self, activity: Activity) -> ActivityGuard<'_, 'a, C> {
        ActivityGuard {
            finalizer: self,
            activity,
            status: None,
        }
    }

    /// Returns the status each activity ended with. Activities that never ended are reported as
    /// panicked.
    pub(super) fn status(&self, activity: Activity) -> ActivityStatus {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)[activity.index()]
            .clone()
            .unwrap_or(ActivityStatus::Panicked)
    }

    /// Returns true if the finalize step ran.
    pub(super) fn finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    fn activity_ended(&self, activity: Activity, status: ActivityStatus) {
        debug!(
            reporter_id = %self.cx.reporter_id,
            %activity,
            ?status,
            "activity ended"
        );
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)[activity.index()] =
            Some(status);

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        let cx = &self.cx;
        self.end_unfinished_run();
        if cx.managed_connections {
            debug!(
                reporter_id = %cx.reporter_id,
                "connections are managed externally, skipping finalize"
            );
            return;
        }

        debug!(reporter_id = %cx.reporter_id, "finalizing run");
        for (activity, channel) in [
            (Activity::Produce, cx.producer),
            (Activity::Consume, cx.consumer),
        ] {
            if let Err(err) = channel.close() {
                warn!(
                    reporter_id = %cx.reporter_id,
                    %activity,
                    "failed to close connection: {err}"
                );
            }
        }
        cx.observer.dispose();
        cx.run.write().detach();
        self.finalized.store(true, Ordering::Release);
    }

    /// Ends the run if the consume activity stopped before it could, so observers always see a
    /// terminal run.
    fn end_unfinished_run(&self) {
        let mut run = self.cx.run.write();
        if run.is_terminal() {
            return;
        }
        run.end_early(Some(format!(
            "{} activity ended before the run finished",
            Activity::Consume
        )));
        warn!(
            reporter_id = %self.cx.reporter_id,
            status = %run.status(),
            "run was left unfinished, ended it"
        );
    }
}

/// Marks one activity as running. See [`Finalizer`].
pub(super) struct ActivityGuard<'f, 'a, C: EventChannel> {
    finalizer: &'f Finalizer<'a, C>,
    activity: Activity,
    status: Option<ActivityStatus>,
}

impl<C: EventChannel> ActivityGuard<'_, '_, C> {
    /// Records that the activity ended normally with `status`.
    pub(super) fn complete(mut self, status: ActivityStatus) {
        self.status = Some(status);
    }
}

impl<C: EventChannel> Drop for ActivityGuard<'_, '_, C> {
    fn drop(&mut self) {
        let status = self.status.take().unwrap_or_else(|| {
            error!(
                reporter_id = %self.finalizer.cx.reporter_id,
                activity = %self.activity,
                "activity panicked or was cancelled"
            );
            ActivityStatus::Panicked
        });
        self.finalizer.activity_ended(self.activity, status);
    }
}
