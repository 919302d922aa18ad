// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stopwatch for tracking how long a run takes.
//!
//! A run needs both a start time and a duration. For that we use a combination of a realtime
//! clock (`Local::now()`) and a monotonic clock (`Instant`). The duration is always measured with
//! the monotonic clock, so it isn't affected by changes to the system time.

use chrono::{DateTime, FixedOffset, Local, SubsecRound};
use std::time::{Duration, Instant};

pub(crate) fn stopwatch() -> StopwatchStart {
    StopwatchStart::new()
}

/// The start state of a stopwatch.
#[derive(Clone, Debug)]
pub(crate) struct StopwatchStart {
    start_time: DateTime<FixedOffset>,
    instant: Instant,
}

impl StopwatchStart {
    fn new() -> Self {
        Self {
            // These two syscalls will happen imperceptibly close to each other, which is good
            // enough for our purposes.
            start_time: Local::now().fixed_offset().trunc_subsecs(3),
            instant: Instant::now(),
        }
    }

    pub(crate) fn start_time(&self) -> DateTime<FixedOffset> {
        self.start_time
    }

    pub(crate) fn snapshot(&self) -> StopwatchSnapshot {
        StopwatchSnapshot {
            start_time: self.start_time,
            duration: self.instant.elapsed(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StopwatchSnapshot {
    pub(crate) start_time: DateTime<FixedOffset>,
    pub(crate) duration: Duration,
}

impl StopwatchSnapshot {
    pub(crate) fn end_time(&self) -> DateTime<FixedOffset> {
        (self.start_time + self.duration).trunc_subsecs(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_measures_elapsed_time() {
        let start = stopwatch();
        std::thread::sleep(Duration::from_millis(50));
        let snapshot = start.snapshot();

        assert!(
            snapshot.duration >= Duration::from_millis(50),
            "duration ({:?}) is at least the time slept",
            snapshot.duration
        );
        assert!(
            snapshot.end_time() >= start.start_time(),
            "end time is not before start time"
        );
        assert_eq!(snapshot.start_time, start.start_time());
    }
}
