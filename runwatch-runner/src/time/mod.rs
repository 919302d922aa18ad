// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod stopwatch;

pub(crate) use stopwatch::*;

use chrono::{DateTime, FixedOffset, Local, SubsecRound};

/// Returns the current local time, truncated to millisecond precision.
pub(crate) fn now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset().trunc_subsecs(3)
}
