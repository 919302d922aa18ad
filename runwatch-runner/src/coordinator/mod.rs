// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Schedules the produce and consume activities of a run.
//!
//! The main structure in this module is [`RunCoordinator`].

mod finalize;
mod imp;

pub use imp::*;
