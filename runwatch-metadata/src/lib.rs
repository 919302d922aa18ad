// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable event model for runwatch.
//!
//! A remote test engine reports the progress of a run as a stream of [`RunEvent`]s, all tagged
//! with the run's [`ReporterId`]. On the wire, each event is a single line of JSON; see
//! [`RunEvent::from_json_line`] and [`RunEvent::to_json_line`].

mod counter;
mod errors;
mod events;
mod reporter_id;

pub use counter::*;
pub use errors::*;
pub use events::*;
pub use reporter_id::*;
