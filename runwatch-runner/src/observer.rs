// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The interface to whatever displays a run.

use crate::run_state::RunHandle;
use runwatch_metadata::ReporterId;

/// Something that displays the state of a run, typically a GUI panel.
///
/// Notifications carry no data: on [`update`](Self::update), the observer should re-read the run
/// through the handle it was given in [`set_model`](Self::set_model).
///
/// All methods may be called from the coordinator's worker threads, so implementations must not
/// block for long.
pub trait RunObserver: Send + Sync {
    /// Provides the run to display. Called once, before any events are processed.
    fn set_model(&self, run: RunHandle);

    /// Called after every change to the run.
    fn update(&self, reporter_id: &ReporterId);

    /// Called with the HTML coverage report, if coverage was requested and the run completed.
    fn show_coverage(&self, reporter_id: &ReporterId, html: &str) {
        let _ = (reporter_id, html);
    }

    /// Called once when the run is finalized, to release any resources the observer owns.
    fn dispose(&self) {}
}
