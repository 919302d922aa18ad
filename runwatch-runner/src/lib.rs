// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Live progress reporting for test runs executed by a remote engine.
//!
//! A run is driven by a [`RunCoordinator`](coordinator::RunCoordinator). It schedules two
//! activities on a Tokio runtime: one listens for events on an [`EventChannel`](channel::EventChannel)
//! and folds them into a [`Run`](run_state::Run), the other asks the engine to start the run. A
//! [`RunObserver`](observer::RunObserver) is notified after every change.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod logging;
pub mod observer;
pub mod processor;
pub mod run_state;
mod time;
