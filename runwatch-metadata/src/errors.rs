// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{error, fmt};

/// An error that occurs while parsing a [`ReporterId`](crate::ReporterId).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReporterIdParseError {
    input: String,
}

impl ReporterIdParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }

    /// Returns the input that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

impl fmt::Display for ReporterIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "invalid reporter id `{}`: expected 32 lowercase hex characters",
            self.input
        )
    }
}

impl error::Error for ReporterIdParseError {}

/// An error that occurs while decoding a [`RunEvent`](crate::RunEvent) from a line of JSON.
///
/// An unknown `event` tag also results in this error: it indicates a protocol mismatch between
/// the remote engine and this reader, and must not be skipped over.
#[derive(Debug)]
pub struct EventDecodeError {
    line: String,
    err: serde_json::Error,
}

impl EventDecodeError {
    pub(crate) fn new(line: impl Into<String>, err: serde_json::Error) -> Self {
        Self {
            line: line.into(),
            err,
        }
    }

    /// Returns the line that failed to decode.
    pub fn line(&self) -> &str {
        &self.line
    }
}

impl fmt::Display for EventDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "failed to decode run event from `{}`", self.line)
    }
}

impl error::Error for EventDecodeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.err)
    }
}

/// An error that occurs while encoding a [`RunEvent`](crate::RunEvent) as JSON.
#[derive(Debug)]
pub struct EventEncodeError {
    err: serde_json::Error,
}

impl EventEncodeError {
    pub(crate) fn new(err: serde_json::Error) -> Self {
        Self { err }
    }
}

impl fmt::Display for EventEncodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "failed to encode run event as JSON")
    }
}

impl error::Error for EventEncodeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.err)
    }
}
