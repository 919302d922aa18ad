// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ReporterIdParseError;
use newtype_uuid::{GenericUuid, TypedUuid, TypedUuidKind, TypedUuidTag};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, str::FromStr};

/// The correlation id binding a channel's events to a single run.
///
/// A reporter id is a 32-character lowercase hex string: a v4 UUID with the hyphens stripped. One
/// is generated per run, and another one for an optional coverage report.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReporterId(SmolStr);

impl ReporterId {
    /// The length of a reporter id, in characters.
    pub const LEN: usize = 32;

    /// Generates a new, random reporter id.
    pub fn new_random() -> Self {
        let uuid = TypedUuid::<ReporterKind>::new_v4().into_untyped_uuid();
        Self(SmolStr::new(uuid.simple().to_string()))
    }

    /// Returns the reporter id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReporterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ReporterId {
    type Err = ReporterIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == Self::LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(SmolStr::new(s)))
        } else {
            Err(ReporterIdParseError::new(s))
        }
    }
}

impl TryFrom<String> for ReporterId {
    type Error = ReporterIdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ReporterId> for String {
    fn from(id: ReporterId) -> Self {
        id.0.into()
    }
}

/// The kind tag for reporter UUIDs.
pub enum ReporterKind {}

impl TypedUuidKind for ReporterKind {
    #[inline]
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("reporter");
        TAG
    }
}
