//! Version number calculation
//!
//! Artifacts carry a three-part version. The first artifact of a resource is
//! `1.0.0`; every later one bumps the prior version according to the schema
//! diff between the two.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::diff::{diff, SchemaDiff};
use crate::error::{PipelineError, Result};
use crate::schema::SchemaDescriptor;

/// Kind of change between two consecutive artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpType {
    /// A field was removed or changed type
    Major,
    /// Fields were only added
    Minor,
    /// Data changed, schema did not
    Patch,
}

impl BumpType {
    pub fn as_str(self) -> &'static str {
        match self {
            BumpType::Major => "major",
            BumpType::Minor => "minor",
            BumpType::Patch => "patch",
        }
    }

    pub fn from_diff(diff: &SchemaDiff) -> Self {
        if diff.breaking {
            BumpType::Major
        } else if !diff.added_fields.is_empty() {
            BumpType::Minor
        } else {
            BumpType::Patch
        }
    }
}

impl fmt::Display for BumpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed semantic version components
///
/// Ordering is lexicographic over (major, minor, patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SemanticVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemanticVersion {
    pub const INITIAL: SemanticVersion = SemanticVersion::new(1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a strict `major.minor.patch` string
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = version.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }

    /// Apply a bump to get the next version
    pub fn bump(&self, bump_type: BumpType) -> Result<Self> {
        let overflow = || {
            PipelineError::Version(format!("cannot apply a {} bump to {}", bump_type, self))
        };
        Ok(match bump_type {
            BumpType::Major => Self::new(self.major.checked_add(1).ok_or_else(overflow)?, 0, 0),
            BumpType::Minor => {
                Self::new(self.major, self.minor.checked_add(1).ok_or_else(overflow)?, 0)
            },
            BumpType::Patch => {
                Self::new(self.major, self.minor, self.patch.checked_add(1).ok_or_else(overflow)?)
            },
        })
    }

    /// Bump kind implied by the shape of the version alone
    ///
    /// `x.0.0` reads as major, `x.y.0` as minor, anything else as patch.
    pub fn implied_bump(&self) -> BumpType {
        match (self.minor, self.patch) {
            (0, 0) => BumpType::Major,
            (_, 0) => BumpType::Minor,
            _ => BumpType::Patch,
        }
    }
}

impl Default for SemanticVersion {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemanticVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid version '{}', expected major.minor.patch", s))
    }
}

impl From<SemanticVersion> for String {
    fn from(version: SemanticVersion) -> Self {
        version.to_string()
    }
}

impl TryFrom<String> for SemanticVersion {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Outcome of comparing a new schema against the latest artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDecision {
    pub version: SemanticVersion,
    pub bump: BumpType,
    /// Diff against the prior schema, absent for the first artifact
    pub diff: Option<SchemaDiff>,
}

/// Decide the next version for `new_schema`
///
/// `prior` is the latest existing artifact's version and schema, if any.
pub fn decide_version(
    prior: Option<(&SemanticVersion, &SchemaDescriptor)>,
    new_schema: &SchemaDescriptor,
) -> Result<VersionDecision> {
    match prior {
        None => Ok(VersionDecision {
            version: SemanticVersion::INITIAL,
            bump: BumpType::Major,
            diff: None,
        }),
        Some((version, old_schema)) => {
            let schema_diff = diff(old_schema, new_schema);
            let bump = BumpType::from_diff(&schema_diff);
            Ok(VersionDecision {
                version: version.bump(bump)?,
                bump,
                diff: Some(schema_diff),
            })
        },
    }
}

/// Next version for `new_schema` given the prior artifact, if any
pub fn next_version(
    prior: Option<(&SemanticVersion, &SchemaDescriptor)>,
    new_schema: &SchemaDescriptor,
) -> Result<SemanticVersion> {
    Ok(decide_version(prior, new_schema)?.version)
}
