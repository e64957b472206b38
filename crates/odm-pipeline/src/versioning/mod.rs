//! Artifact versioning
//!
//! - [`diff`]: structural delta between two schemas
//! - [`calculator`]: semantic version bumps derived from that delta

pub mod calculator;
pub mod diff;

pub use calculator::{decide_version, next_version, BumpType, SemanticVersion, VersionDecision};
pub use diff::{diff, SchemaDiff, TypeChange};
