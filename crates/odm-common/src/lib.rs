//! ODM Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared infrastructure for the OpenDataManager workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Checksums**: streaming SHA-256 used to seal artifact bundles
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use odm_common::checksum::compute_file_checksum;
//!
//! fn seal(path: &str) -> odm_common::Result<()> {
//!     let checksum = compute_file_checksum(path)?;
//!     tracing::info!(%checksum, "sealed");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
