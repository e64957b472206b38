//! ODM pipeline
//!
//! Configurable data acquisition: resources name a fetcher type and its
//! parameters; each run extracts, stages, versions and packages the data,
//! optionally loads it into a destination table and notifies subscribers.
//!
//! # Modules
//!
//! - [`fetchers`] and [`registry`]: source types and dispatch by type code
//! - [`schema`] and [`versioning`]: schema inference and semantic versions
//! - [`staging`] and [`package`]: JSONL staging files and artifact bundles
//! - [`load`]: destination tables
//! - [`notify`]: signed webhooks
//! - [`catalog`]: persistence
//! - [`orchestrator`]: the run loop tying it all together

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetchers;
pub mod load;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod package;
pub mod registry;
pub mod schema;
pub mod staging;
pub mod versioning;

pub use cli::{Cli, Commands};
pub use error::{PipelineError, Result};
pub use orchestrator::{Pipeline, RunOutcome, RunReport, RunSummary};
pub use registry::FetcherRegistry;
