//! Versioned artifact bundles
//!
//! A bundle directory holds:
//!
//! - `data.jsonl`: copy of the staged records
//! - `schema.json`: the inferred schema, pretty-printed
//! - `models.rs`: generated `serde` bindings
//! - `metadata.json`: ids, version, record count and checksum

pub mod bindings;
pub mod builder;

pub use builder::{verify_bundle, ArtifactMetadata, BuiltPackage, PackageBuilder};

pub const DATA_FILE: &str = "data.jsonl";
pub const SCHEMA_FILE: &str = "schema.json";
pub const MODELS_FILE: &str = "models.rs";
pub const METADATA_FILE: &str = "metadata.json";
