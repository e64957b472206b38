//! Shared fixtures for pipeline integration tests
//!
//! Everything runs in process: a [`MemoryCatalog`] instead of Postgres, a
//! temporary directory for staging and artifacts, and wiremock servers for
//! sources and webhook receivers.

#![allow(dead_code)]

use odm_pipeline::catalog::MemoryCatalog;
use odm_pipeline::config::NotifyConfig;
use odm_pipeline::load::Destination;
use odm_pipeline::models::Resource;
use odm_pipeline::notify::NotificationDispatcher;
use odm_pipeline::{FetcherRegistry, Pipeline};
use std::sync::Arc;
use tempfile::TempDir;

pub const PUBLIC_BASE_URL: &str = "https://odm.example.org";

/// Catalog, pipeline and the directory holding their files
pub struct TestEnv {
    pub catalog: Arc<MemoryCatalog>,
    pub pipeline: Pipeline,
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_destination(destination: Arc<dyn Destination>) -> Self {
        Self::build(Some(destination))
    }

    fn build(destination: Option<Arc<dyn Destination>>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let catalog = Arc::new(MemoryCatalog::new());
        let notify = NotifyConfig {
            public_base_url: PUBLIC_BASE_URL.to_string(),
            timeout_secs: 5,
        };
        let dispatcher = NotificationDispatcher::new(&notify).expect("Failed to build dispatcher");

        let mut pipeline = Pipeline::new(
            catalog.clone(),
            Arc::new(FetcherRegistry::with_builtin()),
            dispatcher,
            dir.path().join("staging"),
            dir.path().join("artifacts"),
        );
        if let Some(destination) = destination {
            pipeline = pipeline.with_destination(destination);
        }

        Self {
            catalog,
            pipeline,
            dir,
        }
    }

    /// Store `resource` and hand it back
    pub async fn add(&self, resource: Resource) -> Resource {
        self.catalog
            .insert_resource(resource.clone())
            .await
            .expect("Failed to insert resource");
        resource
    }
}

/// REST resource reading `{server}/{path}`
pub fn rest_resource(name: &str, url: String) -> Resource {
    Resource::new(name, "integration", "REST").with_param("url", url)
}
