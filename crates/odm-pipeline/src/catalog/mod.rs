//! Persistence of resources, executions, artifacts and subscriptions
//!
//! The orchestrator only talks to [`Catalog`]. [`PgCatalog`] is the Postgres
//! implementation; [`MemoryCatalog`] keeps everything in process for tests and
//! dry runs.

pub mod memory;
pub mod postgres;

pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::fetchers::FetcherDescriptor;
use crate::models::{Artifact, Execution, NotificationRecord, Resource, Subscriber};
use crate::versioning::SemanticVersion;

/// Subscription bookkeeping after a successful delivery
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate {
    pub subscription_id: Uuid,
    pub current_version: SemanticVersion,
    pub notified_at: DateTime<Utc>,
}

/// Everything a successful run commits at once
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub execution_id: Uuid,
    pub completed_at: DateTime<Utc>,
    pub total_records: i64,
    pub staging_path: String,
    pub artifact: Artifact,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn resource(&self, id: Uuid) -> Result<Option<Resource>>;

    /// Active resources by descending priority, then name
    async fn active_resources(&self) -> Result<Vec<Resource>>;

    /// Insert or update a descriptor by code
    async fn upsert_fetcher(&self, descriptor: &FetcherDescriptor) -> Result<()>;

    async fn fetchers(&self) -> Result<Vec<FetcherDescriptor>>;

    /// Persist a new running execution
    async fn create_execution(&self, execution: &Execution) -> Result<()>;

    async fn execution(&self, id: Uuid) -> Result<Option<Execution>>;

    /// Mark an execution failed
    async fn fail_execution(&self, id: Uuid, error_message: &str) -> Result<()>;

    /// Record the LOAD outcome, committed on its own
    async fn record_load(
        &self,
        id: Uuid,
        records_loaded: Option<i64>,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Highest version artifact of a resource
    async fn latest_artifact(&self, resource_id: Uuid) -> Result<Option<Artifact>>;

    async fn artifact_by_version(
        &self,
        resource_id: Uuid,
        version: &SemanticVersion,
    ) -> Result<Option<Artifact>>;

    /// Subscriptions on a resource joined with their active applications
    async fn subscribers(&self, resource_id: Uuid) -> Result<Vec<Subscriber>>;

    /// Commit the artifact and the completed execution in one transaction
    async fn complete_run(&self, completion: &RunCompletion) -> Result<()>;

    /// Record webhook deliveries for a committed artifact, in one transaction
    async fn record_deliveries(
        &self,
        notifications: &[NotificationRecord],
        updates: &[SubscriptionUpdate],
    ) -> Result<()>;
}
