//! In-process catalog

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Catalog, RunCompletion, SubscriptionUpdate};
use crate::error::{PipelineError, Result};
use crate::fetchers::FetcherDescriptor;
use crate::models::{
    Application, Artifact, Execution, ExecutionStatus, NotificationRecord, Resource, Subscriber,
    Subscription,
};
use crate::versioning::SemanticVersion;

#[derive(Default)]
struct State {
    resources: HashMap<Uuid, Resource>,
    fetchers: BTreeMap<String, FetcherDescriptor>,
    executions: HashMap<Uuid, Execution>,
    artifacts: Vec<Artifact>,
    applications: HashMap<Uuid, Application>,
    subscriptions: Vec<Subscription>,
    notifications: Vec<NotificationRecord>,
}

/// Catalog held in memory, mirroring the Postgres constraints
#[derive(Default)]
pub struct MemoryCatalog {
    state: RwLock<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a resource; names stay unique
    pub async fn insert_resource(&self, resource: Resource) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .resources
            .values()
            .any(|r| r.name == resource.name && r.id != resource.id)
        {
            return Err(PipelineError::catalog(format!(
                "resource name '{}' already exists",
                resource.name
            )));
        }
        state.resources.insert(resource.id, resource);
        Ok(())
    }

    pub async fn insert_application(&self, application: Application) {
        self.state.write().await.applications.insert(application.id, application);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state.write().await.subscriptions.push(subscription);
    }

    /// Seed an artifact, as if produced by an earlier run
    pub async fn insert_artifact(&self, artifact: Artifact) -> Result<()> {
        let mut state = self.state.write().await;
        insert_unique_artifact(&mut state, artifact)
    }

    /// Artifacts of a resource in creation order
    pub async fn artifacts(&self, resource_id: Uuid) -> Vec<Artifact> {
        self.state
            .read()
            .await
            .artifacts
            .iter()
            .filter(|a| a.resource_id == resource_id)
            .cloned()
            .collect()
    }

    pub async fn executions(&self, resource_id: Uuid) -> Vec<Execution> {
        let state = self.state.read().await;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| e.resource_id == resource_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.started_at);
        executions
    }

    pub async fn notifications(&self) -> Vec<NotificationRecord> {
        self.state.read().await.notifications.clone()
    }

    pub async fn subscription(&self, id: Uuid) -> Option<Subscription> {
        self.state
            .read()
            .await
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }
}

fn insert_unique_artifact(state: &mut State, artifact: Artifact) -> Result<()> {
    if state
        .artifacts
        .iter()
        .any(|a| a.resource_id == artifact.resource_id && a.version == artifact.version)
    {
        return Err(PipelineError::catalog(format!(
            "artifact version {} already exists for resource {}",
            artifact.version, artifact.resource_id
        )));
    }
    state.artifacts.push(artifact);
    Ok(())
}

fn running_execution(state: &mut State, id: Uuid) -> Result<&mut Execution> {
    match state.executions.get_mut(&id) {
        Some(e) if e.status == ExecutionStatus::Running => Ok(e),
        Some(_) => Err(PipelineError::catalog(format!("execution {} is already terminal", id))),
        None => Err(PipelineError::catalog(format!("execution {} not found", id))),
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn resource(&self, id: Uuid) -> Result<Option<Resource>> {
        Ok(self.state.read().await.resources.get(&id).cloned())
    }

    async fn active_resources(&self) -> Result<Vec<Resource>> {
        let state = self.state.read().await;
        let mut resources: Vec<Resource> =
            state.resources.values().filter(|r| r.active).cloned().collect();
        resources.sort_by(|a, b| {
            b.execution_priority
                .cmp(&a.execution_priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(resources)
    }

    async fn upsert_fetcher(&self, descriptor: &FetcherDescriptor) -> Result<()> {
        self.state
            .write()
            .await
            .fetchers
            .insert(descriptor.code.clone(), descriptor.clone());
        Ok(())
    }

    async fn fetchers(&self) -> Result<Vec<FetcherDescriptor>> {
        Ok(self.state.read().await.fetchers.values().cloned().collect())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.resources.contains_key(&execution.resource_id) {
            return Err(PipelineError::ResourceNotFound(execution.resource_id));
        }
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn execution(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.state.read().await.executions.get(&id).cloned())
    }

    async fn fail_execution(&self, id: Uuid, error_message: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let execution = running_execution(&mut state, id)?;
        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(Utc::now());
        execution.error_message = Some(error_message.to_string());
        Ok(())
    }

    async fn record_load(
        &self,
        id: Uuid,
        records_loaded: Option<i64>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let execution = running_execution(&mut state, id)?;
        execution.records_loaded = records_loaded;
        if let Some(message) = error_message {
            execution.error_message = Some(message.to_string());
        }
        Ok(())
    }

    async fn latest_artifact(&self, resource_id: Uuid) -> Result<Option<Artifact>> {
        Ok(self
            .state
            .read()
            .await
            .artifacts
            .iter()
            .filter(|a| a.resource_id == resource_id)
            .max_by_key(|a| a.version)
            .cloned())
    }

    async fn artifact_by_version(
        &self,
        resource_id: Uuid,
        version: &SemanticVersion,
    ) -> Result<Option<Artifact>> {
        Ok(self
            .state
            .read()
            .await
            .artifacts
            .iter()
            .find(|a| a.resource_id == resource_id && a.version == *version)
            .cloned())
    }

    async fn subscribers(&self, resource_id: Uuid) -> Result<Vec<Subscriber>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.resource_id == resource_id)
            .filter_map(|s| {
                state
                    .applications
                    .get(&s.application_id)
                    .filter(|app| app.active)
                    .map(|app| Subscriber {
                        subscription: s.clone(),
                        application: app.clone(),
                    })
            })
            .collect())
    }

    async fn complete_run(&self, completion: &RunCompletion) -> Result<()> {
        let mut state = self.state.write().await;

        // checks run before any mutation
        running_execution(&mut state, completion.execution_id)?;
        insert_unique_artifact(&mut state, completion.artifact.clone())?;

        let execution = running_execution(&mut state, completion.execution_id)?;
        execution.status = ExecutionStatus::Completed;
        execution.completed_at = Some(completion.completed_at);
        execution.total_records = Some(completion.total_records);
        execution.staging_path = Some(completion.staging_path.clone());
        Ok(())
    }

    async fn record_deliveries(
        &self,
        notifications: &[NotificationRecord],
        updates: &[SubscriptionUpdate],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.notifications.extend(notifications.iter().cloned());
        for update in updates {
            if let Some(sub) = state
                .subscriptions
                .iter_mut()
                .find(|s| s.id == update.subscription_id)
            {
                sub.current_version = Some(update.current_version);
                sub.notified_at = Some(update.notified_at);
            }
        }
        Ok(())
    }
}
