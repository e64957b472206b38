//! Pipeline orchestrator
//!
//! One run of a resource goes through:
//!
//! 1. EXTRACT: build the fetcher from the registry and run it
//! 2. STAGE: write the records as JSONL under the execution id
//! 3. PACKAGE: infer the schema, pick the next version, write the bundle
//! 4. LOAD: optional, write records into the destination table
//! 5. NOTIFY: deliver signed webhooks to subscribers
//!
//! Failures in the first three phases fail the execution and are returned.
//! LOAD and NOTIFY failures are recorded and the run still completes.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, field, info, instrument, warn, Span};
use uuid::Uuid;

use crate::catalog::{Catalog, RunCompletion, SubscriptionUpdate};
use crate::error::{PipelineError, Result};
use crate::fetchers::{run_pipeline, DomainData};
use crate::load::{Destination, LoadRequest};
use crate::models::{Artifact, Execution, Resource};
use crate::notify::{Delivery, NotificationDispatcher};
use crate::package::PackageBuilder;
use crate::registry::FetcherRegistry;
use crate::staging::{self, Record};
use crate::versioning::BumpType;

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub resource_id: Uuid,
    pub execution_id: Uuid,
    pub artifact: Artifact,
    pub bump: BumpType,
    pub total_records: usize,
    pub staging_path: PathBuf,
    /// `None` when loading is disabled or failed
    pub records_loaded: Option<u64>,
    pub load_error: Option<String>,
    pub deliveries: Vec<Delivery>,
}

#[derive(Debug, Clone)]
pub enum RunReport {
    /// Resource inactive, no execution created
    Skipped { resource_id: Uuid },
    Completed(Box<RunOutcome>),
}

/// A resource whose run failed inside `run_all`
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub resource_id: Uuid,
    pub resource_name: String,
    pub kind: &'static str,
    pub message: String,
}

/// Aggregate of one `run_all` pass
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<RunReport>,
    pub failures: Vec<RunFailure>,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r, RunReport::Completed(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r, RunReport::Skipped { .. }))
            .count()
    }

    fn record(&mut self, resource: &Resource, result: Result<RunReport>) {
        match result {
            Ok(report) => self.reports.push(report),
            Err(e) => {
                error!(
                    resource_id = %resource.id,
                    resource = %resource.name,
                    kind = e.kind(),
                    error = %e,
                    "Resource run failed"
                );
                self.failures.push(RunFailure {
                    resource_id: resource.id,
                    resource_name: resource.name.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            },
        }
    }
}

/// Removes the resource from the in-flight set when dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    resource_id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.resource_id);
    }
}

pub struct Pipeline {
    catalog: Arc<dyn Catalog>,
    registry: Arc<FetcherRegistry>,
    destination: Option<Arc<dyn Destination>>,
    dispatcher: NotificationDispatcher,
    packager: PackageBuilder,
    staging_dir: PathBuf,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        registry: Arc<FetcherRegistry>,
        dispatcher: NotificationDispatcher,
        staging_dir: impl Into<PathBuf>,
        artifacts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            registry,
            destination: None,
            dispatcher,
            packager: PackageBuilder::new(artifacts_dir),
            staging_dir: staging_dir.into(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Enable the LOAD phase for resources with `enable_load`
    pub fn with_destination(mut self, destination: Arc<dyn Destination>) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    fn acquire(&self, resource_id: Uuid) -> Result<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(resource_id) {
            return Err(PipelineError::AlreadyRunning(resource_id));
        }
        Ok(InFlight {
            set: &self.in_flight,
            resource_id,
        })
    }

    /// Run one resource by id
    pub async fn run(&self, resource_id: Uuid) -> Result<RunReport> {
        let resource = self
            .catalog
            .resource(resource_id)
            .await?
            .ok_or(PipelineError::ResourceNotFound(resource_id))?;
        self.run_resource(resource).await
    }

    /// Run every active resource, one at a time
    ///
    /// A failing resource is logged and collected; the remaining ones still run.
    pub async fn run_all(&self) -> Result<RunSummary> {
        let resources = self.catalog.active_resources().await?;
        info!(resources = resources.len(), "Starting sequential run");

        let mut summary = RunSummary::default();
        for resource in resources {
            let result = self.run_resource(resource.clone()).await;
            summary.record(&resource, result);
        }
        log_summary(&summary);
        Ok(summary)
    }

    /// Run active resources with at most `workers` pipelines in flight
    pub async fn run_all_concurrent(&self, workers: usize) -> Result<RunSummary> {
        let workers = workers.max(1);
        let resources = self.catalog.active_resources().await?;
        info!(resources = resources.len(), workers, "Starting concurrent run");

        let results: Vec<(Resource, Result<RunReport>)> = stream::iter(resources)
            .map(|resource| async move {
                let result = self.run_resource(resource.clone()).await;
                (resource, result)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for (resource, result) in results {
            summary.record(&resource, result);
        }
        log_summary(&summary);
        Ok(summary)
    }

    #[instrument(
        skip(self, resource),
        fields(resource_id = %resource.id, resource = %resource.name, execution_id = field::Empty)
    )]
    async fn run_resource(&self, resource: Resource) -> Result<RunReport> {
        if !resource.active {
            info!("Resource inactive, skipping");
            return Ok(RunReport::Skipped {
                resource_id: resource.id,
            });
        }

        let _guard = self.acquire(resource.id)?;

        let execution = Execution::start(resource.id);
        self.catalog.create_execution(&execution).await?;
        Span::current().record("execution_id", field::display(execution.id));
        info!("Execution started");

        match self.run_phases(&resource, &execution).await {
            Ok(outcome) => {
                info!(
                    version = %outcome.artifact.version,
                    records = outcome.total_records,
                    notified = outcome.deliveries.len(),
                    "Execution completed"
                );
                Ok(RunReport::Completed(Box::new(outcome)))
            },
            Err(e) => {
                error!(kind = e.kind(), error = %e, "Execution failed");
                if let Err(mark_err) =
                    self.catalog.fail_execution(execution.id, &e.phase_message()).await
                {
                    error!(error = %mark_err, "Could not mark execution failed");
                }
                Err(e)
            },
        }
    }

    async fn run_phases(&self, resource: &Resource, execution: &Execution) -> Result<RunOutcome> {
        // EXTRACT
        let data = self.extract(resource).await?;

        // STAGE
        let records = staging::to_records(data);
        let staging_path = staging::staging_path(&self.staging_dir, resource.id, execution.id);
        staging::write_records(&staging_path, &records).await?;

        // PACKAGE
        let prior = self.catalog.latest_artifact(resource.id).await?;
        let built = self
            .packager
            .build(resource, execution.id, &staging_path, &records, prior.as_ref())
            .await?;
        let artifact = built.artifact;

        // LOAD
        let (records_loaded, load_error) = if resource.enable_load {
            self.load(resource, execution, &records).await
        } else {
            (None, None)
        };

        let completion = RunCompletion {
            execution_id: execution.id,
            completed_at: Utc::now(),
            total_records: records.len() as i64,
            staging_path: staging_path.display().to_string(),
            artifact: artifact.clone(),
        };
        if let Err(e) = self.catalog.complete_run(&completion).await {
            // the artifact row was not committed, so the bundle is orphaned
            if let Err(rm) = tokio::fs::remove_dir_all(&built.bundle_dir).await {
                warn!(error = %rm, path = %built.bundle_dir.display(), "Could not remove bundle");
            }
            return Err(e);
        }

        // NOTIFY, only once the artifact is committed
        let subscribers = match self.catalog.subscribers(resource.id).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                warn!(error = %e, "Could not list subscribers, skipping notifications");
                Vec::new()
            },
        };
        let deliveries = self
            .dispatcher
            .notify_subscribers(self.catalog.as_ref(), &artifact, resource, &subscribers)
            .await;

        if !deliveries.is_empty() {
            let notifications: Vec<_> = deliveries.iter().map(|d| d.record.clone()).collect();
            let updates: Vec<_> = deliveries
                .iter()
                .filter(|d| d.delivered())
                .map(|d| SubscriptionUpdate {
                    subscription_id: d.subscription_id,
                    current_version: artifact.version,
                    notified_at: d.record.sent_at,
                })
                .collect();
            if let Err(e) = self.catalog.record_deliveries(&notifications, &updates).await {
                warn!(error = %e, "Could not record webhook deliveries");
            }
        }

        Ok(RunOutcome {
            resource_id: resource.id,
            execution_id: execution.id,
            artifact,
            bump: built.decision.bump,
            total_records: records.len(),
            staging_path,
            records_loaded,
            load_error,
            deliveries,
        })
    }

    async fn extract(&self, resource: &Resource) -> Result<DomainData> {
        let fetcher = self
            .registry
            .build(&resource.fetcher_code, &resource.fetcher_params())?;

        match resource.timeout_seconds {
            Some(seconds) => {
                tokio::time::timeout(Duration::from_secs(seconds), run_pipeline(fetcher.as_ref()))
                    .await
                    .map_err(|_| PipelineError::Timeout { seconds })?
            },
            None => run_pipeline(fetcher.as_ref()).await,
        }
    }

    /// Load and record the outcome on the execution; never fails the run
    async fn load(
        &self,
        resource: &Resource,
        execution: &Execution,
        records: &[Record],
    ) -> (Option<u64>, Option<String>) {
        let result = match (&self.destination, &resource.target_table) {
            (None, _) => Err(PipelineError::Load("no destination configured".into())),
            (_, None) => Err(PipelineError::Load("resource has no target_table".into())),
            (Some(destination), Some(table)) => {
                let allowed_tables = BTreeSet::from([table.clone()]);
                let upsert_key = resource.upsert_keys();
                destination
                    .load(LoadRequest {
                        table,
                        records,
                        mode: resource.load_mode,
                        upsert_key: &upsert_key,
                        allowed_tables: &allowed_tables,
                    })
                    .await
            },
        };

        let (loaded, message) = match result {
            Ok(n) => {
                info!(loaded = n, "Load phase finished");
                (Some(n), None)
            },
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Load phase failed, continuing");
                (None, Some(e.phase_message()))
            },
        };

        let recorded = self
            .catalog
            .record_load(
                execution.id,
                loaded.and_then(|n| i64::try_from(n).ok()),
                message.as_deref(),
            )
            .await;
        if let Err(e) = recorded {
            warn!(error = %e, "Could not record load outcome");
        }

        (loaded, message)
    }
}

fn log_summary(summary: &RunSummary) {
    info!(
        completed = summary.completed(),
        skipped = summary.skipped(),
        failed = summary.failures.len(),
        "Run finished"
    );
}
