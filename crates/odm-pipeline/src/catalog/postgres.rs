//! Postgres catalog

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{Catalog, RunCompletion, SubscriptionUpdate};
use crate::config::DatabaseConfig;
use crate::error::{PipelineError, Result};
use crate::fetchers::{FetcherDescriptor, ParamSpec};
use crate::models::{
    Application, Artifact, Execution, ExecutionStatus, LoadMode, NotificationRecord, Resource,
    ResourceParam, Subscriber, Subscription,
};
use crate::schema::SchemaDescriptor;
use crate::versioning::SemanticVersion;

const RESOURCE_COLUMNS: &str = "id, name, publisher, description, target_table, active, \
     enable_load, load_mode, fetcher_code, execution_priority, timeout_seconds";

const ARTIFACT_COLUMNS: &str = "id, resource_id, execution_id, major_version, minor_version, \
     patch_version, schema_json, data_path, record_count, checksum, created_at";

/// Catalog backed by a Postgres pool
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool sized by `config`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database connection pool created"
        );
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn params_for(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<ResourceParam>>> {
        let rows = sqlx::query(
            r#"
            SELECT resource_id, key, value
            FROM resource_params
            WHERE resource_id = ANY($1)
            ORDER BY resource_id, position, key
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut params: HashMap<Uuid, Vec<ResourceParam>> = HashMap::new();
        for row in rows {
            params
                .entry(row.try_get("resource_id")?)
                .or_default()
                .push(ResourceParam {
                    key: row.try_get("key")?,
                    value: row.try_get("value")?,
                });
        }
        Ok(params)
    }

    async fn with_params(&self, rows: Vec<PgRow>) -> Result<Vec<Resource>> {
        let mut resources = rows.iter().map(resource_from_row).collect::<Result<Vec<_>>>()?;
        let ids: Vec<Uuid> = resources.iter().map(|r| r.id).collect();
        let mut params = self.params_for(&ids).await?;
        for resource in &mut resources {
            resource.params = params.remove(&resource.id).unwrap_or_default();
        }
        Ok(resources)
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str, column: &str) -> Result<T> {
    value
        .parse()
        .map_err(|e| PipelineError::catalog(format!("column {}: {}", column, e)))
}

fn resource_from_row(row: &PgRow) -> Result<Resource> {
    let load_mode: String = row.try_get("load_mode")?;
    let timeout: Option<i64> = row.try_get("timeout_seconds")?;
    Ok(Resource {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        publisher: row.try_get("publisher")?,
        description: row.try_get("description")?,
        target_table: row.try_get("target_table")?,
        active: row.try_get("active")?,
        enable_load: row.try_get("enable_load")?,
        load_mode: parse_column::<LoadMode>(&load_mode, "load_mode")?,
        fetcher_code: row.try_get("fetcher_code")?,
        params: Vec::new(),
        execution_priority: row.try_get("execution_priority")?,
        timeout_seconds: timeout.and_then(|t| u64::try_from(t).ok()),
    })
}

fn execution_from_row(row: &PgRow) -> Result<Execution> {
    let status: String = row.try_get("status")?;
    Ok(Execution {
        id: row.try_get("id")?,
        resource_id: row.try_get("resource_id")?,
        status: parse_column::<ExecutionStatus>(&status, "status")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        total_records: row.try_get("total_records")?,
        records_loaded: row.try_get("records_loaded")?,
        staging_path: row.try_get("staging_path")?,
        error_message: row.try_get("error_message")?,
    })
}

fn version_part(row: &PgRow, column: &str) -> Result<u32> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|_| PipelineError::catalog(format!("column {} out of range: {}", column, value)))
}

fn artifact_from_row(row: &PgRow) -> Result<Artifact> {
    let schema_json: serde_json::Value = row.try_get("schema_json")?;
    Ok(Artifact {
        id: row.try_get("id")?,
        resource_id: row.try_get("resource_id")?,
        execution_id: row.try_get("execution_id")?,
        version: SemanticVersion::new(
            version_part(row, "major_version")?,
            version_part(row, "minor_version")?,
            version_part(row, "patch_version")?,
        ),
        schema: SchemaDescriptor::from_json(&schema_json)?,
        data_path: row.try_get("data_path")?,
        record_count: row.try_get("record_count")?,
        checksum: row.try_get("checksum")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber> {
    let pinned: Option<String> = row.try_get("pinned_version")?;
    let auto_upgrade: Option<String> = row.try_get("auto_upgrade")?;
    let current: Option<String> = row.try_get("current_version")?;

    let subscription = Subscription {
        id: row.try_get("subscription_id")?,
        application_id: row.try_get("application_id")?,
        resource_id: row.try_get("resource_id")?,
        pinned_version: pinned
            .as_deref()
            .map(|p| parse_column(p, "pinned_version"))
            .transpose()?,
        auto_upgrade: auto_upgrade
            .as_deref()
            .map(|p| parse_column(p, "auto_upgrade"))
            .transpose()?,
        current_version: current
            .as_deref()
            .map(|v| {
                SemanticVersion::parse(v).ok_or_else(|| {
                    PipelineError::catalog(format!("column current_version: invalid '{}'", v))
                })
            })
            .transpose()?,
        notified_at: row.try_get("notified_at")?,
    };

    let application = Application {
        id: row.try_get("application_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        models_path: row.try_get("models_path")?,
        subscribed_resources: row.try_get("subscribed_resources")?,
        active: row.try_get("active")?,
        webhook_url: row.try_get("webhook_url")?,
        webhook_secret: row.try_get("webhook_secret")?,
    };

    Ok(Subscriber {
        subscription,
        application,
    })
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn resource(&self, id: Uuid) -> Result<Option<Resource>> {
        let row = sqlx::query(&format!("SELECT {} FROM resources WHERE id = $1", RESOURCE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(self.with_params(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn active_resources(&self) -> Result<Vec<Resource>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM resources WHERE active ORDER BY execution_priority DESC, name",
            RESOURCE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        self.with_params(rows).await
    }

    #[instrument(skip_all, fields(code = %descriptor.code))]
    async fn upsert_fetcher(&self, descriptor: &FetcherDescriptor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fetchers (code, name, description, params)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (code)
            DO UPDATE SET name = EXCLUDED.name,
                          description = EXCLUDED.description,
                          params = EXCLUDED.params,
                          updated_at = NOW()
            "#,
        )
        .bind(&descriptor.code)
        .bind(&descriptor.name)
        .bind(&descriptor.description)
        .bind(serde_json::to_value(&descriptor.params)?)
        .execute(&self.pool)
        .await?;
        debug!("Fetcher descriptor stored");
        Ok(())
    }

    async fn fetchers(&self) -> Result<Vec<FetcherDescriptor>> {
        let rows = sqlx::query("SELECT code, name, description, params FROM fetchers ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<FetcherDescriptor> {
                let params: serde_json::Value = row.try_get("params")?;
                Ok(FetcherDescriptor {
                    code: row.try_get("code")?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    params: serde_json::from_value::<Vec<ParamSpec>>(params)?,
                })
            })
            .collect()
    }

    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, resource_id, status, started_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(execution.id)
        .bind(execution.resource_id)
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn execution(&self, id: Uuid) -> Result<Option<Execution>> {
        let row = sqlx::query(
            r#"
            SELECT id, resource_id, status, started_at, completed_at, total_records,
                   records_loaded, staging_path, error_message
            FROM executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn fail_execution(&self, id: Uuid, error_message: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'failed', completed_at = NOW(), error_message = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::catalog(format!("execution {} is not running", id)));
        }
        Ok(())
    }

    async fn record_load(
        &self,
        id: Uuid,
        records_loaded: Option<i64>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET records_loaded = $2, error_message = COALESCE($3, error_message)
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(records_loaded)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_artifact(&self, resource_id: Uuid) -> Result<Option<Artifact>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM artifacts WHERE resource_id = $1 \
             ORDER BY major_version DESC, minor_version DESC, patch_version DESC LIMIT 1",
            ARTIFACT_COLUMNS
        ))
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn artifact_by_version(
        &self,
        resource_id: Uuid,
        version: &SemanticVersion,
    ) -> Result<Option<Artifact>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM artifacts WHERE resource_id = $1 \
             AND major_version = $2 AND minor_version = $3 AND patch_version = $4",
            ARTIFACT_COLUMNS
        ))
        .bind(resource_id)
        .bind(i64::from(version.major))
        .bind(i64::from(version.minor))
        .bind(i64::from(version.patch))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn subscribers(&self, resource_id: Uuid) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id AS subscription_id, s.application_id, s.resource_id, s.pinned_version,
                   s.auto_upgrade, s.current_version, s.notified_at,
                   a.name, a.description, a.models_path, a.subscribed_resources, a.active,
                   a.webhook_url, a.webhook_secret
            FROM subscriptions s
            JOIN applications a ON a.id = s.application_id
            WHERE s.resource_id = $1 AND a.active
            ORDER BY a.name
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscriber_from_row).collect()
    }

    #[instrument(skip_all, fields(execution_id = %completion.execution_id, artifact_id = %completion.artifact.id))]
    async fn complete_run(&self, completion: &RunCompletion) -> Result<()> {
        let artifact = &completion.artifact;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO artifacts (
                id, resource_id, execution_id, major_version, minor_version, patch_version,
                schema_json, data_path, record_count, checksum, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(artifact.id)
        .bind(artifact.resource_id)
        .bind(artifact.execution_id)
        .bind(i64::from(artifact.version.major))
        .bind(i64::from(artifact.version.minor))
        .bind(i64::from(artifact.version.patch))
        .bind(artifact.schema.to_json())
        .bind(&artifact.data_path)
        .bind(artifact.record_count)
        .bind(&artifact.checksum)
        .bind(artifact.created_at)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'completed', completed_at = $2, total_records = $3, staging_path = $4
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(completion.execution_id)
        .bind(completion.completed_at)
        .bind(completion.total_records)
        .bind(&completion.staging_path)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            // dropping the transaction rolls back the artifact insert
            return Err(PipelineError::catalog(format!(
                "execution {} is not running",
                completion.execution_id
            )));
        }

        tx.commit().await?;
        info!("Run committed");
        Ok(())
    }

    #[instrument(skip_all, fields(notifications = notifications.len()))]
    async fn record_deliveries(
        &self,
        notifications: &[NotificationRecord],
        updates: &[SubscriptionUpdate],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for record in notifications {
            sqlx::query(
                r#"
                INSERT INTO notifications (
                    id, application_id, artifact_id, sent_at, status_code, response_body,
                    error_message
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(record.id)
            .bind(record.application_id)
            .bind(record.artifact_id)
            .bind(record.sent_at)
            .bind(record.status_code.map(i32::from))
            .bind(&record.response_body)
            .bind(&record.error_message)
            .execute(&mut *tx)
            .await?;
        }

        for update in updates {
            sqlx::query(
                "UPDATE subscriptions SET current_version = $2, notified_at = $3 WHERE id = $1",
            )
            .bind(update.subscription_id)
            .bind(update.current_version.to_string())
            .bind(update.notified_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(updated = updates.len(), "Deliveries recorded");
        Ok(())
    }
}
