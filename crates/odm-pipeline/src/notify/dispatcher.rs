//! Webhook delivery to subscribed applications

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::signing::{self, SIGNATURE_HEADER};
use crate::catalog::Catalog;
use crate::config::NotifyConfig;
use crate::error::{truncate_message, PipelineError, Result};
use crate::models::{Artifact, NotificationRecord, Resource, Subscriber};
use crate::package::{DATA_FILE, METADATA_FILE, MODELS_FILE, SCHEMA_FILE};
use crate::versioning::{diff, BumpType, SchemaDiff};

/// Event name of a new artifact
pub const ARTIFACT_PUBLISHED: &str = "artifact.published";

const MAX_RESPONSE_BODY: usize = 1000;

#[derive(Debug, Serialize)]
struct ArtifactSummary<'a> {
    id: Uuid,
    resource_id: Uuid,
    resource_name: &'a str,
    publisher: &'a str,
    version: String,
    version_type: BumpType,
    created_at: String,
    record_count: i64,
    checksum: &'a str,
}

#[derive(Debug, Serialize)]
struct DownloadUrls {
    data: String,
    schema: String,
    models: String,
    metadata: String,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    artifact: ArtifactSummary<'a>,
    schema_diff: Option<&'a SchemaDiff>,
    download_urls: DownloadUrls,
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription_id: Uuid,
    pub record: NotificationRecord,
}

impl Delivery {
    pub fn delivered(&self) -> bool {
        self.record.delivered()
    }
}

/// Signs and POSTs webhook payloads
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    client: Client,
    public_base_url: String,
}

impl NotificationDispatcher {
    pub fn new(config: &NotifyConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("odm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::configuration(format!("webhook client: {}", e)))?;
        Ok(Self {
            client,
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn download_urls(&self, artifact_id: Uuid) -> DownloadUrls {
        let url = |file: &str| format!("{}/api/artifacts/{}/{}", self.public_base_url, artifact_id, file);
        DownloadUrls {
            data: url(DATA_FILE),
            schema: url(SCHEMA_FILE),
            models: url(MODELS_FILE),
            metadata: url(METADATA_FILE),
        }
    }

    /// Payload for one subscriber
    ///
    /// `schema_diff` is relative to the version the subscriber last saw. Without
    /// it, `version_type` follows the shape of the new version.
    pub fn build_payload(
        &self,
        artifact: &Artifact,
        resource: &Resource,
        schema_diff: Option<&SchemaDiff>,
    ) -> Result<Value> {
        let version_type = match schema_diff {
            Some(d) => BumpType::from_diff(d),
            None => artifact.version.implied_bump(),
        };
        let payload = WebhookPayload {
            event: ARTIFACT_PUBLISHED,
            artifact: ArtifactSummary {
                id: artifact.id,
                resource_id: resource.id,
                resource_name: &resource.name,
                publisher: &resource.publisher,
                version: artifact.version.to_string(),
                version_type,
                created_at: artifact.created_at.to_rfc3339(),
                record_count: artifact.record_count,
                checksum: &artifact.checksum,
            },
            schema_diff,
            download_urls: self.download_urls(artifact.id),
        };
        Ok(serde_json::to_value(payload)?)
    }

    /// Deliver `artifact` to every eligible subscriber
    ///
    /// A subscriber is eligible when its application is active, has a webhook
    /// URL and its subscription accepts the artifact version. Each attempt is
    /// isolated: a failure is recorded and the next subscriber is tried.
    #[instrument(skip_all, fields(artifact_id = %artifact.id, version = %artifact.version))]
    pub async fn notify_subscribers(
        &self,
        catalog: &dyn Catalog,
        artifact: &Artifact,
        resource: &Resource,
        subscribers: &[Subscriber],
    ) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        for subscriber in subscribers {
            let app = &subscriber.application;
            let Some(url) = app.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) else {
                debug!(application = %app.name, "Application has no webhook URL");
                continue;
            };
            if !app.active {
                debug!(application = %app.name, "Application inactive");
                continue;
            }
            if !subscriber.subscription.accepts(&artifact.version) {
                debug!(application = %app.name, "Subscription policy excludes this version");
                continue;
            }

            let schema_diff = self.diff_for(catalog, artifact, subscriber).await;
            let secret = app.webhook_secret.as_deref();
            let outcome = self
                .deliver(url, secret, artifact, resource, schema_diff.as_ref())
                .await;
            let record = match outcome {
                Ok((status, body)) => {
                    if (200..300).contains(&status) {
                        info!(application = %app.name, status, "Webhook delivered");
                    } else {
                        warn!(application = %app.name, status, "Webhook rejected");
                    }
                    NotificationRecord {
                        id: Uuid::new_v4(),
                        application_id: app.id,
                        artifact_id: artifact.id,
                        sent_at: Utc::now(),
                        status_code: Some(status),
                        response_body: Some(body),
                        error_message: None,
                    }
                },
                Err(e) => {
                    warn!(application = %app.name, error = %e, kind = e.kind(), "Webhook delivery failed");
                    NotificationRecord {
                        id: Uuid::new_v4(),
                        application_id: app.id,
                        artifact_id: artifact.id,
                        sent_at: Utc::now(),
                        status_code: None,
                        response_body: None,
                        error_message: Some(e.phase_message()),
                    }
                },
            };

            deliveries.push(Delivery {
                subscription_id: subscriber.subscription.id,
                record,
            });
        }

        deliveries
    }

    async fn diff_for(
        &self,
        catalog: &dyn Catalog,
        artifact: &Artifact,
        subscriber: &Subscriber,
    ) -> Option<SchemaDiff> {
        let seen = subscriber.subscription.current_version?;
        match catalog.artifact_by_version(artifact.resource_id, &seen).await {
            Ok(Some(previous)) => Some(diff(&previous.schema, &artifact.schema)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, version = %seen, "Could not load previously notified artifact");
                None
            },
        }
    }

    async fn deliver(
        &self,
        url: &str,
        secret: Option<&str>,
        artifact: &Artifact,
        resource: &Resource,
        schema_diff: Option<&SchemaDiff>,
    ) -> Result<(u16, String)> {
        let payload = self.build_payload(artifact, resource, schema_diff)?;
        let body = signing::canonical_bytes(&payload)?;
        let signature = signing::sign(secret.unwrap_or_default().as_bytes(), &body)?;

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .map_err(|e| PipelineError::Notification(e.to_string()))?;

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!(status, error = %e, "Could not read webhook response body");
                String::new()
            },
        };
        Ok((status, truncate_message(&text, MAX_RESPONSE_BODY)))
    }
}
