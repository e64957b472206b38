//! Artifact bundle builder

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::bindings::{self, BindingContext};
use super::{DATA_FILE, METADATA_FILE, MODELS_FILE, SCHEMA_FILE};
use crate::error::{PipelineError, Result};
use crate::models::{Artifact, Resource};
use crate::schema::{self, SchemaDescriptor};
use crate::staging::Record;
use crate::versioning::{decide_version, SemanticVersion, VersionDecision};

/// Contents of `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub artifact_id: Uuid,
    pub resource_id: Uuid,
    pub resource_name: String,
    pub execution_id: Uuid,
    pub version: SemanticVersion,
    pub created_at: DateTime<Utc>,
    pub record_count: i64,
    pub checksum: String,
}

/// A written bundle and the version decision behind it
#[derive(Debug, Clone)]
pub struct BuiltPackage {
    pub artifact: Artifact,
    pub decision: VersionDecision,
    pub bundle_dir: PathBuf,
}

/// Writes versioned bundles under `{root}/{resource_id}/{artifact_id}/`
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    root: PathBuf,
}

impl PackageBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Infer, version and write the bundle for one run
    ///
    /// `prior` is the latest artifact of the resource, if any.
    #[instrument(skip_all, fields(resource_id = %resource.id, execution_id = %execution_id))]
    pub async fn build(
        &self,
        resource: &Resource,
        execution_id: Uuid,
        staging_file: &Path,
        records: &[Record],
        prior: Option<&Artifact>,
    ) -> Result<BuiltPackage> {
        let schema = schema::infer(records);
        let decision = decide_version(prior.map(|a| (&a.version, &a.schema)), &schema)?;
        let version = decision.version;
        info!(%version, bump = %decision.bump, fields = schema.properties.len(), "Computed artifact version");

        let artifact_id = Uuid::new_v4();
        let bundle_dir = self
            .root
            .join(resource.id.to_string())
            .join(artifact_id.to_string());
        let written = self
            .write_bundle(
                resource,
                execution_id,
                artifact_id,
                &bundle_dir,
                staging_file,
                records,
                &schema,
                version,
            )
            .await;
        let (checksum, created_at, record_count) = match written {
            Ok(written) => written,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(&bundle_dir).await {
                    warn!(error = %rm, path = %bundle_dir.display(), "Could not remove partial bundle");
                }
                return Err(e);
            },
        };

        info!(%artifact_id, path = %bundle_dir.display(), %checksum, "Artifact bundle written");

        Ok(BuiltPackage {
            artifact: Artifact {
                id: artifact_id,
                resource_id: resource.id,
                execution_id,
                version,
                schema,
                data_path: bundle_dir.display().to_string(),
                record_count,
                checksum,
                created_at,
            },
            decision,
            bundle_dir,
        })
    }

    /// Write all four files; the caller removes `bundle_dir` on error
    #[allow(clippy::too_many_arguments)]
    async fn write_bundle(
        &self,
        resource: &Resource,
        execution_id: Uuid,
        artifact_id: Uuid,
        bundle_dir: &Path,
        staging_file: &Path,
        records: &[Record],
        schema: &SchemaDescriptor,
        version: SemanticVersion,
    ) -> Result<(String, DateTime<Utc>, i64)> {
        tokio::fs::create_dir_all(bundle_dir).await?;

        let data_file = bundle_dir.join(DATA_FILE);
        tokio::fs::copy(staging_file, &data_file).await?;

        tokio::fs::write(bundle_dir.join(SCHEMA_FILE), serde_json::to_vec_pretty(schema)?).await?;

        let version_text = version.to_string();
        let models = bindings::render(
            &BindingContext {
                resource_name: &resource.name,
                publisher: &resource.publisher,
                version: &version_text,
                type_name: resource.target_table.as_deref().unwrap_or(&resource.name),
            },
            schema,
        );
        tokio::fs::write(bundle_dir.join(MODELS_FILE), models).await?;

        let checksum = checksum_file(data_file).await?;
        let created_at = Utc::now();
        let record_count = records.len() as i64;

        let metadata = ArtifactMetadata {
            artifact_id,
            resource_id: resource.id,
            resource_name: resource.name.clone(),
            execution_id,
            version,
            created_at,
            record_count,
            checksum: checksum.clone(),
        };
        tokio::fs::write(bundle_dir.join(METADATA_FILE), serde_json::to_vec_pretty(&metadata)?)
            .await?;

        Ok((checksum, created_at, record_count))
    }
}

async fn checksum_file(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || odm_common::checksum::compute_file_checksum(&path))
        .await
        .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?
        .map_err(PipelineError::from)
}

/// Re-hash `data.jsonl` in a bundle and compare with `metadata.json`
pub async fn verify_bundle(bundle_dir: &Path) -> Result<ArtifactMetadata> {
    let metadata: ArtifactMetadata =
        serde_json::from_slice(&tokio::fs::read(bundle_dir.join(METADATA_FILE)).await?)?;
    let data_file = bundle_dir.join(DATA_FILE);
    let expected = metadata.checksum.clone();
    tokio::task::spawn_blocking(move || {
        odm_common::checksum::verify_file_checksum(&data_file, &expected)
    })
    .await
    .map_err(|e| PipelineError::Io(std::io::Error::other(e)))??;
    Ok(metadata)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::staging;
    use crate::versioning::BumpType;
    use serde_json::json;
    use tempfile::TempDir;

    fn records(value: serde_json::Value) -> Vec<Record> {
        staging::to_records(value.into())
    }

    async fn stage(dir: &Path, recs: &[Record]) -> PathBuf {
        let path = dir.join("staged.jsonl");
        staging::write_records(&path, recs).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_first_build_writes_bundle() {
        let dir = TempDir::new().unwrap();
        let builder = PackageBuilder::new(dir.path().join("artifacts"));
        let mut resource = Resource::new("Grants", "IGAE", "REST");
        resource.target_table = Some("grants".into());
        let recs = records(json!([{"a": 1, "b": "x"}, {"a": 2}]));
        let staged = stage(dir.path(), &recs).await;

        let built = builder
            .build(&resource, Uuid::new_v4(), &staged, &recs, None)
            .await
            .unwrap();

        assert_eq!(built.artifact.version, SemanticVersion::INITIAL);
        assert_eq!(built.decision.bump, BumpType::Major);
        assert_eq!(built.artifact.record_count, 2);
        for file in [DATA_FILE, SCHEMA_FILE, MODELS_FILE, METADATA_FILE] {
            assert!(built.bundle_dir.join(file).is_file(), "missing {}", file);
        }
        assert!(built
            .bundle_dir
            .starts_with(dir.path().join("artifacts").join(resource.id.to_string())));

        let metadata = verify_bundle(&built.bundle_dir).await.unwrap();
        assert_eq!(metadata.checksum, built.artifact.checksum);
        assert_eq!(metadata.artifact_id, built.artifact.id);

        // checksum covers the staged bytes
        let staged_hash = odm_common::checksum::compute_file_checksum(&staged).unwrap();
        assert_eq!(staged_hash, built.artifact.checksum);

        let models = std::fs::read_to_string(built.bundle_dir.join(MODELS_FILE)).unwrap();
        assert!(models.contains("pub struct Grants {"));
    }

    #[tokio::test]
    async fn test_second_build_bumps_from_prior() {
        let dir = TempDir::new().unwrap();
        let builder = PackageBuilder::new(dir.path());
        let resource = Resource::new("r", "p", "REST");

        let first = records(json!([{"a": 1}]));
        let staged = stage(dir.path(), &first).await;
        let prior = builder
            .build(&resource, Uuid::new_v4(), &staged, &first, None)
            .await
            .unwrap()
            .artifact;

        let second = records(json!([{"a": 1, "b": "x"}]));
        let staged = stage(dir.path(), &second).await;
        let built = builder
            .build(&resource, Uuid::new_v4(), &staged, &second, Some(&prior))
            .await
            .unwrap();

        assert_eq!(built.artifact.version, SemanticVersion::new(1, 1, 0));
        assert_eq!(built.decision.diff.unwrap().added_fields, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let builder = PackageBuilder::new(dir.path());
        let resource = Resource::new("r", "p", "REST");
        let recs = records(json!([{"a": 1}]));
        let staged = stage(dir.path(), &recs).await;
        let built = builder
            .build(&resource, Uuid::new_v4(), &staged, &recs, None)
            .await
            .unwrap();

        std::fs::write(built.bundle_dir.join(DATA_FILE), "{\"a\":2}\n").unwrap();
        assert!(verify_bundle(&built.bundle_dir).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_build_leaves_no_bundle() {
        let dir = TempDir::new().unwrap();
        let builder = PackageBuilder::new(dir.path().join("artifacts"));
        let resource = Resource::new("r", "p", "REST");
        let recs = records(json!([{"a": 1}]));

        // staging file was never written
        let missing = dir.path().join("missing.jsonl");
        let err = builder
            .build(&resource, Uuid::new_v4(), &missing, &recs, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)), "{:?}", err);

        let resource_dir = dir.path().join("artifacts").join(resource.id.to_string());
        let leftovers: Vec<_> = std::fs::read_dir(&resource_dir)
            .map(|entries| entries.collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }
}
