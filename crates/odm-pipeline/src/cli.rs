//! `odm` command line

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::{Catalog, PgCatalog};
use crate::config::Config;
use crate::load::PgDestination;
use crate::notify::NotificationDispatcher;
use crate::orchestrator::{Pipeline, RunReport, RunSummary};
use crate::registry::FetcherRegistry;
use crate::{schema, staging};

/// ODM - data acquisition pipeline
#[derive(Parser, Debug)]
#[command(name = "odm")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline for one resource
    Run {
        /// Resource id
        resource_id: Uuid,
    },

    /// Run the pipeline for every active resource
    RunAll {
        /// Resource pipelines to run concurrently
        #[arg(short, long, env = "ODM_MAX_WORKERS")]
        workers: Option<usize>,
    },

    /// List the registered fetcher types and their parameters
    Fetchers,

    /// Store the registered fetcher descriptors in the catalog
    SeedFetchers,

    /// Print the schema inferred from a JSONL file
    Infer {
        /// Newline-delimited JSON file
        file: PathBuf,
    },

    /// Check an artifact bundle against its recorded checksum
    Verify {
        /// Artifact bundle directory
        artifact_dir: PathBuf,
    },
}

/// Execute the parsed command
pub async fn execute(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Run { resource_id } => run(*resource_id).await,
        Commands::RunAll { workers } => run_all(*workers).await,
        Commands::Fetchers => {
            list_fetchers();
            Ok(())
        },
        Commands::SeedFetchers => seed_fetchers().await,
        Commands::Infer { file } => infer(file).await,
        Commands::Verify { artifact_dir } => verify(artifact_dir).await,
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgCatalog> {
    let catalog = PgCatalog::connect(&config.database)
        .await
        .context("Failed to connect to the catalog database")?;
    catalog.migrate().await?;
    Ok(catalog)
}

async fn pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let catalog = connect(config).await?;
    let destination = PgDestination::new(catalog.pool().clone(), &config.load_schema)?;
    let dispatcher = NotificationDispatcher::new(&config.notify)?;

    Ok(Pipeline::new(
        Arc::new(catalog),
        Arc::new(FetcherRegistry::with_builtin()),
        dispatcher,
        &config.storage.staging_dir,
        &config.storage.artifacts_dir,
    )
    .with_destination(Arc::new(destination)))
}

async fn run(resource_id: Uuid) -> anyhow::Result<()> {
    let config = Config::load()?;
    let pipeline = pipeline(&config).await?;

    match pipeline.run(resource_id).await? {
        RunReport::Skipped { resource_id } => {
            println!("Resource {} is inactive, nothing to do", resource_id);
        },
        RunReport::Completed(outcome) => {
            println!(
                "Artifact {} version {} ({} records, {})",
                outcome.artifact.id,
                outcome.artifact.version,
                outcome.total_records,
                outcome.bump
            );
            if let Some(err) = &outcome.load_error {
                println!("Load failed: {}", err);
            }
            let delivered = outcome.deliveries.iter().filter(|d| d.delivered()).count();
            println!("Notified {}/{} subscribers", delivered, outcome.deliveries.len());
        },
    }
    Ok(())
}

async fn run_all(workers: Option<usize>) -> anyhow::Result<()> {
    let config = Config::load()?;
    let pipeline = pipeline(&config).await?;
    let workers = config.workers(workers);

    let summary = if workers > 1 {
        pipeline.run_all_concurrent(workers).await?
    } else {
        pipeline.run_all().await?
    };
    print_summary(&summary);

    if !summary.failures.is_empty() {
        anyhow::bail!("{} resource(s) failed", summary.failures.len());
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Completed: {}  Skipped: {}  Failed: {}",
        summary.completed(),
        summary.skipped(),
        summary.failures.len()
    );
    for failure in &summary.failures {
        println!(
            "  {} ({}): {}",
            failure.resource_name, failure.resource_id, failure.message
        );
    }
}

fn list_fetchers() {
    let registry = FetcherRegistry::with_builtin();
    for descriptor in registry.descriptors() {
        println!("{}  {}", descriptor.code, descriptor.name);
        println!("    {}", descriptor.description);
        for param in &descriptor.params {
            let mut line = format!(
                "    - {}{} ({:?})",
                param.name,
                if param.required { "*" } else { "" },
                param.data_type
            );
            if let Some(default) = &param.default {
                line.push_str(&format!(" default={}", default));
            }
            if let Some(values) = &param.enum_values {
                line.push_str(&format!(" one of [{}]", values.join(", ")));
            }
            println!("{}", line);
        }
    }
}

async fn seed_fetchers() -> anyhow::Result<()> {
    let config = Config::load()?;
    let catalog = connect(&config).await?;
    let registry = FetcherRegistry::with_builtin();
    for descriptor in registry.descriptors() {
        catalog.upsert_fetcher(descriptor).await?;
        println!("Stored {}", descriptor.code);
    }
    Ok(())
}

async fn infer(file: &Path) -> anyhow::Result<()> {
    let records = staging::read_records(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let schema = schema::infer(&records);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

async fn verify(artifact_dir: &Path) -> anyhow::Result<()> {
    let metadata = crate::package::verify_bundle(artifact_dir)
        .await
        .with_context(|| format!("Verification failed for {}", artifact_dir.display()))?;
    println!(
        "OK {} version {} ({} records, sha256 {})",
        metadata.artifact_id, metadata.version, metadata.record_count, metadata.checksum
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_all() {
        let cli = Cli::try_parse_from(["odm", "run-all", "--workers", "4", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::RunAll { workers: Some(4) }));
    }
}
