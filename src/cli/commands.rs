//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::metrics;
use crate::service::DispatchService;
use crate::work::{BatchOptions, BatchProgress, SearchContext, WorkItem};

/// Top-level CLI arguments.
#[derive(Debug, Parser)]
#[command(
    name = "inferelay",
    version,
    about = "Resilient dispatch layer for literature inference endpoints"
)]
pub struct Cli {
    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit PMIDs for inference and print the batch result
    Submit {
        /// Study sponsor name
        #[arg(long)]
        sponsor: String,

        /// Drug INN (international nonproprietary name)
        #[arg(long)]
        drug: String,

        /// Brand name, when one is known
        #[arg(long)]
        brand: Option<String>,

        /// File containing one PMID per line
        #[arg(long)]
        file: Option<PathBuf>,

        /// PMIDs given directly on the command line
        pmids: Vec<String>,

        /// Override the configured chunk size for this submission
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Print per-endpoint health snapshots
    Health,

    /// Print active retry jobs and cumulative queue statistics
    Queue,

    /// Force an immediate background pass for one retry job
    Retry {
        /// Identifier of the retry job
        job_id: Uuid,
    },

    /// Probe every configured endpoint and print reachability
    Probe,

    /// Print metrics in Prometheus text format
    Metrics,
}

/// Parses CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    metrics::init_metrics().context("Failed to initialize metrics")?;

    let config = DispatchConfig::from_env().context("Failed to load configuration")?;
    let service = DispatchService::new(config)
        .await
        .context("Failed to construct dispatch service")?;

    match cli.command {
        Command::Submit {
            sponsor,
            drug,
            brand,
            file,
            pmids,
            batch_size,
        } => {
            let items = collect_items(file, pmids).await?;
            if items.is_empty() {
                bail!("No PMIDs given; pass them as arguments or via --file");
            }

            let mut context = SearchContext::new(sponsor, drug);
            if let Some(brand) = brand {
                context = context.with_brand(brand);
            }

            let mut options = BatchOptions::new().with_progress(Arc::new(
                |progress: BatchProgress| {
                    info!(
                        chunk = progress.chunk_index + 1,
                        total_chunks = progress.total_chunks,
                        succeeded = progress.succeeded,
                        failed = progress.failed,
                        "Chunk complete"
                    );
                },
            ));
            if let Some(size) = batch_size {
                options = options.with_batch_size(size);
            }

            service.start();
            let result = service.submit_batch(items, context, options).await?;
            service.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(queued) = &result.queued {
                eprintln!(
                    "{} item(s) unresolved; queued as retry job {} - re-run later or trigger with `inferelay retry {}`",
                    queued.pmids.len(),
                    queued.job_id,
                    queued.job_id
                );
            }
        }

        Command::Health => {
            let status = service.health_status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::Queue => {
            let status = service.queue_status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::Retry { job_id } => {
            let report = service.manual_retry(job_id).await?;
            service.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Probe => {
            let outcomes = service.test_connection().await;
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
            let dead = outcomes.iter().filter(|o| !o.alive).count();
            if dead > 0 {
                bail!("{} endpoint(s) unreachable", dead);
            }
        }

        Command::Metrics => {
            print!("{}", metrics::export_metrics());
        }
    }

    Ok(())
}

/// Collects work items from a PMID file and/or direct arguments.
async fn collect_items(
    file: Option<PathBuf>,
    pmids: Vec<String>,
) -> anyhow::Result<Vec<WorkItem>> {
    let mut items: Vec<WorkItem> = Vec::new();

    if let Some(path) = file {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read PMID file {}", path.display()))?;
        items.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(WorkItem::new),
        );
    }

    items.extend(pmids.into_iter().map(WorkItem::new));
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_submit_args() {
        let cli = Cli::try_parse_from([
            "inferelay",
            "submit",
            "--sponsor",
            "Acme",
            "--drug",
            "adalimumab",
            "--brand",
            "Humira",
            "38011234",
            "38011235",
        ])
        .expect("parse");

        match cli.command {
            Command::Submit {
                sponsor,
                drug,
                brand,
                pmids,
                ..
            } => {
                assert_eq!(sponsor, "Acme");
                assert_eq!(drug, "adalimumab");
                assert_eq!(brand.as_deref(), Some("Humira"));
                assert_eq!(pmids, vec!["38011234", "38011235"]);
            }
            other => panic!("expected submit, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_requires_uuid() {
        assert!(Cli::try_parse_from(["inferelay", "retry", "not-a-uuid"]).is_err());
        assert!(Cli::try_parse_from([
            "inferelay",
            "retry",
            "550e8400-e29b-41d4-a716-446655440000"
        ])
        .is_ok());
    }

    #[tokio::test]
    async fn test_collect_items_from_file_and_args() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pmids.txt");
        tokio::fs::write(&path, "1\n2\n\n# comment\n3\n")
            .await
            .expect("write");

        let items = collect_items(Some(path), vec!["4".to_string()])
            .await
            .expect("collect");

        let pmids: Vec<&str> = items.iter().map(|i| i.pmid.as_str()).collect();
        assert_eq!(pmids, vec!["1", "2", "3", "4"]);
    }
}
