use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use fedao_adapters::{BundleFileSource, TableSource};
use fedao_core::OperationCategory;
use fedao_pipeline::{report_recent_markdown, PipelineConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fedao-cli")]
#[command(about = "FEDAO operation announcement normalizer")]
struct Cli {
    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalize table bundles and merge them into the master datasets.
    Run {
        /// JSON table bundle with Treasury operation announcements.
        #[arg(long)]
        toa: Option<PathBuf>,
        /// JSON table bundle with agency MBS operation announcements.
        #[arg(long)]
        moa: Option<PathBuf>,
    },
    /// Print a digest of the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::Run { toa, moa } => {
            let mut sources: Vec<Box<dyn TableSource>> = Vec::new();
            if let Some(path) = toa {
                sources.push(Box::new(BundleFileSource::new(OperationCategory::Toa, path)));
            }
            if let Some(path) = moa {
                sources.push(Box::new(BundleFileSource::new(OperationCategory::Moa, path)));
            }

            let summary = fedao_pipeline::run_from_env(sources).await?;
            for category in &summary.categories {
                println!(
                    "{}: {:?} rows={} created={} rejected={} merged={} duplicates={}",
                    category.category,
                    category.status,
                    category.input_rows,
                    category.created,
                    category.rejected,
                    category.merged,
                    category.duplicates
                );
            }
            println!(
                "run complete: run_id={} status={} reports={}",
                summary.run_id,
                summary.status,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
            if summary.failed() {
                bail!("run {} failed: a master dataset could not be written", summary.run_id);
            }
        }
        Commands::Report { runs } => {
            let config = PipelineConfig::from_env();
            println!("{}", report_recent_markdown(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}
