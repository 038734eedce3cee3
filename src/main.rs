//! stagerun CLI - Resumable, cost-accounted batch runs over generative models.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stagerun::models::EXAMPLE_CONFIG;
use stagerun::{
    Config, DraftPipeline, JobSpec, LlmClient, PriceTable, StatusMode, SummaryWriter, UsageLedger,
    UsageSummary,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "stagerun")]
#[command(version)]
#[command(about = "Resumable, cost-accounted batch runs over generative models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the draft pipeline over an items file
    Run {
        /// Path to input items JSONL file ({"id", "prompt"} per line)
        #[arg(short, long)]
        items: PathBuf,

        /// Path to output JSONL file
        #[arg(short, long)]
        output: PathBuf,

        /// Override scheduler concurrency
        #[arg(long)]
        concurrency: Option<usize>,

        /// Override status display (interactive, plain, off)
        #[arg(long)]
        status: Option<StatusMode>,

        /// Override checkpoint root directory
        #[arg(long)]
        checkpoints: Option<PathBuf>,
    },

    /// Show which stages are checkpointed for each item
    Status {
        /// Path to input items JSONL file
        #[arg(short, long)]
        items: PathBuf,

        /// Override checkpoint root directory
        #[arg(long)]
        checkpoints: Option<PathBuf>,
    },

    /// Print a usage summary written by a previous run
    Usage {
        /// Summary file (defaults to usage.summary_path from config)
        #[arg(short, long)]
        summary: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn print_summary(summary: &UsageSummary) {
    println!("Generated:   {}", summary.generated_at.to_rfc3339());
    println!("Calls:       {}", summary.totals.calls);
    println!("Total cost:  ${:.4}", summary.totals.cost_usd);
    if let Some(tokens) = &summary.totals.tokens {
        println!(
            "Tokens:      {} in ({} cached) / {} out ({} thinking)",
            tokens.input, tokens.cached, tokens.output, tokens.thinking
        );
    }
    for (model, totals) in &summary.models {
        println!("  {model:<32} {:>6} calls  ${:.4}", totals.calls, totals.cost_usd);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            println!("{EXAMPLE_CONFIG}");
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            info!("Configuration is valid");
            info!("  Endpoint: {} ({})", config.client.base_url, config.client.model);
            info!(
                "  Scheduler: concurrency {}, status {:?}",
                config.scheduler.concurrency, config.scheduler.status
            );
            info!("  Checkpoints: {}", config.checkpoints.root.display());
            info!("  Priced models: {}", config.pricing.len());
        }

        Commands::Status { items, checkpoints } => {
            let config = load_config(&cli.config)?;
            let root = checkpoints.unwrap_or(config.checkpoints.root);
            let items = DraftPipeline::load_items(&items).context("Failed to load items")?;

            // Status never calls the model, so no key is needed
            let client = Arc::new(LlmClient::new(
                None,
                config.client.base_url,
                config.client.timeout_secs,
            )?);
            let pipeline = DraftPipeline::new(client, config.client.model, root);

            let statuses = pipeline.status(&items).await?;
            let complete = statuses.iter().filter(|s| s.is_complete()).count();
            for status in &statuses {
                let stages = if status.checkpointed.is_empty() {
                    "-".to_string()
                } else {
                    status.checkpointed.join(", ")
                };
                println!("{:<24} {stages}", status.id);
            }
            println!("\n{complete}/{} items complete", statuses.len());
        }

        Commands::Usage { summary } => {
            let path = match summary {
                Some(path) => path,
                None => load_config(&cli.config)?
                    .usage
                    .summary_path
                    .context("No summary path given and usage.summary_path is not set")?,
            };
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read usage summary {path:?}"))?;
            let summary: UsageSummary = serde_json::from_str(&content)
                .with_context(|| format!("Invalid usage summary {path:?}"))?;
            print_summary(&summary);
        }

        Commands::Run {
            items,
            output,
            concurrency,
            status,
            checkpoints,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(concurrency) = concurrency {
                config.scheduler.concurrency = concurrency;
            }
            if let Some(status) = status {
                config.scheduler.status = status;
            }

            let api_key = config
                .resolve_api_key()
                .context("Failed to resolve API key")?;
            let client = Arc::new(LlmClient::from_config(&config.client, api_key)?);
            let root = checkpoints.unwrap_or_else(|| config.checkpoints.root.clone());
            let pipeline = Arc::new(DraftPipeline::new(client, config.client.model.clone(), root));
            let items = DraftPipeline::load_items(&items).context("Failed to load items")?;

            let prices = Arc::new(PriceTable::new(config.pricing.clone()));
            let ledger = Arc::new(UsageLedger::new(prices));
            let writer = config
                .usage
                .summary_path
                .clone()
                .map(|path| SummaryWriter::spawn(path, ledger.subscribe()));

            let spec =
                JobSpec::new("draft", items, Arc::clone(&ledger)).with_config(&config.scheduler);
            let outcome = pipeline.run(spec, &output).await;

            if let Some(writer) = writer {
                let path = writer.path().to_path_buf();
                writer.finish().await?;
                info!(path = %path.display(), "Usage summary written");
            }

            let outputs = outcome.context("Run failed")?;
            let summary = ledger.summary();
            println!("\n=== Run Complete ===");
            println!("Items:       {}", outputs.len());
            print_summary(&summary);
            println!("Output:      {output:?}");
        }
    }

    Ok(())
}
