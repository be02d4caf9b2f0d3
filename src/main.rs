use clap::{Parser, Subcommand};
use funding_scraper::config::Config;
use funding_scraper::db::SqliteStorage;
use funding_scraper::dedup::DedupEngine;
use funding_scraper::exporter::Exporter;
use funding_scraper::logging;
use funding_scraper::pipeline::Pipeline;
use funding_scraper::storage::Storage;
use funding_scraper::types::Stage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

/// Companies processed per run when neither --limit nor --all is given.
const DEFAULT_COMPANY_LIMIT: usize = 20;

#[derive(Parser)]
#[command(name = "funding_scraper")]
#[command(about = "Funding round collection and deduplication pipeline")]
#[command(version = "0.2.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: register, collect, extract, dedupe, export
    Run {
        /// CSV file with a Companies column
        csv: PathBuf,
        /// Process only the first N companies from the CSV
        #[arg(long)]
        limit: Option<usize>,
        /// Process every company in the CSV
        #[arg(long)]
        all: bool,
    },
    /// Run only the deduplication stage over stored rounds
    Dedupe,
    /// Export non-duplicate rounds in the configured formats
    Export,
    /// Print record store statistics
    Stats,
    /// Clear stage completion flags so companies get reprocessed
    Reset {
        /// Stages to reset (comma-separated); all stages when omitted
        #[arg(long)]
        stages: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    // Held until exit so the file writer flushes
    let _guard = logging::init_logging();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&config.database.path)?);

    match cli.command {
        Commands::Run { csv, limit, all } => {
            let limit = if all {
                None
            } else {
                Some(limit.unwrap_or(DEFAULT_COMPANY_LIMIT))
            };
            match limit {
                Some(n) => println!("🚀 Running pipeline (first {} companies)...", n),
                None => println!("🚀 Running pipeline (all companies)..."),
            }

            let pipeline = Pipeline::new(config, Arc::clone(&storage));
            match pipeline.run(&csv, limit).await {
                Ok(()) => println!("✅ Pipeline completed successfully"),
                Err(e) => {
                    error!("Pipeline failed: {}", e);
                    println!("❌ Pipeline failed: {}", e);
                }
            }
        }
        Commands::Dedupe => {
            println!("🔍 Deduplicating stored rounds...");
            let engine = DedupEngine::new(&config.dedup);
            let stats = engine.deduplicate_all(storage.as_ref()).await?;
            println!("\n📊 Deduplication Results:");
            println!("   Companies: {}", stats.total_companies);
            println!("   Total rounds: {}", stats.total_rounds);
            println!("   Unique rounds: {}", stats.unique_rounds);
            println!("   Duplicates removed: {}", stats.duplicates_removed);
            println!("   Dedup rate: {:.1}%", stats.deduplication_rate * 100.0);
        }
        Commands::Export => {
            println!("📦 Exporting funding rounds...");
            let exporter = Exporter::new(&config.export);
            let written = exporter.export_all(storage.as_ref()).await?;
            for path in &written {
                println!("   Wrote {}", path.display());
            }
            println!("✅ Exported {} files", written.len());
        }
        Commands::Stats => {
            let stats = storage.statistics().await?;
            println!("\n📊 Record Store Statistics:");
            println!("   Companies: {}", stats.companies);
            println!(
                "   Funding rounds: {} unique / {} total ({} duplicates)",
                stats.unique_rounds, stats.total_rounds, stats.duplicates
            );
            println!("   Investors: {}", stats.investors);
            println!("   Sources: {}", stats.sources);
            println!("   Total raised: ${:.0}", stats.total_amount_raised_usd);
        }
        Commands::Reset { stages } => {
            let stages = match stages {
                Some(list) => {
                    let mut parsed = Vec::new();
                    for name in list.split(',') {
                        let name = name.trim();
                        match Stage::parse(name) {
                            Some(stage) => parsed.push(stage),
                            None => anyhow::bail!(
                                "Unknown stage '{}' (expected one of: resolution, \
                                 filing_collection, search_extraction, deduplication)",
                                name
                            ),
                        }
                    }
                    parsed
                }
                None => Stage::ALL.to_vec(),
            };

            println!(
                "♻️  Resetting stages: {}",
                stages
                    .iter()
                    .map(Stage::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let affected = storage.reset_stages(&stages).await?;
            println!("✅ Reset {} status rows", affected);
        }
    }

    Ok(())
}
