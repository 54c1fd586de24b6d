mod aggregate;
mod db;
mod error;
mod fetch;
mod parser;
mod pipeline;
mod price;
mod reconcile;
mod record;
mod scraper;
mod settings;
mod store;
mod title;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::db::SqliteStore;
use crate::pipeline::{LiveSource, Pipeline, RawCandidate, TaskReport};
use crate::reconcile::{ArchiveMode, Reconciler, UpsertOptions};
use crate::record::RecordKey;
use crate::store::{MemoryStore, PriceStore};

#[derive(Parser)]
#[command(name = "pricewatch", about = "Game-currency price tracker across Turkish storefronts")]
struct Cli {
    /// Settings file (toml/json/yaml); PRICEWATCH_* env vars override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Run every task of a tasks file, one storefront at a time
    Run {
        /// JSON tasks file
        #[arg(short, long)]
        tasks: PathBuf,
        /// Override the configured archive mode
        #[arg(long, value_enum)]
        archive_mode: Option<ArchiveMode>,
        /// Only run the first N tasks
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Keep results in memory; the database is not touched
        #[arg(long)]
        dry_run: bool,
    },
    /// Ingest one merchant feed, downloading it first when --url is given
    Feed {
        /// Feed file (download target when --url is set)
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long)]
        site: String,
        #[arg(short, long)]
        url: Option<String>,
        /// Ignore a fresh cached copy
        #[arg(long)]
        force: bool,
        #[arg(long, value_enum)]
        archive_mode: Option<ArchiveMode>,
    },
    /// Ingest scraped {title, priceRaw} candidates from a JSON file
    Ingest {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long)]
        site: String,
        #[arg(long)]
        category: String,
        /// Source page recorded as provenance
        #[arg(short, long, default_value = "")]
        url: String,
        #[arg(long, value_enum)]
        archive_mode: Option<ArchiveMode>,
    },
    /// Cross-site comparison of current prices
    View {
        #[arg(long)]
        json: bool,
    },
    /// Archived prices of one item
    History {
        #[arg(short, long)]
        site: String,
        #[arg(long)]
        category: String,
        /// Item title; region words and punctuation are ignored
        #[arg(short, long)]
        item: String,
        #[arg(long)]
        json: bool,
    },
    /// Store counts
    Stats,
    /// Show how a price and title text would be parsed
    Parse { text: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = settings::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_filter.as_str().into()),
        )
        .init();

    let result = match cli.command {
        Commands::Init => {
            SqliteStore::open(&settings.db_path).context("Failed to open store")?;
            println!("Schema ready at {}", settings.db_path.display());
            Ok(())
        }
        Commands::Run {
            tasks,
            archive_mode,
            limit,
            dry_run,
        } => {
            let mut tasks = settings::load_tasks(&tasks)?;
            if let Some(n) = limit {
                tasks.truncate(n);
            }
            if tasks.is_empty() {
                println!("No tasks to run.");
                return Ok(());
            }

            let options = upsert_options(&settings, archive_mode);
            info!(tasks = tasks.len(), mode = ?options.archive_mode, dry_run, "Pipeline started");
            println!("Running {} tasks...", tasks.len());

            if dry_run {
                let reconciler = Reconciler::new(MemoryStore::new());
                run_pipeline(&reconciler, &settings, &tasks, options).await?;
                let s = reconciler.store().stats()?;
                println!("Dry run: {} records would be current, {} archived", s.current, s.archived);
            } else {
                let reconciler = open_reconciler(&settings)?;
                run_pipeline(&reconciler, &settings, &tasks, options).await?;
            }
            Ok(())
        }
        Commands::Feed {
            file,
            site,
            url,
            force,
            archive_mode,
        } => {
            let xml = match &url {
                Some(u) => {
                    let opts = fetch::FeedFetchOptions::from_settings(&settings, force);
                    fetch::fetch_feed(u, &file, &opts).await?
                }
                None => std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
            };

            let reconciler = open_reconciler(&settings)?;
            let source = LiveSource::new(&settings, force);
            let pipeline = Pipeline::new(
                &reconciler,
                &source,
                &settings,
                upsert_options(&settings, archive_mode),
            );

            let provenance = url.unwrap_or_else(|| file.display().to_string());
            let mut report = TaskReport::new(&site, "feed");
            if let Err(e) = pipeline.ingest_feed(&site, &xml, &[], &provenance, &mut report) {
                report.error = Some(e);
            }
            finish_single(report)
        }
        Commands::Ingest {
            file,
            site,
            category,
            url,
            archive_mode,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let candidates: Vec<RawCandidate> = serde_json::from_str(&text)
                .with_context(|| format!("Invalid candidates file {}", file.display()))?;

            let reconciler = open_reconciler(&settings)?;
            let source = LiveSource::new(&settings, false);
            let pipeline = Pipeline::new(
                &reconciler,
                &source,
                &settings,
                upsert_options(&settings, archive_mode),
            );

            let mut report = TaskReport::new(&site, &category);
            let found = pipeline.candidate_observations(&candidates, &category, &url);
            report.skipped += candidates.len().saturating_sub(found.len());
            if let Err(e) = pipeline.persist(&site, found, &mut report) {
                report.error = Some(e);
            }
            finish_single(report)
        }
        Commands::View { json } => {
            let store = SqliteStore::open(&settings.db_path).context("Failed to open store")?;
            let records = store.current_records(&settings.taxonomy.allow_list())?;
            let view = aggregate::build_view(&records, &settings.taxonomy);

            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
                return Ok(());
            }
            if view.is_empty() {
                println!("No prices stored yet. Run 'run' or 'feed' first.");
                return Ok(());
            }
            print_view(&view);
            Ok(())
        }
        Commands::History {
            site,
            category,
            item,
            json,
        } => {
            let store = SqliteStore::open(&settings.db_path).context("Failed to open store")?;
            let key = RecordKey {
                site_name: site,
                category_name: category,
                item_key: title::normalize_key(&item),
            };
            let current = store.find_current(&key)?;
            let history = store.history(&key)?;

            if json {
                let out = serde_json::json!({ "current": current, "history": history });
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }

            let Some(current) = current else {
                println!("No record for key {:?}", key.item_key);
                return Ok(());
            };
            println!("{} [{}] {}", current.item_name, key.category_name, key.site_name);
            println!(
                "  now      {:>12} {}  (since {})",
                current.sell_price,
                current.currency,
                current.updated_at.format("%Y-%m-%d %H:%M")
            );
            for a in history.iter().rev() {
                println!(
                    "  archived {:>12} {}  ({})",
                    a.record.sell_price,
                    a.record.currency,
                    a.archived_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} archive entries", history.len());
            Ok(())
        }
        Commands::Stats => {
            let store = SqliteStore::open(&settings.db_path).context("Failed to open store")?;
            let s = store.stats()?;
            println!("Current:    {}", s.current);
            println!("Archived:   {}", s.archived);
            println!("Sites:      {}", s.sites);
            println!("Categories: {}", s.categories);
            Ok(())
        }
        Commands::Parse { text } => {
            let parsed = price::parse_price(&text);
            let value = parsed.value.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
            let canonical = parsed
                .value
                .and_then(price::canonical_pair)
                .map(|(s, _)| s)
                .unwrap_or_else(|| "-".into());
            println!("Value:       {}", value);
            println!("Currency:    {}", parsed.currency.unwrap_or("-"));
            println!("Canonical:   {}", canonical);
            if price::INSTALLMENT_RE.is_match(&text) {
                println!("Installment: yes (excluded from selection)");
            }
            println!("Display:     {}", title::sanitize_display(&text));
            println!("Key:         {}", title::normalize_key(&text));
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_reconciler(settings: &settings::Settings) -> anyhow::Result<Reconciler<SqliteStore>> {
    let store = SqliteStore::open(&settings.db_path)
        .with_context(|| format!("Failed to open store at {}", settings.db_path.display()))?;
    Ok(Reconciler::new(store))
}

async fn run_pipeline<S: PriceStore>(
    reconciler: &Reconciler<S>,
    settings: &settings::Settings,
    tasks: &[settings::TaskSpec],
    options: UpsertOptions,
) -> anyhow::Result<()> {
    let source = LiveSource::new(settings, false);
    let pipeline = Pipeline::new(reconciler, &source, settings, options);
    let reports = pipeline
        .run_tasks(tasks)
        .await
        .context("Store became unavailable, run aborted")?;
    pipeline::print_reports(&reports);
    Ok(())
}

fn upsert_options(settings: &settings::Settings, mode: Option<ArchiveMode>) -> UpsertOptions {
    UpsertOptions {
        archive_mode: mode.unwrap_or(settings.archive_mode),
    }
}

fn finish_single(mut report: TaskReport) -> anyhow::Result<()> {
    let fatal = report.is_fatal();
    let error = report.error.take();
    pipeline::print_reports(std::slice::from_ref(&report));
    match error {
        Some(e) if fatal => bail!(e),
        Some(e) => {
            println!("Error: {}", e);
            Ok(())
        }
        None => Ok(()),
    }
}

fn print_view(view: &[aggregate::GameView]) {
    for game in view {
        println!("\n== {} ==", game.label);
        for site in &game.sites {
            println!("\n  {}", site.label);
            println!("  {:<36} | {:>12} | {:>12}", "Item", "TR", "Global");
            println!("  {}", "-".repeat(66));
            for row in &site.rows {
                let cell = |c: &Option<aggregate::PriceCell>| {
                    c.as_ref().map(|c| c.sell_price.clone()).unwrap_or_else(|| "-".into())
                };
                println!(
                    "  {:<36} | {:>12} | {:>12}",
                    truncate(&row.name, 36),
                    cell(&row.tr),
                    cell(&row.global)
                );
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max - 3).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
