//! Pipeline Service - Builds downtime KPI fact tables from raw line logs
//!
//! Responsibilities:
//! - Read the four raw sources (productivity, downtime, products, factors)
//! - Inspect them for known defects without changing them
//! - Clean each source, reshape downtime to long form
//! - Build batch facts with downtime KPIs
//! - Persist `fact_batches` and `fact_downtime_long` (files, optionally Postgres)
//!
//! Same raw files + same config = same output, byte for byte.
//!
//! Usage:
//!   cargo run --bin pipeline -- run --raw-dir data_raw --out-dir data_processed
//!   cargo run --bin pipeline -- inspect --raw-dir data_raw
//!   cargo run --bin pipeline -- report --from 2024-01-01 --product P1

mod clean;
mod config;
mod error;
mod facts;
mod pipeline;
mod quality;
mod report;
mod reshape;
mod sink;
mod source;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::{DuplicatePolicy, OutputFormat, PipelineConfig};
use pipeline::{inspect_sources, PipelineOutput, RawSources};
use report::{build_report, load_facts, ReportFilter};
use sink::{FactSink, FileSink, PgSink};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "pipeline", about = "Builds downtime KPI fact tables from raw line logs")]
struct Args {
    /// Path to a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clean the raw sources and write the fact tables
    Run(RunArgs),
    /// Print the quality report of the raw sources as JSON
    Inspect(SourceArgs),
    /// Summarize persisted fact tables
    Report(ReportArgs),
}

#[derive(clap::Args, Debug)]
struct SourceArgs {
    /// Directory holding the raw source files
    #[arg(long)]
    raw_dir: Option<PathBuf>,

    /// Field delimiter of the raw files
    #[arg(long)]
    delimiter: Option<char>,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Directory for the fact tables
    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Duplicate product/factor keys: keep the first row or fail
    #[arg(long, value_enum)]
    on_duplicate_key: Option<DuplicatePolicy>,

    /// Duplicate productivity batch ids: keep the first row or fail
    #[arg(long, value_enum)]
    on_duplicate_batch: Option<DuplicatePolicy>,

    /// Postgres URL; falls back to DB_URL. Facts are also written there.
    #[arg(long)]
    db_url: Option<String>,

    /// Dry run - build everything, persist nothing
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(clap::Args, Debug)]
struct ReportArgs {
    /// Directory holding the fact tables
    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// First date included (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Last date included (YYYY-MM-DD)
    #[arg(long)]
    to: Option<NaiveDate>,

    #[arg(long)]
    product: Option<String>,

    #[arg(long)]
    operator: Option<String>,

    /// Number of downtime reasons in the Pareto
    #[arg(long, default_value = "12")]
    top: usize,

    /// Number of worst batches listed
    #[arg(long, default_value = "15")]
    worst: usize,

    /// Print JSON instead of text
    #[arg(long, default_value = "false")]
    json: bool,
}

fn apply_source_args(config: &mut PipelineConfig, args: &SourceArgs) {
    if let Some(dir) = &args.raw_dir {
        config.raw_dir = dir.clone();
    }
    if let Some(d) = args.delimiter {
        config.delimiter = d;
    }
}

fn print_output(output: &PipelineOutput) {
    let summary = &output.summary;
    println!("\nRows read:");
    for (name, rows) in &summary.rows_read {
        println!("  {:<20} {}", name, rows);
    }
    println!("Dropped rows:");
    for (stage, drops) in &summary.drops {
        if !drops.is_empty() {
            println!(
                "  {:<20} {:>5}  {}",
                stage,
                drops.total(),
                serde_json::to_string(drops).unwrap_or_default()
            );
        }
    }
    if !summary.unmatched_factors.is_empty() {
        println!("Factors without description: {:?}", summary.unmatched_factors);
    }

    for (i, b) in output.facts.batches.iter().take(3).enumerate() {
        println!(
            "  [{}] batch {} | {} | {} | {:.0} min, {:.0} down",
            i + 1,
            b.batch_id,
            b.date,
            b.product_code,
            b.duration_minutes,
            b.downtime_total_minutes
        );
    }
    if output.facts.batches.len() > 3 {
        println!("  ... and {} more", output.facts.batches.len() - 3);
    }
}

/// Build the facts and hand them to every configured sink.
async fn execute(
    config: &PipelineConfig,
    dry_run: bool,
    pg: Option<&PgSink>,
) -> error::Result<PipelineOutput> {
    let raw = RawSources::read(config).await?;
    let output = pipeline::run(&raw, config)?;

    if dry_run {
        println!("\nDry run - no fact tables written");
        return Ok(output);
    }

    let files = FileSink::new(&config.out_dir, config.output_format);
    files.persist(&output.facts, &output.summary).await?;
    println!("Wrote facts to {}", files.describe());

    if let Some(pg) = pg {
        pg.persist(&output.facts, &output.summary).await?;
        println!("Wrote facts to {}", pg.describe());
    }
    Ok(output)
}

async fn run_command(mut config: PipelineConfig, args: RunArgs) -> Result<()> {
    apply_source_args(&mut config, &args.source);
    if let Some(dir) = args.out_dir {
        config.out_dir = dir;
    }
    if let Some(format) = args.format {
        config.output_format = format;
    }
    if let Some(policy) = args.on_duplicate_key {
        config.dimension_duplicates = policy;
    }
    if let Some(policy) = args.on_duplicate_batch {
        config.batch_duplicates = policy;
    }
    config.validate()?;

    let dry_run = args.dry_run;
    let run_id = Uuid::new_v4();
    println!("=== Downtime Fact Pipeline ===");
    println!("Run ID: {}", run_id);
    println!("Raw dir: {}", config.raw_dir.display());
    println!("Mode: {}", if dry_run { "dry-run" } else { "live" });

    let db_url = args.db_url.or_else(|| std::env::var("DB_URL").ok());
    let pg = match (&db_url, dry_run) {
        (Some(url), false) => Some(
            PgSink::connect(url, run_id)
                .await
                .context("Failed to connect to database")?,
        ),
        _ => None,
    };

    let result = execute(&config, dry_run, pg.as_ref()).await;

    if let (Err(e), Some(pg)) = (&result, &pg) {
        if let Err(db_err) = pg.record_failure(&e.to_string()).await {
            log::warn!("could not record failed run: {}", db_err);
        }
    }

    let output = result.context("Pipeline run failed")?;
    print_output(&output);

    println!("\n=== Pipeline Complete ===");
    println!("Fact batches: {}", output.summary.fact_batches);
    println!("Downtime events: {}", output.summary.fact_events);
    Ok(())
}

async fn inspect_command(mut config: PipelineConfig, args: SourceArgs) -> Result<()> {
    apply_source_args(&mut config, &args);
    config.validate()?;
    let raw = RawSources::read(&config).await?;
    let reports = inspect_sources(&raw, &config)?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn report_command(mut config: PipelineConfig, args: ReportArgs) -> Result<()> {
    if let Some(dir) = args.out_dir {
        config.out_dir = dir;
    }
    if let Some(format) = args.format {
        config.output_format = format;
    }

    let (batches, events) = load_facts(&config.out_dir, config.output_format)
        .await
        .with_context(|| format!("Failed to read fact tables from {}", config.out_dir.display()))?;

    let filter = ReportFilter {
        from: args.from,
        to: args.to,
        product: args.product,
        operator: args.operator,
    };
    let report = build_report(&batches, &events, &filter, args.top, args.worst);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("pipeline", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = PipelineConfig::load(args.config.as_deref())
        .await
        .context("Failed to load configuration")?;

    match args.command {
        Command::Run(run) => run_command(config, run).await,
        Command::Inspect(source) => inspect_command(config, source).await,
        Command::Report(report) => report_command(config, report).await,
    }
}
