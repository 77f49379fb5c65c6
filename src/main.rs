mod acquirer;
mod config;
mod loader;
mod models;
mod normalizer;
mod pipeline;
mod publisher;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{AppConfig, ENV_TEMPLATE};
use crate::loader::date_from_filename;
use crate::models::BatchSummary;
use crate::normalizer::{Normalized, Normalizer};
use crate::pipeline::{Pipeline, RunOutcome};
use crate::publisher::FsPublisher;
use crate::storage::ParquetStore;

#[derive(Parser)]
#[command(name = "ibov-etl", about = "IBOVESPA daily composition ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Download, normalize and publish one trade date
    Run {
        /// Trade date (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Reuse an export already in the download dir
        #[arg(long)]
        skip_download: bool,

        /// Write Parquet locally without copying it to the bucket
        #[arg(long)]
        skip_upload: bool,
    },

    /// Normalize a raw export and print the summary and rejections
    Normalize {
        file: PathBuf,

        /// Trade date used when the export title carries none
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read a Parquet file back and show its first rows
    Inspect {
        file: PathBuf,

        #[arg(short = 'n', long, default_value_t = 10)]
        rows: usize,
    },

    /// List published objects in the bucket with their sidecar details
    Ls {
        /// Key prefix; defaults to the configured one
        prefix: Option<String>,
    },

    /// Write .env.template with every supported variable
    EnvTemplate {
        #[arg(short, long, default_value = ".env.template")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "ibov_etl=info,warn",
        1 => "ibov_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Command::Run {
            date,
            skip_download,
            skip_upload,
        } => {
            let mut config = AppConfig::load()?;
            config.pipeline.skip_download |= skip_download;
            config.pipeline.skip_upload |= skip_upload;

            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let pipeline = Pipeline::new(config).context("Failed to build pipeline")?;

            match pipeline
                .run(date)
                .await
                .with_context(|| format!("Pipeline failed for {date}"))?
            {
                RunOutcome::Published(stats) => {
                    print_summary(&stats.summary, stats.trade_date);
                    println!("  {}", stats.report);
                    match &stats.receipt.key {
                        Some(key) => println!("  Published : {key}"),
                        None => println!("  Staged    : {:?}", stats.receipt.local_path),
                    }
                }
                RunOutcome::NotATradingDay {
                    requested,
                    available,
                } => {
                    println!("{requested} is not a trading day; nothing published.");
                    if let Some(latest) = available {
                        println!("Latest available export: {latest}");
                    }
                }
            }
        }

        Command::Normalize { file, date, json } => {
            let config = AppConfig::load()?;
            let fallback = date
                .or_else(|| date_from_filename(&file))
                .unwrap_or_else(|| Local::now().date_naive());

            let Normalized { batch, report } = Normalizer::new(&config.normalizer)?
                .normalize_file(&file, fallback)
                .with_context(|| format!("Failed to normalize {:?}", file))?;

            if json {
                let out = serde_json::json!({
                    "summary": batch.summary(),
                    "report": report,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                print_summary(&batch.summary(), batch.trade_date());
                println!("  {report}");
            }
        }

        Command::Inspect { file, rows } => {
            let store = ParquetStore::open_in_memory()?;
            let total = store
                .count_rows(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let records = store.read_records(&file, Some(rows))?;

            println!("{:?}: {} rows", file, utils::fmt_number(total as u64));
            for r in &records {
                println!(
                    "  {:<7} {:<24} {:<8} {:>16} {:>10}%  {}",
                    r.code,
                    r.name,
                    r.share_class,
                    utils::fmt_number(r.theoretical_quantity),
                    r.index_weight_pct,
                    r.trade_date
                );
            }
        }

        Command::Ls { prefix } => {
            let config = AppConfig::load()?;
            let prefix = prefix.unwrap_or_else(|| config.storage.key_prefix.clone());
            let publisher = FsPublisher::new(&config.storage, true);
            let keys = publisher
                .list_objects(&prefix)
                .with_context(|| format!("Failed to list {:?}", config.storage.bucket_root))?;

            println!("{:?}: {} objects", config.storage.bucket_root, keys.len());
            for info in keys.iter().filter_map(|k| publisher.object_info(k)) {
                let (records, data_date) = match &info.metadata {
                    Some(m) => (utils::fmt_number(m.record_count as u64), m.data_date.to_string()),
                    None => ("-".into(), "-".into()),
                };
                println!(
                    "  {:<52} {:>12} B {:>6} rows  {}",
                    info.key,
                    utils::fmt_number(info.size),
                    records,
                    data_date
                );
            }
        }

        Command::EnvTemplate { output } => {
            std::fs::write(&output, ENV_TEMPLATE)
                .with_context(|| format!("Failed to write {:?}", output))?;
            info!("Wrote {:?}", output);
        }
    }

    Ok(())
}

fn print_summary(summary: &BatchSummary, date: NaiveDate) {
    println!("─────────────────────────────────");
    println!("  IBOV composition {date}");
    println!("─────────────────────────────────");
    println!("  Assets       : {}", summary.total_rows);
    println!("  Unique codes : {}", summary.distinct_codes);
    println!(
        "  Theoretical  : {}",
        utils::fmt_number(summary.total_theoretical_quantity)
    );
    println!("  Weight sum   : {}%", summary.total_weight_pct);
    println!("  Avg weight   : {}%", summary.average_weight_pct);
    println!("  Top holdings :");
    for h in &summary.top {
        println!("    {:<7} {:<24} {:>8}%", h.code, h.name, h.index_weight_pct);
    }
    println!("─────────────────────────────────");
}
