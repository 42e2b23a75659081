mod config;
mod db;
mod dom;
mod enricher;
mod error;
mod extract;
mod fetcher;
mod model;
mod paginate;
mod pipeline;
mod urls;
mod walker;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::config::Settings;
use crate::enricher::DetectLanguageClient;
use crate::fetcher::{Offline, SpiderFetcher};
use crate::pipeline::{Pipeline, RunSummary};

/// Review budget of the detection plan.
const MAX_PLAN_REVIEWS: usize = 500_000;

#[derive(Parser)]
#[command(name = "catalog_crawler", about = "E-commerce catalog crawler via spider.cloud")]
struct Cli {
    /// Config file (default: ./crawler.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Walk the category tree and scrape products and reviews
    Crawl {
        /// Category URLs to start from (default: home page departments)
        seeds: Vec<String>,
        /// Max categories to crawl
        #[arg(long)]
        max_categories: Option<usize>,
        /// Max products per category
        #[arg(short = 'n', long)]
        max_products: Option<usize>,
        /// Max reviews per product
        #[arg(long)]
        max_reviews: Option<usize>,
        /// Keep the site's default ordering instead of newest first
        #[arg(long)]
        sort_relevant: bool,
        /// Only fetch reviews newer than the ones stored
        #[arg(long)]
        incremental: bool,
    },
    /// Scrape one catalog listing
    Catalog {
        url: String,
        #[arg(short = 'n', long)]
        max_products: Option<usize>,
    },
    /// Scrape one product page
    Item {
        url: String,
        #[arg(long)]
        skip_reviews: bool,
    },
    /// Detect languages for stored reviews without one
    Enrich {
        #[arg(short = 'n', long, default_value_t = MAX_PLAN_REVIEWS)]
        limit: usize,
        /// Requests per minute allowed by the detection plan
        #[arg(long)]
        rpm: Option<u32>,
    },
    /// Show database statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect(&settings.database_path)?;
            db::init_schema(&conn)?;
            println!("Schema ready at {}", settings.database_path.display());
            Ok(())
        }
        Commands::Crawl {
            seeds,
            max_categories,
            max_products,
            max_reviews,
            sort_relevant,
            incremental,
        } => {
            if !seeds.is_empty() {
                settings.seeds = seeds;
            }
            if max_categories.is_some() {
                settings.limits.max_categories = max_categories;
            }
            if max_products.is_some() {
                settings.limits.max_products_per_category = max_products;
            }
            if max_reviews.is_some() {
                settings.limits.max_reviews_per_product = max_reviews;
            }
            settings.sort_newest &= !sort_relevant;
            settings.incremental_reviews |= incremental;

            let roots = settings.seeds.iter().map(|s| (None, s.clone())).collect();
            crawl(&settings, Job::Walk(roots)).await
        }
        Commands::Catalog { url, max_products } => {
            if max_products.is_some() {
                settings.limits.max_products_per_category = max_products;
            }
            crawl(&settings, Job::Catalog(url)).await
        }
        Commands::Item { url, skip_reviews } => crawl(&settings, Job::Item { url, skip_reviews }).await,
        Commands::Enrich { limit, rpm } => {
            if let Some(rpm) = rpm {
                settings.detect.requests_per_minute = rpm;
            }
            enrich(&settings, limit).await
        }
        Commands::Stats => {
            let conn = db::connect(&settings.database_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Categories:   {}", s.categories);
            println!("Products:     {}", s.products);
            println!("Price points: {}", s.price_points);
            println!("Reviews:      {}", s.reviews);
            println!("  enriched:   {}", s.enriched);
            println!("Skipped:      {}", s.skipped);
            if let Some(run) = s.last_run {
                println!("Last run:     {}", run);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current item");
            flag.store(true, Ordering::Relaxed);
        }
    });
    stop
}

fn spinner(prefix: &'static str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {prefix}: {pos} products | {wide_msg}")?,
    );
    pb.set_prefix(prefix);
    pb.enable_steady_tick(Duration::from_millis(200));
    Ok(pb)
}

fn detector(settings: &Settings) -> Option<DetectLanguageClient> {
    match DetectLanguageClient::new(&settings.detect) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("Language detection disabled: {}", e);
            None
        }
    }
}

enum Job {
    Walk(Vec<(Option<String>, String)>),
    Catalog(String),
    Item { url: String, skip_reviews: bool },
}

async fn crawl(settings: &Settings, job: Job) -> anyhow::Result<()> {
    let conn = db::connect(&settings.database_path)?;
    db::init_schema(&conn)?;
    let fetcher = SpiderFetcher::connect(&settings.fetch)?;
    let detector = detector(settings);

    let label = match &job {
        Job::Walk(_) => "Crawling",
        Job::Catalog(_) => "Catalog",
        Job::Item { .. } => "Item",
    };
    let mut pipeline = Pipeline::new(fetcher, detector.as_ref(), &conn, settings)
        .with_stop_flag(stop_on_ctrl_c())
        .with_progress(spinner(label)?);

    let outcome = match job {
        Job::Walk(roots) => pipeline.run(roots).await,
        Job::Catalog(url) => pipeline.crawl_category(&url).await,
        Job::Item { url, skip_reviews } => pipeline.crawl_item(&url, !skip_reviews).await,
    };

    print_summary(pipeline.summary());
    info!(renders = pipeline.fetcher().renders(), "Spider renders used");
    if let Some(client) = &detector {
        info!(calls = client.calls(), "Detection calls");
    }
    outcome.map_err(Into::into)
}

async fn enrich(settings: &Settings, limit: usize) -> anyhow::Result<()> {
    let conn = db::connect(&settings.database_path)?;
    db::init_schema(&conn)?;
    let client = DetectLanguageClient::new(&settings.detect).context("enrich needs a detection API key")?;

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} reviews (eta {eta})")?,
    );
    let mut pipeline = Pipeline::new(Offline, Some(&client), &conn, settings)
        .with_stop_flag(stop_on_ctrl_c())
        .with_progress(progress);
    let outcome = pipeline.backfill_languages(limit).await;

    print_summary(pipeline.summary());
    info!(calls = client.calls(), "Detection calls");
    outcome.map_err(Into::into)
}

fn print_summary(s: &RunSummary) {
    println!(
        "Saved {} categories, {} products, {} reviews ({} with language, {} without).",
        s.categories, s.products, s.reviews, s.enriched, s.unenriched
    );
    if s.interrupted {
        println!("Interrupted before completion.");
    }
    if !s.skips.is_empty() {
        println!("\n--- Skipped ({}) ---", s.skips.len());
        for skip in &s.skips {
            println!("  {:<10} {:<24} {}", skip.kind.as_str(), truncate(&skip.key, 24), skip.reason);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
