use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "crawler.toml";

/// Run settings. Layered: defaults, then `crawler.toml` (or `--config`), then
/// `CRAWLER_*` environment variables (`CRAWLER_DETECT__API_KEY`, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub site_url: String,
    /// Category URLs to walk instead of the home page's departments.
    pub seeds: Vec<String>,
    pub excluded_departments: Vec<String>,
    /// Crawl catalogs in "new arrivals" order when the page offers it.
    pub sort_newest: bool,
    /// Only fetch reviews newer than the latest one already stored per product.
    pub incremental_reviews: bool,
    pub max_depth: Option<u32>,
    pub limits: Limits,
    pub fetch: FetchSettings,
    pub detect: DetectSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_categories: Option<usize>,
    pub max_products_per_category: Option<usize>,
    pub max_reviews_per_product: Option<usize>,
    pub max_catalog_pages: u32,
    pub max_review_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Falls back to `SPIDER_API_KEY`.
    pub spider_api_key: Option<String>,
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub requests_per_minute: u32,
    pub min_chars: usize,
    pub max_chars: usize,
    pub quota_cooldown_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/catalog.sqlite"),
            site_url: "https://www.gearbest.com/".to_string(),
            seeds: Vec::new(),
            excluded_departments: vec!["Fashion".to_string(), "Top Brands".to_string()],
            sort_newest: true,
            incremental_reviews: false,
            max_depth: None,
            limits: Limits::default(),
            fetch: FetchSettings::default(),
            detect: DetectSettings::default(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_categories: None,
            max_products_per_category: Some(50),
            max_reviews_per_product: None,
            max_catalog_pages: 100,
            max_review_pages: 10,
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            spider_api_key: None,
            wait_timeout_secs: 30,
            poll_interval_ms: 2000,
            max_attempts: 3,
            base_backoff_ms: 2000,
        }
    }
}

impl Default for DetectSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "http://api.languagelayer.com/detect".to_string(),
            requests_per_minute: 60,
            min_chars: 3,
            max_chars: 100,
            quota_cooldown_secs: 60,
        }
    }
}

impl Settings {
    /// Load settings. An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("CRAWLER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("seeds")
                    .with_list_parse_key("excluded_departments")
                    .try_parsing(true),
            )
            .build()
            .context("reading configuration")?;
        settings
            .try_deserialize()
            .context("invalid configuration")
    }
}
