use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::db::{self, RunTotals};
use crate::dom::RenderedPage;
use crate::enricher::LanguageDetector;
use crate::error::{CrawlError, CrawlResult, DetectionError};
use crate::extract::{
    parse_breadcrumbs, parse_category_name, parse_departments, parse_product_detail, parse_review_sort_newest_url,
    parse_sort_newest_url,
};
use crate::fetcher::{fetch_with_retry, PageFetcher, RetryPolicy, WaitCondition};
use crate::model::{CategoryNode, CategoryPath, Detection, Review};
use crate::paginate::{CatalogPages, Paginator, ReviewPages};
use crate::urls;
use crate::walker::CategoryWalker;

const UNCATEGORIZED_ID: &str = "uncategorized";

/// The product page doubles as the first review page.
const PRODUCT_WITH_REVIEWS: &[WaitCondition] = &[WaitCondition::ProductInfo, WaitCondition::ReviewsPopulated];
const PRODUCT_ONLY: &[WaitCondition] = &[WaitCondition::ProductInfo];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipKind {
    Category,
    Product,
    Reviews,
    Enrichment,
}

impl SkipKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipKind::Category => "category",
            SkipKind::Product => "product",
            SkipKind::Reviews => "reviews",
            SkipKind::Enrichment => "enrichment",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Skip {
    pub kind: SkipKind,
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub run_id: Option<i64>,
    pub categories: usize,
    pub products: usize,
    pub reviews: usize,
    pub enriched: usize,
    pub unenriched: usize,
    pub skips: Vec<Skip>,
    pub interrupted: bool,
}

impl RunSummary {
    fn totals(&self) -> RunTotals {
        RunTotals {
            categories: self.categories,
            products: self.products,
            reviews: self.reviews,
            enriched: self.enriched,
            skipped: self.skips.len(),
        }
    }
}

/// Walker → paginators → extractors → enricher → sink, one item at a time.
///
/// The pipeline owns the rendering session for the whole run; walker and
/// paginators borrow it for each pull.
pub struct Pipeline<'a, F: PageFetcher, D: LanguageDetector> {
    fetcher: F,
    detector: Option<&'a D>,
    conn: &'a Connection,
    settings: &'a Settings,
    retry: RetryPolicy,
    stop: Arc<AtomicBool>,
    progress: ProgressBar,
    /// Set once quota is still exhausted after a cooldown.
    detection_suspended: bool,
    summary: RunSummary,
}

impl<'a, F: PageFetcher, D: LanguageDetector> Pipeline<'a, F, D> {
    pub fn new(fetcher: F, detector: Option<&'a D>, conn: &'a Connection, settings: &'a Settings) -> Self {
        Self {
            fetcher,
            detector,
            conn,
            settings,
            retry: RetryPolicy::from_settings(&settings.fetch),
            stop: Arc::new(AtomicBool::new(false)),
            progress: ProgressBar::hidden(),
            detection_suspended: false,
            summary: RunSummary::default(),
        }
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    fn stopped(&mut self) -> bool {
        let stopped = self.stop.load(Ordering::Relaxed);
        if stopped && !self.summary.interrupted {
            warn!("Stop requested, finishing after the current item");
            self.summary.interrupted = true;
        }
        stopped
    }

    // ── Entry points ──

    /// Walk from `roots`, or from the home page's departments when empty.
    pub async fn run(&mut self, roots: Vec<(Option<String>, String)>) -> CrawlResult<()> {
        self.start("crawl")?;
        let result = self.run_inner(roots).await;
        self.finish(result)
    }

    /// One catalog listing, without descending into sub-categories.
    pub async fn crawl_category(&mut self, url: &str) -> CrawlResult<()> {
        self.start("catalog")?;
        let result = self.category_inner(url).await;
        self.finish(result)
    }

    /// One product page, filed under its breadcrumb categories.
    pub async fn crawl_item(&mut self, url: &str, with_reviews: bool) -> CrawlResult<()> {
        self.start("item")?;
        let result = self.item_inner(url, with_reviews).await;
        self.finish(result)
    }

    /// Detect languages for stored reviews that have none yet.
    pub async fn backfill_languages(&mut self, limit: usize) -> CrawlResult<()> {
        self.start("enrich")?;
        let result = self.backfill_inner(limit).await;
        self.finish(result)
    }

    fn start(&mut self, command: &str) -> CrawlResult<()> {
        self.summary = RunSummary {
            run_id: Some(db::start_run(self.conn, command)?),
            ..Default::default()
        };
        info!(command, run_id = ?self.summary.run_id, "Run started");
        Ok(())
    }

    fn finish(&mut self, result: CrawlResult<()>) -> CrawlResult<()> {
        self.progress.finish_and_clear();
        let recorded = match self.summary.run_id {
            Some(run_id) => db::finish_run(self.conn, run_id, &self.summary.totals()),
            None => Ok(()),
        };
        if let Err(e) = &result {
            error!("Run aborted: {}", e);
        }
        result?;
        recorded?;
        Ok(())
    }

    // ── Crawl ──

    async fn run_inner(&mut self, roots: Vec<(Option<String>, String)>) -> CrawlResult<()> {
        let roots = if roots.is_empty() {
            self.departments().await?
        } else {
            roots
        };
        info!(roots = roots.len(), "Walking categories");

        let mut walker = CategoryWalker::new(roots, self.settings.max_depth, self.retry.clone());
        loop {
            if self.stopped() {
                break;
            }
            if let Some(max) = self.settings.limits.max_categories {
                if self.summary.categories >= max {
                    info!(max, "Category cap reached");
                    break;
                }
            }
            let (path, page) = match walker.next(&mut self.fetcher).await {
                Ok(Some(visit)) => visit,
                Ok(None) => break,
                Err(e) => {
                    let key = e.url().unwrap_or("?").to_string();
                    self.isolate(SkipKind::Category, &key, e)?;
                    continue;
                }
            };
            if let Err(e) = self.crawl_path(&path, page).await {
                let key = path.leaf().id.clone();
                self.isolate(SkipKind::Category, &key, e)?;
            }
        }
        info!(visited = walker.visited(), "Category walk finished");
        Ok(())
    }

    async fn departments(&mut self) -> CrawlResult<Vec<(Option<String>, String)>> {
        let home = self.settings.site_url.clone();
        let page = fetch_with_retry(&mut self.fetcher, &home, &[WaitCondition::CategoryMenu], &self.retry).await?;
        let departments = parse_departments(&page, &self.settings.excluded_departments);
        if departments.is_empty() {
            warn!(url = %home, "No departments found on the home page");
        }
        Ok(departments
            .into_iter()
            .map(|d| (Some(d.name), d.url))
            .collect())
    }

    async fn crawl_path(&mut self, path: &CategoryPath, page: RenderedPage) -> CrawlResult<()> {
        for node in &path.nodes {
            db::upsert_category(self.conn, node)?;
        }
        self.summary.categories += 1;
        let leaf = path.leaf();
        self.progress.set_message(path.names());
        self.crawl_catalog(&leaf.id, page).await
    }

    async fn category_inner(&mut self, url: &str) -> CrawlResult<()> {
        let page = fetch_with_retry(&mut self.fetcher, url, &[WaitCondition::CategoryMenu], &self.retry).await?;
        let name = parse_category_name(&page).map_err(|e| CrawlError::extraction(url, e))?;
        let node = CategoryNode {
            id: urls::natural_id(url),
            name,
            url: url.to_string(),
            parent_id: None,
            depth: 0,
        };
        db::upsert_category(self.conn, &node)?;
        self.summary.categories += 1;
        self.progress.set_message(node.name.clone());
        self.crawl_catalog(&node.id, page).await
    }

    /// Products of one category, starting from its already rendered first page.
    async fn crawl_catalog(&mut self, category_id: &str, first: RenderedPage) -> CrawlResult<()> {
        let settings = self.settings;
        let limits = &settings.limits;
        let cap = limits.max_products_per_category;
        let sorted = if settings.sort_newest {
            parse_sort_newest_url(&first).filter(|u| *u != first.url)
        } else {
            None
        };
        let mut pages = match sorted {
            Some(url) => {
                debug!(url = %url, "Catalog sorted by newest");
                Paginator::new(CatalogPages, &url, limits.max_catalog_pages, self.retry.clone())
            }
            None => Paginator::from_page(CatalogPages, first, limits.max_catalog_pages, self.retry.clone()),
        };

        let mut stored = 0usize;
        loop {
            if self.stopped() {
                break;
            }
            if cap.is_some_and(|max| stored >= max) {
                debug!(category_id, stored, "Product cap reached");
                break;
            }
            let product = match pages.next(&mut self.fetcher).await {
                Ok(Some(product)) => product,
                Ok(None) => break,
                Err(e) => {
                    self.isolate(SkipKind::Category, category_id, e)?;
                    break;
                }
            };
            match self.crawl_product(category_id, &product.url).await {
                Ok(()) => stored += 1,
                Err(e) => self.isolate(SkipKind::Product, &product.id, e)?,
            }
        }
        info!(
            category_id,
            stored,
            pages = pages.pages_fetched(),
            stop = ?pages.stop_reason(),
            "Catalog done"
        );
        Ok(())
    }

    async fn crawl_product(&mut self, category_id: &str, url: &str) -> CrawlResult<()> {
        let page = fetch_with_retry(&mut self.fetcher, url, PRODUCT_WITH_REVIEWS, &self.retry).await?;
        self.store_product(category_id, page, true).await
    }

    async fn item_inner(&mut self, url: &str, with_reviews: bool) -> CrawlResult<()> {
        let wait = if with_reviews { PRODUCT_WITH_REVIEWS } else { PRODUCT_ONLY };
        let page = fetch_with_retry(&mut self.fetcher, url, wait, &self.retry).await?;
        let mut nodes = parse_breadcrumbs(&page);
        if nodes.is_empty() {
            warn!(url, "No breadcrumb categories, filing under '{}'", UNCATEGORIZED_ID);
            nodes.push(CategoryNode {
                id: UNCATEGORIZED_ID.to_string(),
                name: "Uncategorized".to_string(),
                url: self.settings.site_url.clone(),
                parent_id: None,
                depth: 0,
            });
        }
        for node in &nodes {
            db::upsert_category(self.conn, node)?;
        }
        self.summary.categories += nodes.len();
        let category_id = nodes[nodes.len() - 1].id.clone();

        if let Err(e) = self.store_product(&category_id, page, with_reviews).await {
            let key = urls::natural_id(url);
            self.isolate(SkipKind::Product, &key, e)?;
        }
        Ok(())
    }

    async fn store_product(&mut self, category_id: &str, page: RenderedPage, with_reviews: bool) -> CrawlResult<()> {
        let product = parse_product_detail(&page, category_id).map_err(|e| CrawlError::extraction(&page.url, e))?;
        db::upsert_product(self.conn, &product)?;
        self.summary.products += 1;
        self.progress.inc(1);
        info!(
            id = %product.id,
            price = %product.price,
            currency = %product.currency_code,
            "{}",
            product.title
        );

        if with_reviews {
            self.crawl_reviews(&product.id, page).await?;
        }
        Ok(())
    }

    /// Reviews listed on the product page and its follow-up review pages.
    ///
    /// An incremental crawl only stops at already stored reviews when the list
    /// is ordered most recent first; without that ordering it reads every page.
    async fn crawl_reviews(&mut self, product_id: &str, first: RenderedPage) -> CrawlResult<()> {
        let since = if self.settings.incremental_reviews {
            db::latest_review_at(self.conn, product_id)?
        } else {
            None
        };
        let newest_first = since.and_then(|_| parse_review_sort_newest_url(&first));
        if since.is_some() && newest_first.is_none() {
            debug!(product_id, "No most-recent review ordering, reading all review pages");
        }
        let since = since.filter(|_| newest_first.is_some());
        let kind = ReviewPages {
            product_id: product_id.to_string(),
            since,
        };
        let cap = self.settings.limits.max_reviews_per_product;
        let max_pages = self.settings.limits.max_review_pages;
        let mut reviews = match newest_first {
            Some(url) if url != first.url => {
                debug!(url = %url, "Reviews sorted by most recent");
                Paginator::new(kind, &url, max_pages, self.retry.clone())
            }
            _ => Paginator::from_page(kind, first, max_pages, self.retry.clone()),
        };

        let mut stored = 0usize;
        loop {
            if self.stopped() || cap.is_some_and(|max| stored >= max) {
                break;
            }
            let mut review = match reviews.next(&mut self.fetcher).await {
                Ok(Some(review)) => review,
                Ok(None) => break,
                Err(e) => {
                    self.isolate(SkipKind::Reviews, product_id, e)?;
                    break;
                }
            };
            self.enrich(&mut review).await?;
            db::upsert_review(self.conn, &review)?;
            stored += 1;
            self.summary.reviews += 1;
        }
        debug!(product_id, stored, pages = reviews.pages_fetched(), "Reviews done");
        Ok(())
    }

    // ── Enrichment ──

    async fn enrich(&mut self, review: &mut Review) -> CrawlResult<()> {
        if let Some(detection) = self.detect(&review.id, &review.text).await? {
            review.apply_detection(detection);
        }
        if review.is_enriched() {
            self.summary.enriched += 1;
        } else {
            self.summary.unenriched += 1;
        }
        Ok(())
    }

    /// Language of one review text. Failures leave the review unenriched and
    /// never stop it from being stored.
    async fn detect(&mut self, review_id: &str, text: &str) -> CrawlResult<Option<Detection>> {
        let Some(detector) = self.detector else {
            return Ok(None);
        };
        if self.detection_suspended {
            return Ok(None);
        }

        let err = match detector.detect(text).await {
            Ok(detection) => return Ok(Some(detection)),
            Err(DetectionError::InputInvalid { chars }) => {
                debug!(review_id, chars, "Too short to detect");
                return Ok(None);
            }
            Err(e) => e,
        };

        let err = match err {
            DetectionError::QuotaExceeded { info, retry_after } => {
                let wait = retry_after.unwrap_or(Duration::from_secs(self.settings.detect.quota_cooldown_secs));
                warn!(
                    "Detection quota exceeded ({}), cooling down {:.1}s",
                    info,
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
                match detector.detect(text).await {
                    Ok(detection) => return Ok(Some(detection)),
                    Err(e @ DetectionError::QuotaExceeded { .. }) => {
                        error!("Detection quota still exhausted, storing remaining reviews without language");
                        self.detection_suspended = true;
                        e
                    }
                    Err(e) => e,
                }
            }
            other => other,
        };

        warn!(review_id, "Language detection failed: {}", err);
        self.skip(SkipKind::Enrichment, review_id, err.to_string())?;
        Ok(None)
    }

    async fn backfill_inner(&mut self, limit: usize) -> CrawlResult<()> {
        if self.detector.is_none() {
            warn!("No language detector configured, nothing to do");
            return Ok(());
        }
        let backlog = db::fetch_unenriched(self.conn, limit)?;
        info!(reviews = backlog.len(), limit, "Enriching stored reviews");
        self.progress.set_length(backlog.len() as u64);

        for review in backlog {
            if self.stopped() || self.detection_suspended {
                break;
            }
            match self.detect(&review.id, &review.text).await? {
                Some(detection) => {
                    db::set_review_language(self.conn, &review.id, &detection)?;
                    self.summary.enriched += 1;
                }
                None => self.summary.unenriched += 1,
            }
            self.progress.inc(1);
        }
        Ok(())
    }

    // ── Failure isolation ──

    /// Record a non-fatal failure and carry on; fatal ones end the run.
    fn isolate(&mut self, kind: SkipKind, key: &str, err: CrawlError) -> CrawlResult<()> {
        if err.is_fatal() {
            return Err(err);
        }
        warn!(kind = kind.as_str(), key, "Skipping: {}", err);
        self.skip(kind, key, err.to_string())
    }

    fn skip(&mut self, kind: SkipKind, key: &str, reason: String) -> CrawlResult<()> {
        db::record_skip(self.conn, self.summary.run_id, kind.as_str(), key, &reason)?;
        self.summary.skips.push(Skip {
            kind,
            key: key.to_string(),
            reason,
        });
        Ok(())
    }
}
