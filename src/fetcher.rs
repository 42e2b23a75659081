use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::Selector;
use spider_client::shapes::request::{RequestType, ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, warn};

use crate::config::FetchSettings;
use crate::dom::{Document, RenderedPage};
use crate::error::FetchError;

/// Named readiness conditions for a rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitCondition {
    CategoryMenu,
    ProductGrid,
    ProductInfo,
    ReviewsPopulated,
}

static CATEGORY_MENU: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("ul.headerCate_itemBox, nav.headerNav, .cateMain_aside, .cateFilter_list").unwrap()
});
static PRODUCT_GRID: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        "ul.js_seachResultList, ul.brandList_content, .goodsList_grid, .cateMain_empty, .searchEmpty",
    )
    .unwrap()
});
static PRODUCT_INFO: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"h1.goodsIntro_title, meta[property="og:title"], [data-orgp]"#).unwrap()
});
static REVIEWS_POPULATED: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("li.goodsReviews_item, .reviewList .reviewItem, .goodsReviews_empty, .goodsReviews_noData")
        .unwrap()
});

impl WaitCondition {
    pub fn name(self) -> &'static str {
        match self {
            WaitCondition::CategoryMenu => "category menu",
            WaitCondition::ProductGrid => "product grid",
            WaitCondition::ProductInfo => "product info",
            WaitCondition::ReviewsPopulated => "reviews populated",
        }
    }

    fn selector(self) -> &'static Selector {
        match self {
            WaitCondition::CategoryMenu => &CATEGORY_MENU,
            WaitCondition::ProductGrid => &PRODUCT_GRID,
            WaitCondition::ProductInfo => &PRODUCT_INFO,
            WaitCondition::ReviewsPopulated => &REVIEWS_POPULATED,
        }
    }
}

/// First condition in `wait` the page does not satisfy yet.
pub fn unmet(page: &RenderedPage, wait: &[WaitCondition]) -> Option<WaitCondition> {
    if wait.is_empty() {
        return None;
    }
    let doc = Document::parse(&page.html);
    let scope = doc.scope();
    wait.iter().copied().find(|c| !scope.matches(c.selector()))
}

static BLOCK_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<title>[^<]*(access denied|attention required|captcha|are you a robot|unusual traffic)")
        .unwrap()
});
static BLOCK_MARKERS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#challenge-form, .g-recaptcha, #px-captcha, #distil_ident_block").unwrap());

/// Marker of an access-denial page, if this is one.
pub fn detect_block(page: &RenderedPage) -> Option<String> {
    if let Some(status @ (403 | 451)) = page.status {
        return Some(format!("HTTP {}", status));
    }
    if let Some(caps) = BLOCK_TITLE_RE.captures(&page.html) {
        return Some(caps[1].to_lowercase());
    }
    let doc = Document::parse(&page.html);
    doc.scope()
        .select(&BLOCK_MARKERS)
        .next()
        .map(|el| format!("<{}> challenge element", el.value().name()))
}

/// One rendering session. `&mut self` keeps a single navigation in flight.
#[async_trait]
pub trait PageFetcher: Send {
    async fn fetch(&mut self, url: &str, wait: &[WaitCondition]) -> Result<RenderedPage, FetchError>;
}

/// Headless-browser rendering through spider.cloud.
pub struct SpiderFetcher {
    spider: Spider,
    wait_timeout: Duration,
    poll_interval: Duration,
    renders: u64,
}

impl SpiderFetcher {
    pub fn connect(settings: &FetchSettings) -> Result<Self> {
        let api_key = match &settings.spider_api_key {
            Some(key) => key.clone(),
            None => std::env::var("SPIDER_API_KEY")
                .map_err(|_| anyhow!("SPIDER_API_KEY environment variable must be set"))?,
        };
        let spider = Spider::new(Some(api_key))
            .map_err(|e| anyhow!("Failed to create Spider client: {}", e))?;
        Ok(Self {
            spider,
            wait_timeout: Duration::from_secs(settings.wait_timeout_secs),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            renders: 0,
        })
    }

    pub fn renders(&self) -> u64 {
        self.renders
    }

    async fn render(&mut self, url: &str) -> Result<RenderedPage, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            request: Some(RequestType::Chrome),
            ..Default::default()
        };
        let transport = |reason: String| FetchError::Transport {
            url: url.to_string(),
            reason,
        };

        let start = Instant::now();
        self.renders += 1;
        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| transport(e.to_string()))?;

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());

        let status = first
            .and_then(|obj| obj.get("status"))
            .and_then(|s| s.as_u64())
            .map(|s| s as u16);
        if let Some(code @ (429 | 500..=599)) = status {
            return Err(transport(format!("renderer returned HTTP {}", code)));
        }

        let html = first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| transport("no content in renderer response".to_string()))?;

        debug!(url, status, latency_ms = start.elapsed().as_millis() as u64, "Rendered");
        Ok(RenderedPage {
            url: url.to_string(),
            html: html.to_string(),
            status,
        })
    }
}

#[async_trait]
impl PageFetcher for SpiderFetcher {
    async fn fetch(&mut self, url: &str, wait: &[WaitCondition]) -> Result<RenderedPage, FetchError> {
        let start = Instant::now();
        loop {
            let page = self.render(url).await?;
            if let Some(marker) = detect_block(&page) {
                return Err(FetchError::Blocked {
                    url: url.to_string(),
                    marker,
                });
            }
            let Some(missing) = unmet(&page, wait) else {
                return Ok(page);
            };

            let waited = start.elapsed();
            if waited + self.poll_interval > self.wait_timeout {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    condition: missing.name(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            debug!(url, condition = missing.name(), "Not ready, polling again");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// For commands that work on stored data only; every fetch fails.
pub struct Offline;

#[async_trait]
impl PageFetcher for Offline {
    async fn fetch(&mut self, url: &str, _wait: &[WaitCondition]) -> Result<RenderedPage, FetchError> {
        Err(FetchError::Transport {
            url: url.to_string(),
            reason: "no rendering session".to_string(),
        })
    }
}

/// Bounded exponential backoff for transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &FetchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }
}

/// Fetch, retrying only transport errors. Timeouts and blocks are returned as-is.
pub async fn fetch_with_retry<F: PageFetcher + ?Sized>(
    fetcher: &mut F,
    url: &str,
    wait: &[WaitCondition],
    policy: &RetryPolicy,
) -> Result<RenderedPage, FetchError> {
    let mut attempt = 0;
    loop {
        match fetcher.fetch(url, wait).await {
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "Transport error on {} (attempt {}/{}), backing off {:.1}s: {}",
                    url,
                    attempt + 1,
                    policy.max_attempts,
                    backoff.as_secs_f64(),
                    e
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedFetcher;

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn wait_conditions() {
        let page = RenderedPage::new("u", r#"<ul class="js_seachResultList"></ul>"#);
        assert_eq!(unmet(&page, &[WaitCondition::ProductGrid]), None);
        assert_eq!(
            unmet(&page, &[WaitCondition::ProductGrid, WaitCondition::ProductInfo]),
            Some(WaitCondition::ProductInfo)
        );
        assert_eq!(unmet(&page, &[]), None);

        let empty = RenderedPage::new("u", r#"<div class="goodsReviews_empty">No reviews</div>"#);
        assert_eq!(unmet(&empty, &[WaitCondition::ReviewsPopulated]), None);
    }

    #[test]
    fn block_markers() {
        let denied = RenderedPage::new("u", "<html><head><title>Access Denied</title></head></html>");
        assert_eq!(detect_block(&denied).as_deref(), Some("access denied"));

        let mut forbidden = RenderedPage::new("u", "<p>hi</p>");
        forbidden.status = Some(403);
        assert_eq!(detect_block(&forbidden).as_deref(), Some("HTTP 403"));

        let captcha = RenderedPage::new("u", r#"<form id="challenge-form"></form>"#);
        assert!(detect_block(&captcha).is_some());

        let fine = RenderedPage::new("u", "<title>Cell Phones | Shop</title>");
        assert_eq!(detect_block(&fine), None);
    }

    #[tokio::test]
    async fn retries_transport_errors_up_to_the_cap() {
        let mut fetcher = ScriptedFetcher::new().page("https://x/a", "<p>a</p>");
        fetcher.fail_times("https://x/a", 2, |url| FetchError::Transport {
            url: url.into(),
            reason: "502".into(),
        });
        let page = fetch_with_retry(&mut fetcher, "https://x/a", &[], &no_wait()).await.unwrap();
        assert_eq!(page.html, "<p>a</p>");
        assert_eq!(fetcher.fetched().len(), 3);

        fetcher.fail_times("https://x/a", 3, |url| FetchError::Transport {
            url: url.into(),
            reason: "502".into(),
        });
        let err = fetch_with_retry(&mut fetcher, "https://x/a", &[], &no_wait()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fetcher.fetched().len(), 6);
    }

    #[tokio::test]
    async fn timeouts_are_not_retried() {
        let mut fetcher = ScriptedFetcher::new().page("https://x/a", "<p>not a grid</p>");
        let err = fetch_with_retry(&mut fetcher, "https://x/a", &[WaitCondition::ProductGrid], &no_wait())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { condition: "product grid", .. }));
        assert_eq!(fetcher.fetched().len(), 1);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
    }
}
