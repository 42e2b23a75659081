//! In-process fakes for the rendering session and the detection service, plus
//! markup builders for the site's page layouts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::dom::RenderedPage;
use crate::enricher::{validate_input, LanguageDetector};
use crate::error::{DetectionError, FetchError};
use crate::fetcher::{detect_block, unmet, PageFetcher, WaitCondition};
use crate::model::Detection;

/// Serves canned pages by URL and records every navigation.
#[derive(Default)]
pub struct ScriptedFetcher {
    pages: HashMap<String, String>,
    failures: HashMap<String, VecDeque<FetchError>>,
    fetched: Vec<String>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, html: impl Into<String>) -> Self {
        self.pages.insert(url.to_string(), html.into());
        self
    }

    /// Queue `times` failures for `url`, served before the page itself.
    pub fn fail_times(&mut self, url: &str, times: usize, error: impl Fn(&str) -> FetchError) {
        let queue = self.failures.entry(url.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error(url));
        }
    }

    pub fn fetched(&self) -> &[String] {
        &self.fetched
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetched.iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&mut self, url: &str, wait: &[WaitCondition]) -> Result<RenderedPage, FetchError> {
        self.fetched.push(url.to_string());
        if let Some(err) = self.failures.get_mut(url).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        let Some(html) = self.pages.get(url) else {
            return Err(FetchError::Transport {
                url: url.to_string(),
                reason: "HTTP 404".to_string(),
            });
        };
        let page = RenderedPage::new(url, html.clone());
        if let Some(marker) = detect_block(&page) {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                marker,
            });
        }
        match unmet(&page, wait) {
            Some(missing) => Err(FetchError::Timeout {
                url: url.to_string(),
                condition: missing.name(),
                waited_ms: 0,
            }),
            None => Ok(page),
        }
    }
}

/// Answers "en" for everything except texts containing "boom" (service error)
/// or "quota" (quota exceeded).
pub struct FakeDetector {
    pub min_chars: usize,
    calls: AtomicU64,
}

impl FakeDetector {
    pub fn new() -> Self {
        Self {
            min_chars: 3,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LanguageDetector for FakeDetector {
    async fn detect(&self, text: &str) -> Result<Detection, DetectionError> {
        let text = validate_input(text, self.min_chars, 100)?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        if text.contains("boom") {
            return Err(DetectionError::ServiceError("HTTP 500".to_string()));
        }
        if text.contains("quota") {
            return Err(DetectionError::QuotaExceeded {
                info: "usage limit reached".to_string(),
                retry_after: Some(std::time::Duration::ZERO),
            });
        }
        Ok(Detection {
            language_code: "en".to_string(),
            confidence: 99.0,
        })
    }
}

// ── Markup builders ──

pub const HEADER: &str = r#"<ul class="headerCate_itemBox">
  <li class="headerCate_item"><a href="/phones-c_1/" title="Phones">Phones</a></li>
</ul>"#;

/// Category page with sub-category links (none for a leaf) and an optional product grid.
pub fn category_page(name: &str, children: &[(&str, &str)], products: &[&str]) -> String {
    let aside = if children.is_empty() {
        String::new()
    } else {
        let items: String = children
            .iter()
            .map(|(name, href)| format!(r#"<div class="cateMain_asideItem"><a href="{}">{}</a></div>"#, href, name))
            .collect();
        format!(r#"<div class="cateMain_aside">{}</div>"#, items)
    };
    let grid = if products.is_empty() {
        String::new()
    } else {
        catalog_grid(products)
    };
    format!(
        r#"<html><body>{}<h1 class="cateMain_title">{}</h1>{}{}</body></html>"#,
        HEADER, name, aside, grid
    )
}

fn catalog_grid(products: &[&str]) -> String {
    let items: String = products
        .iter()
        .map(|href| format!(r#"<li class="gbGoodsItem"><a href="{}">item</a></li>"#, href))
        .collect();
    format!(r#"<ul class="js_seachResultList">{}</ul>"#, items)
}

/// One catalog page; `next` is the href of the next-page link.
pub fn catalog_page(products: &[&str], next: Option<&str>) -> String {
    let pager = match next {
        Some(href) => format!(r#"<div class="cateMain_pages"><a class="pageNext" href="{}">Next</a></div>"#, href),
        None => r#"<div class="cateMain_pages"><a class="pageNext disable">Next</a></div>"#.to_string(),
    };
    format!(
        r#"<html><body>{}<h1 class="cateMain_title">Phones</h1>{}{}</body></html>"#,
        HEADER,
        catalog_grid(products),
        pager
    )
}

/// Product detail page. `price: None` renders a sold-out label instead of a price.
pub fn product_page(title: &str, price: Option<&str>) -> String {
    let price = match price {
        Some(p) => format!(r#"<span class="goodsIntro_price">{}</span>"#, p),
        None => r#"<span class="goodsIntro_price">Sold out</span>"#.to_string(),
    };
    format!(
        r#"<html><body><div class="goodsIntro_infoWrap"><h1 class="goodsIntro_title">{}</h1>{}</div>
           <div class="goodsReviews_empty"></div></body></html>"#,
        title, price
    )
}

/// Product page with reviews `(site_id, author, text)` and an optional next review page.
pub fn product_page_with_reviews(title: &str, price: &str, reviews: &[(&str, &str, &str)], next: bool) -> String {
    let items: String = reviews
        .iter()
        .map(|(id, author, text)| {
            format!(
                r#"<li class="goodsReviews_item" data-review-id="{}">
                     <strong class="goodsReviews_itemUserName">{}</strong>
                     <div data-rating="5"></div>
                     <dl class="goodsReviews_itemCont"><dd>{}</dd></dl></li>"#,
                id, author, text
            )
        })
        .collect();
    let list = if items.is_empty() {
        r#"<div class="goodsReviews_empty"></div>"#.to_string()
    } else {
        format!(r#"<ul class="goodsReviews_list">{}</ul>"#, items)
    };
    let pager = if next {
        r#"<div class="goodsReviews_pageWrap"><div class="gbPaging"><a data-goto="next" href="javascript:;">Next</a></div></div>"#
    } else {
        r#"<div class="goodsReviews_pageWrap"><div class="gbPaging"><a data-goto="next" class="disabled">Next</a></div></div>"#
    };
    format!(
        r#"<html><body><div class="goodsIntro_infoWrap"><h1 class="goodsIntro_title">{}</h1>
           <span class="goodsIntro_price">{}</span></div>{}{}</body></html>"#,
        title, price, list, pager
    )
}
