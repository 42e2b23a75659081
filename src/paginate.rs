//! Lazy, strictly sequential pagination over catalog and review pages.
//!
//! A paginator holds at most one page of records. `next()` hands out buffered
//! records and only fetches the following page once the buffer is drained, so a
//! caller that stops pulling never causes another fetch.

use std::collections::{HashSet, VecDeque};

use chrono::NaiveDateTime;
use tracing::debug;

use crate::dom::RenderedPage;
use crate::error::{CrawlError, CrawlResult};
use crate::extract::{parse_pagination, parse_product_summaries, parse_reviews, Pagination};
use crate::fetcher::{fetch_with_retry, PageFetcher, RetryPolicy, WaitCondition};
use crate::model::{ProductRef, Review};

/// What is being paginated: how to wait for, parse, and identify its records.
pub trait PageKind {
    type Record;

    fn wait(&self) -> &'static [WaitCondition];
    fn parse(&self, page: &RenderedPage) -> (Vec<Self::Record>, Pagination);
    fn key(record: &Self::Record) -> String;
    /// Records rejected here count as already seen.
    fn is_new(&self, _record: &Self::Record) -> bool {
        true
    }
}

pub struct CatalogPages;

impl PageKind for CatalogPages {
    type Record = ProductRef;

    fn wait(&self) -> &'static [WaitCondition] {
        &[WaitCondition::ProductGrid]
    }

    fn parse(&self, page: &RenderedPage) -> (Vec<ProductRef>, Pagination) {
        (parse_product_summaries(page), parse_pagination(page))
    }

    fn key(record: &ProductRef) -> String {
        record.id.clone()
    }
}

pub struct ReviewPages {
    pub product_id: String,
    /// Reviews posted at or before this are not new.
    pub since: Option<NaiveDateTime>,
}

impl PageKind for ReviewPages {
    type Record = Review;

    fn wait(&self) -> &'static [WaitCondition] {
        &[WaitCondition::ReviewsPopulated]
    }

    fn parse(&self, page: &RenderedPage) -> (Vec<Review>, Pagination) {
        (parse_reviews(page, &self.product_id), parse_pagination(page))
    }

    fn key(record: &Review) -> String {
        record.id.clone()
    }

    fn is_new(&self, record: &Review) -> bool {
        match (self.since, record.posted_at) {
            (Some(since), Some(posted)) => posted > since,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exhausted,
    NoNewRecords,
    PageCap,
}

enum State {
    Fetch(String),
    Done(StopReason),
}

pub struct Paginator<K: PageKind> {
    kind: K,
    state: State,
    /// First page already fetched by the caller (review lists live on the product page).
    seed_page: Option<RenderedPage>,
    buffer: VecDeque<K::Record>,
    seen: HashSet<String>,
    pages_fetched: u32,
    max_pages: u32,
    retry: RetryPolicy,
}

impl<K: PageKind> Paginator<K> {
    pub fn new(kind: K, seed_url: &str, max_pages: u32, retry: RetryPolicy) -> Self {
        Self {
            kind,
            state: State::Fetch(seed_url.to_string()),
            seed_page: None,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            pages_fetched: 0,
            max_pages,
            retry,
        }
    }

    /// Start from a page the caller has already fetched.
    pub fn from_page(kind: K, page: RenderedPage, max_pages: u32, retry: RetryPolicy) -> Self {
        let mut paginator = Self::new(kind, &page.url, max_pages, retry);
        paginator.seed_page = Some(page);
        paginator
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Why pagination ended, once it has.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            State::Done(reason) if self.buffer.is_empty() => Some(reason),
            _ => None,
        }
    }

    pub async fn next<F: PageFetcher + ?Sized>(&mut self, fetcher: &mut F) -> CrawlResult<Option<K::Record>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            let url = match &self.state {
                State::Done(_) => return Ok(None),
                State::Fetch(url) => url.clone(),
            };
            if self.pages_fetched >= self.max_pages {
                debug!(url, pages = self.pages_fetched, "Page cap reached");
                self.state = State::Done(StopReason::PageCap);
                return Ok(None);
            }

            let page = match self.seed_page.take() {
                Some(page) => page,
                None => match fetch_with_retry(fetcher, &url, self.kind.wait(), &self.retry).await {
                    Ok(page) => page,
                    Err(e) => {
                        // restartable only from the seed
                        self.state = State::Done(StopReason::Exhausted);
                        return Err(CrawlError::Fetch(e));
                    }
                },
            };
            self.pages_fetched += 1;
            self.load(page);
        }
    }

    fn load(&mut self, page: RenderedPage) {
        let (records, pagination) = self.kind.parse(&page);
        let total = records.len();
        for record in records {
            if self.kind.is_new(&record) && self.seen.insert(K::key(&record)) {
                self.buffer.push_back(record);
            }
        }
        debug!(url = %page.url, total, new = self.buffer.len(), has_next = pagination.has_next, "Page loaded");

        self.state = if self.buffer.is_empty() {
            State::Done(StopReason::NoNewRecords)
        } else {
            match pagination.next_url {
                Some(next) if pagination.has_next => State::Fetch(next),
                _ => State::Done(StopReason::Exhausted),
            }
        };
    }
}
