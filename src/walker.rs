use std::collections::HashSet;

use tracing::{debug, info};

use crate::dom::RenderedPage;
use crate::error::{CrawlError, CrawlResult};
use crate::extract::{parse_category_links, parse_category_name, parse_product_summaries};
use crate::fetcher::{fetch_with_retry, PageFetcher, RetryPolicy, WaitCondition};
use crate::model::{CategoryNode, CategoryPath};
use crate::urls;

struct Frame {
    url: String,
    /// Link text the category was reached by; seeds have none.
    name: Option<String>,
    ancestors: Vec<CategoryNode>,
}

/// Pre-order depth-first walk over the category tree, one leaf per `next()`.
///
/// A category is yielded when it has no unvisited child links, when it lists
/// products directly, or when it sits at the depth limit.
pub struct CategoryWalker {
    stack: Vec<Frame>,
    visited: HashSet<String>,
    max_depth: Option<u32>,
    retry: RetryPolicy,
}

impl CategoryWalker {
    /// `roots` are `(name, url)` pairs, walked in the given order.
    pub fn new(roots: Vec<(Option<String>, String)>, max_depth: Option<u32>, retry: RetryPolicy) -> Self {
        let stack = roots
            .into_iter()
            .rev()
            .map(|(name, url)| Frame {
                url,
                name,
                ancestors: Vec::new(),
            })
            .collect();
        Self {
            stack,
            visited: HashSet::new(),
            max_depth,
            retry,
        }
    }

    pub fn visited(&self) -> usize {
        self.visited.len()
    }

    /// Next category path together with its rendered page, or `None` once
    /// nothing unvisited is reachable. After an error the failed category is
    /// dropped and `next()` may be called again.
    pub async fn next<F: PageFetcher + ?Sized>(
        &mut self,
        fetcher: &mut F,
    ) -> CrawlResult<Option<(CategoryPath, RenderedPage)>> {
        while let Some(frame) = self.stack.pop() {
            if !self.visited.insert(urls::normalize_path(&frame.url)) {
                debug!(url = %frame.url, "Already visited");
                continue;
            }

            let page = fetch_with_retry(fetcher, &frame.url, &[WaitCondition::CategoryMenu], &self.retry).await?;

            let name = match frame.name {
                Some(name) => name,
                None => parse_category_name(&page).map_err(|e| CrawlError::extraction(&frame.url, e))?,
            };
            let depth = frame.ancestors.len() as u32;
            let node = CategoryNode {
                id: urls::natural_id(&frame.url),
                name,
                url: frame.url.clone(),
                parent_id: frame.ancestors.last().map(|n| n.id.clone()),
                depth,
            };
            let mut nodes = frame.ancestors;
            nodes.push(node);

            let at_limit = self.max_depth.is_some_and(|max| depth >= max);
            let children: Vec<_> = if at_limit {
                Vec::new()
            } else {
                parse_category_links(&page)
                    .into_iter()
                    .filter(|link| !self.visited.contains(&urls::normalize_path(&link.url)))
                    .collect()
            };
            let lists_products = !parse_product_summaries(&page).is_empty();

            for link in children.iter().rev() {
                self.stack.push(Frame {
                    url: link.url.clone(),
                    name: Some(link.name.clone()),
                    ancestors: nodes.clone(),
                });
            }

            if children.is_empty() || lists_products || at_limit {
                let path = CategoryPath { nodes };
                info!(path = %path.names(), children = children.len(), "Category");
                return Ok(Some((path, page)));
            }
            debug!(url = %frame.url, children = children.len(), "Descending");
        }
        Ok(None)
    }
}
