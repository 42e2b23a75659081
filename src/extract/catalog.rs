use std::collections::HashSet;
use std::sync::LazyLock;

use tracing::debug;

use super::rules::{LinkRule, LinkRules};
use crate::dom::{Document, RenderedPage};
use crate::model::ProductRef;
use crate::urls;

static PRODUCT_CARDS: LazyLock<LinkRules> = LazyLock::new(|| {
    LinkRules::new(
        "product cards",
        vec![
            LinkRule::css("search-result-list", "ul.js_seachResultList li.gbGoodsItem"),
            LinkRule::css("brand-list", "ul.brandList_content li.gbGoodsItem"),
            LinkRule::css("goods-grid", ".goodsList_grid .goodsItem"),
            LinkRule::regex(
                "legacy-goods-link",
                r#"<a[^>]*class="[^"]*js-goodsLink[^"]*"[^>]*href="(?P<href>[^"]+)""#,
            ),
        ],
    )
});

/// Products listed on one catalog page, in page order, duplicates dropped.
pub fn parse_product_summaries(page: &RenderedPage) -> Vec<ProductRef> {
    let doc = Document::parse(&page.html);
    let Some(found) = PRODUCT_CARDS.first_nonempty(&doc.scope()) else {
        return Vec::new();
    };
    debug!(rule = found.rule, url = %page.url, count = found.value.len(), "Product cards");

    let mut seen = HashSet::new();
    found
        .value
        .into_iter()
        .filter_map(|link| {
            let url = urls::resolve(&page.url, &link.href)?;
            let id = urls::site_id(&url).or_else(|| urls::file_stem(&url))?;
            seen.insert(id.clone()).then_some(ProductRef { id, url })
        })
        .collect()
}
