use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use scraper::Selector;
use tracing::debug;

use super::rules::{FieldRules, ItemRules, LinkRule, LinkRules, Rule};
use crate::dom::{element_text, Document, RenderedPage, Scope};
use crate::model::{review_id, Review};
use crate::urls;

static REVIEW_ITEMS: LazyLock<ItemRules> = LazyLock::new(|| {
    ItemRules::new(
        "reviews",
        &[
            ("goods-reviews", "ul.goodsReviews_list li.goodsReviews_item"),
            ("any-goods-review", "li.goodsReviews_item"),
            ("review-list", ".reviewList .reviewItem"),
        ],
    )
});

static AUTHOR: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "review author",
        vec![
            Rule::text("user-name", "strong.goodsReviews_itemUserName"),
            Rule::text("review-user", ".reviewItem_user"),
        ],
    )
});

static TITLE: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "review title",
        vec![
            Rule::text("title-text", "strong.goodsReviews_itemTitleText"),
            Rule::text("review-title", ".reviewItem_title"),
        ],
    )
});

static RATING: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "review rating",
        vec![
            Rule::attr("data-rating", "[data-rating]", "data-rating"),
            Rule::count("full-stars", "i.rating_full"),
            Rule::regex("out-of-five", r"\b([1-5])\s*/\s*5\b"),
        ],
    )
});

static POSTED_AT: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "review time",
        vec![
            Rule::text("item-time", "p.goodsReviews_itemTime"),
            Rule::attr("time-datetime", "time[datetime]", "datetime"),
            Rule::text("review-date", ".reviewItem_date"),
        ],
    )
});

/// Review ordering controls above the review list.
static REVIEW_SORT_LINKS: LazyLock<LinkRules> = LazyLock::new(|| {
    LinkRules::new(
        "review sort options",
        vec![
            LinkRule::css("review-filter", "#js-reviewFilter a"),
            LinkRule::css("review-sort", ".goodsReviews_sort a[data-sort]"),
        ],
    )
});

static SITE_REVIEW_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"data-review-id="([^"]+)""#).unwrap());
static ATTRIBUTE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("span.goodsReviews_itemAttrEach").unwrap());
static CONTENT_TERM: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("dl.goodsReviews_itemCont dt, dl.goodsReviews_itemCont dd").unwrap());
static PLAIN_TEXT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".reviewItem_text, p.goodsReviews_itemText").unwrap());

const TIME_FORMATS: &[&str] = &["%b %d,%Y %H:%M:%S", "%b %d, %Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMATS: &[&str] = &["%b %d,%Y", "%b %d, %Y", "%Y-%m-%d"];

fn parse_rating(raw: &str) -> Option<u8> {
    let value: u8 = raw.trim().parse().ok()?;
    (1..=5).contains(&value).then_some(value)
}

/// Timestamps as the site prints them, e.g. `Mar 02,2019 10:21:53`.
pub fn parse_posted_at(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim().trim_end_matches('Z');
    TIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Review body: the question/answer pairs of the content list joined line by
/// line, or the plain text block of older layouts. May be empty.
fn review_text(scope: &Scope<'_>) -> String {
    let pairs: Vec<String> = scope
        .select(&CONTENT_TERM)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();
    if !pairs.is_empty() {
        return pairs.join("\n");
    }
    scope
        .select(&PLAIN_TEXT)
        .map(element_text)
        .find(|t| !t.is_empty())
        .unwrap_or_default()
}

fn attributes(scope: &Scope<'_>) -> Option<String> {
    let attrs: Vec<String> = scope
        .select(&ATTRIBUTE)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();
    (!attrs.is_empty()).then(|| attrs.join("; "))
}

/// Most-recent-first ordering of a product's reviews. `None` when the page has
/// no such control or it only works through scripts.
pub fn parse_review_sort_newest_url(page: &RenderedPage) -> Option<String> {
    let doc = Document::parse(&page.html);
    let found = REVIEW_SORT_LINKS.first_nonempty(&doc.scope())?;
    found
        .value
        .into_iter()
        .find(|l| {
            let name = l.name.to_lowercase();
            name.contains("recent") || name.contains("newest")
        })
        .and_then(|l| urls::resolve(&page.url, &l.href))
}

/// Reviews on one review page, in page order.
pub fn parse_reviews(page: &RenderedPage, product_id: &str) -> Vec<Review> {
    let doc = Document::parse(&page.html);
    let Some(found) = REVIEW_ITEMS.first_nonempty(&doc.scope()) else {
        return Vec::new();
    };
    debug!(items = REVIEW_ITEMS.items, rule = found.rule, url = %page.url, count = found.value.len());

    found
        .value
        .into_iter()
        .filter_map(|item| {
            let scope = Scope::of(item);
            let site_id = item
                .value()
                .attr("data-review-id")
                .map(str::to_string)
                .or_else(|| {
                    SITE_REVIEW_ID
                        .captures(scope.source())
                        .map(|c| c[1].to_string())
                });
            let author = AUTHOR.find(&scope);
            let text = review_text(&scope);
            if author.is_none() && text.is_empty() && site_id.is_none() {
                debug!(url = %page.url, "Skipping empty review item");
                return None;
            }
            let posted_at = POSTED_AT.first_map(&scope, parse_posted_at).map(|m| m.value);
            let id = review_id(
                product_id,
                site_id.as_deref(),
                author.as_deref(),
                posted_at.as_ref(),
                &text,
            );
            Some(Review {
                id,
                product_id: product_id.to_string(),
                author,
                rating: RATING.first_map(&scope, parse_rating).map(|m| m.value),
                title: TITLE.find(&scope),
                attributes: attributes(&scope),
                text,
                posted_at,
                language_code: None,
                detection_confidence: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<ul class="goodsReviews_list">
      <li class="goodsReviews_item" data-review-id="778">
        <strong class="goodsReviews_itemUserName">Ann</strong>
        <div class="goodsReviews_itemRating" data-rating="4"></div>
        <p class="goodsReviews_itemTime">Mar 02,2019 10:21:53</p>
        <strong class="goodsReviews_itemTitleText">Solid phone</strong>
        <span class="goodsReviews_itemAttrEach">Color: Black</span>
        <span class="goodsReviews_itemAttrEach">Size: 4GB</span>
        <dl class="goodsReviews_itemCont">
          <dt>Pros:</dt><dd>Battery lasts two days</dd>
        </dl>
      </li>
      <li class="goodsReviews_item">
        <strong class="goodsReviews_itemUserName">Bob</strong>
        <i class="rating_full"></i><i class="rating_full"></i><i class="rating_empty"></i>
        <p class="goodsReviews_itemTime">Apr 10,2019</p>
      </li>
      <li class="goodsReviews_item"></li>
    </ul>"#;

    #[test]
    fn reviews_in_page_order() {
        let page = RenderedPage::new("https://www.gearbest.com/p/pp_1.html", PAGE);
        let reviews = parse_reviews(&page, "pp_1");
        assert_eq!(reviews.len(), 2);
        assert_eq!(REVIEW_ITEMS.first_nonempty(&Document::parse(PAGE).scope()).unwrap().rule, "goods-reviews");
        assert_eq!(REVIEW_ITEMS.items, "reviews");

        let ann = &reviews[0];
        assert_eq!(ann.id, "pp_1-r778");
        assert_eq!(ann.author.as_deref(), Some("Ann"));
        assert_eq!(ann.rating, Some(4));
        assert_eq!(ann.title.as_deref(), Some("Solid phone"));
        assert_eq!(ann.attributes.as_deref(), Some("Color: Black; Size: 4GB"));
        assert_eq!(ann.text, "Pros:\nBattery lasts two days");
        assert_eq!(
            ann.posted_at,
            NaiveDate::from_ymd_opt(2019, 3, 2).unwrap().and_hms_opt(10, 21, 53)
        );
        assert!(!ann.is_enriched());

        let bob = &reviews[1];
        assert!(bob.id.starts_with("pp_1-h"));
        assert_eq!(bob.rating, Some(2));
        assert_eq!(bob.text, "");
        assert_eq!(
            bob.posted_at,
            NaiveDate::from_ymd_opt(2019, 4, 10).unwrap().and_hms_opt(0, 0, 0)
        );
    }

    #[test]
    fn ids_do_not_depend_on_position() {
        let first = RenderedPage::new("u", PAGE);
        let reordered = PAGE.replacen(r#"<li class="goodsReviews_item" data-review-id="778">"#, "<li class=\"x\">", 1);
        let a = parse_reviews(&first, "pp_1");
        let b = parse_reviews(&RenderedPage::new("u", reordered), "pp_1");
        assert_eq!(b.len(), 1);
        assert_eq!(a[1].id, b[0].id);
    }

    #[test]
    fn older_layout() {
        let html = r#"<div class="reviewList"><div class="reviewItem">
            <span class="reviewItem_user">carol</span><span>5/5</span>
            <time datetime="2018-11-05T08:00:00Z"></time>
            <p class="reviewItem_text">Muy bueno</p></div></div>"#;
        let page = RenderedPage::new("u", html);
        let r = &parse_reviews(&page, "pp_2")[0];
        assert_eq!(r.author.as_deref(), Some("carol"));
        assert_eq!(r.rating, Some(5));
        assert_eq!(r.text, "Muy bueno");
        assert!(r.posted_at.is_some());
    }

    #[test]
    fn no_reviews() {
        let page = RenderedPage::new("u", "<div class=\"goodsReviews_empty\"></div>");
        assert!(parse_reviews(&page, "pp_1").is_empty());
    }

    #[test]
    fn most_recent_sort_link() {
        let html = r#"<ul id="js-reviewFilter"><li><div><div>
            <a href="?sort=helpful">Most Helpful</a>
            <a href="?sort=recent">Most Recent</a>
            </div></div></li></ul>"#;
        let page = RenderedPage::new("https://www.gearbest.com/p/pp_1.html", html);
        assert_eq!(
            parse_review_sort_newest_url(&page).as_deref(),
            Some("https://www.gearbest.com/p/pp_1.html?sort=recent")
        );

        let scripted = RenderedPage::new(&page.url, html.replace("?sort=recent", "javascript:;"));
        assert_eq!(parse_review_sort_newest_url(&scripted), None);
        assert_eq!(parse_review_sort_newest_url(&RenderedPage::new("u", PAGE)), None);
    }

    #[test]
    fn out_of_range_rating_is_ignored() {
        assert_eq!(parse_rating("0"), None);
        assert_eq!(parse_rating("6"), None);
        assert_eq!(parse_rating("3"), Some(3));
    }
}
