use std::sync::LazyLock;

use scraper::Selector;

use crate::dom::{has_class, Document, RenderedPage};
use crate::urls;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pagination {
    pub has_next: bool,
    pub next_url: Option<String>,
}

impl Pagination {
    pub fn done() -> Self {
        Self::default()
    }

    fn to(url: String) -> Self {
        Self {
            has_next: true,
            next_url: Some(url),
        }
    }
}

/// One kind of pager control, in the order they are checked.
struct Pager {
    selector: Selector,
    disabled_class: &'static str,
    /// The control drives an AJAX reload instead of linking to a page.
    scripted: bool,
}

static PAGERS: LazyLock<Vec<Pager>> = LazyLock::new(|| {
    vec![
        Pager {
            selector: Selector::parse(".cateMain_pages a.pageNext").unwrap(),
            disabled_class: "disable",
            scripted: false,
        },
        Pager {
            selector: Selector::parse(r#".goodsReviews_pageWrap .gbPaging a[data-goto="next"]"#)
                .unwrap(),
            disabled_class: "disabled",
            scripted: true,
        },
        Pager {
            selector: Selector::parse(r#"link[rel="next"], a[rel="next"]"#).unwrap(),
            disabled_class: "disabled",
            scripted: false,
        },
    ]
});

/// Next-page control of a catalog or review page.
///
/// Scripted review pagers without a usable href get their next URL from the
/// current one by incrementing its `page` parameter.
pub fn parse_pagination(page: &RenderedPage) -> Pagination {
    let doc = Document::parse(&page.html);
    let scope = doc.scope();

    for pager in PAGERS.iter() {
        let Some(control) = scope.select(&pager.selector).next() else {
            continue;
        };
        if has_class(control, pager.disabled_class) || control.value().attr("disabled").is_some() {
            return Pagination::done();
        }
        let href = control
            .value()
            .attr("href")
            .and_then(|h| urls::resolve(&page.url, h));
        return match (href, pager.scripted) {
            (Some(url), _) if url != page.url => Pagination::to(url),
            (_, true) => urls::next_page_url(&page.url)
                .map(Pagination::to)
                .unwrap_or_default(),
            _ => Pagination::done(),
        };
    }
    Pagination::done()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_next_link() {
        let html = r#"<div class="cateMain_pages"><a class="pageNext" href="/phones-c_1/2.html">Next</a></div>"#;
        let page = RenderedPage::new("https://www.gearbest.com/phones-c_1/", html);
        assert_eq!(
            parse_pagination(&page),
            Pagination {
                has_next: true,
                next_url: Some("https://www.gearbest.com/phones-c_1/2.html".into())
            }
        );
    }

    #[test]
    fn disabled_catalog_next() {
        let html = r#"<div class="cateMain_pages"><a class="pageNext disable" href="/phones-c_1/9.html">Next</a></div>"#;
        let page = RenderedPage::new("https://www.gearbest.com/phones-c_1/9.html", html);
        assert!(!parse_pagination(&page).has_next);
    }

    #[test]
    fn scripted_review_pager_synthesizes_url() {
        let html = r#"<div class="goodsReviews_pageWrap"><div class="gbPaging">
            <a data-goto="prev" class="disabled">Prev</a>
            <a data-goto="next" href="javascript:;">Next</a></div></div>"#;
        let page = RenderedPage::new("https://www.gearbest.com/p/pp_1.html", html);
        assert_eq!(
            parse_pagination(&page).next_url.as_deref(),
            Some("https://www.gearbest.com/p/pp_1.html?page=2")
        );
    }

    #[test]
    fn disabled_review_pager() {
        let html = r#"<div class="goodsReviews_pageWrap"><div class="gbPaging">
            <a data-goto="next" class="disabled">Next</a></div></div>"#;
        let page = RenderedPage::new("https://www.gearbest.com/p/pp_1.html?page=4", html);
        assert_eq!(parse_pagination(&page), Pagination::done());
    }

    #[test]
    fn link_rel_next_and_absent() {
        let html = r#"<html><head><link rel="next" href="?page=3"></head></html>"#;
        let page = RenderedPage::new("https://x.com/c_1/?page=2", html);
        assert_eq!(parse_pagination(&page).next_url.as_deref(), Some("https://x.com/c_1/?page=3"));

        let page = RenderedPage::new("https://x.com/c_1/", "<p>no pager</p>");
        assert_eq!(parse_pagination(&page), Pagination::done());
    }

    #[test]
    fn self_link_is_not_a_next_page() {
        let html = r#"<div class="cateMain_pages"><a class="pageNext" href="">Next</a></div>"#;
        let page = RenderedPage::new("https://x.com/c_1/", html);
        assert!(!parse_pagination(&page).has_next);
    }
}
