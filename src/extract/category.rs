use std::sync::LazyLock;

use tracing::debug;

use super::rules::{FieldRules, LinkRule, LinkRules, Rule};
use crate::dom::{Document, RenderedPage};
use crate::error::ExtractionError;
use crate::model::CategoryNode;
use crate::urls;

/// Top-level department menu, present in the header of every page.
static DEPARTMENTS: LazyLock<LinkRules> = LazyLock::new(|| {
    LinkRules::new(
        "departments",
        vec![
            LinkRule::css_named_by("header-menu", "ul.headerCate_itemBox li.headerCate_item", "title"),
            LinkRule::css_named_by("header-nav", "nav.headerNav a.headerNav_link", "title"),
            LinkRule::regex(
                "legacy-top-cate",
                r#"<a[^>]*class="[^"]*topCate_link[^"]*"[^>]*href="(?P<href>[^"]+)"[^>]*>\s*(?P<name>[^<]+?)\s*</a>"#,
            ),
        ],
    )
});

/// Sub-category navigation of a category page. Header links are deliberately
/// absent: they would turn every leaf into an entry point for the whole site.
static SUBCATEGORIES: LazyLock<LinkRules> = LazyLock::new(|| {
    LinkRules::new(
        "subcategories",
        vec![
            LinkRule::css("aside-tree", ".cateMain_aside .cateMain_asideItem > a"),
            LinkRule::css("filter-list", ".cateFilter_list a.cateFilter_link"),
            LinkRule::css_named_by("cate-tiles", ".cateTiles_item a", "title"),
            LinkRule::regex(
                "legacy-cate-nav",
                r#"<a[^>]*class="[^"]*js-cateNavLink[^"]*"[^>]*href="(?P<href>[^"]+)"[^>]*>\s*(?P<name>[^<]+?)\s*</a>"#,
            ),
        ],
    )
});

static CATEGORY_NAME: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "category name",
        vec![
            Rule::text("cate-title", "h1.cateMain_title"),
            Rule::text("cate-crumb", ".cateCrumb_item.is-current"),
            Rule::attr("og-title", r#"meta[property="og:title"]"#, "content"),
            Rule::regex("html-title", r"(?is)<title>\s*([^<|]+?)\s*(?:\||</title>)"),
        ],
    )
});

static BREADCRUMBS: LazyLock<LinkRules> = LazyLock::new(|| {
    LinkRules::new(
        "breadcrumbs",
        vec![
            LinkRule::css(
                "goods-crumb",
                r#"a.cGoodsCrumb_itemLink[itemprop="item"]"#,
            ),
            LinkRule::css("crumb-list", r#"[itemtype$="BreadcrumbList"] a[itemprop="item"]"#),
        ],
    )
});

/// A child link found on a category page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryLink {
    pub name: String,
    pub url: String,
}

fn collect_links(page: &RenderedPage, rules: &LinkRules, excluded: &[String]) -> Vec<CategoryLink> {
    let doc = Document::parse(&page.html);
    let Some(found) = rules.first_nonempty(&doc.scope()) else {
        return Vec::new();
    };
    debug!(list = rules.list, rule = found.rule, url = %page.url, count = found.value.len());

    let mut seen = std::collections::HashSet::new();
    found
        .value
        .into_iter()
        .filter_map(|link| {
            if link.name.is_empty() {
                debug!(href = %link.href, "Dropping unnamed {} link", rules.list);
                return None;
            }
            if excluded.iter().any(|x| x.eq_ignore_ascii_case(&link.name)) {
                return None;
            }
            let url = urls::resolve(&page.url, &link.href)?;
            seen.insert(urls::normalize_path(&url)).then_some(CategoryLink {
                name: link.name,
                url,
            })
        })
        .collect()
}

/// Department entry points from the header menu, minus the excluded names.
pub fn parse_departments(page: &RenderedPage, excluded: &[String]) -> Vec<CategoryLink> {
    collect_links(page, &DEPARTMENTS, excluded)
}

/// Child categories listed on a category page, in page order.
pub fn parse_category_links(page: &RenderedPage) -> Vec<CategoryLink> {
    collect_links(page, &SUBCATEGORIES, &[])
}

pub fn parse_category_name(page: &RenderedPage) -> Result<String, ExtractionError> {
    let doc = Document::parse(&page.html);
    CATEGORY_NAME.require(&doc.scope()).map(|m| m.value)
}

/// Category chain from a product page's breadcrumb, root first. Crumbs
/// without a category id (home, search) are skipped.
pub fn parse_breadcrumbs(page: &RenderedPage) -> Vec<CategoryNode> {
    let doc = Document::parse(&page.html);
    let Some(found) = BREADCRUMBS.first_nonempty(&doc.scope()) else {
        return Vec::new();
    };

    let mut nodes: Vec<CategoryNode> = Vec::new();
    for link in found.value {
        let Some(url) = urls::resolve(&page.url, &link.href) else {
            continue;
        };
        let Some(id) = urls::site_id(&url).filter(|id| id.starts_with("c_")) else {
            continue;
        };
        if link.name.is_empty() || nodes.iter().any(|n| n.id == id) {
            continue;
        }
        let parent_id = nodes.last().map(|n| n.id.clone());
        nodes.push(CategoryNode {
            id,
            name: link.name.replace('\\', ""),
            url,
            parent_id,
            depth: nodes.len() as u32,
        });
    }
    nodes
}

/// "New arrivals" ordering of a catalog, when the page offers one.
pub fn parse_sort_newest_url(page: &RenderedPage) -> Option<String> {
    static SORT_LINKS: LazyLock<LinkRules> = LazyLock::new(|| {
        LinkRules::new(
            "sort options",
            vec![
                LinkRule::css("sort-box", "p.js-SortItemBox a.js-orderItem"),
                LinkRule::css("sort-bar", ".cateMain_sortBar a[data-sort]"),
            ],
        )
    });
    let doc = Document::parse(&page.html);
    let found = SORT_LINKS.first_nonempty(&doc.scope())?;
    found
        .value
        .into_iter()
        .find(|l| l.name.contains("New"))
        .and_then(|l| urls::resolve(&page.url, &l.href))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOME: &str = r#"<html><body>
        <ul class="headerCate_itemBox">
          <li class="headerCate_item"><a href="/phones-c_11293/" title="Phones">Phones</a></li>
          <li class="headerCate_item"><a href="/fashion-c_1/" title="Fashion">Fashion</a></li>
          <li class="headerCate_item"><a href="/tools-c_11340/" title="Tools">Tools</a></li>
          <li class="headerCate_item"><a href="/brands.html" title="Top Brands">Top Brands</a></li>
        </ul></body></html>"#;

    #[test]
    fn departments_skip_excluded_names() {
        let page = RenderedPage::new("https://www.gearbest.com/", HOME);
        let excluded = vec!["Fashion".to_string(), "Top Brands".to_string()];
        let links = parse_departments(&page, &excluded);
        assert_eq!(
            links,
            vec![
                CategoryLink {
                    name: "Phones".into(),
                    url: "https://www.gearbest.com/phones-c_11293/".into()
                },
                CategoryLink {
                    name: "Tools".into(),
                    url: "https://www.gearbest.com/tools-c_11340/".into()
                },
            ]
        );
    }

    #[test]
    fn category_links_ignore_header_menu() {
        let html = format!(
            r#"{}<div class="cateMain_aside">
                 <div class="cateMain_asideItem"><a href="/cases-c_2/">Cases</a></div>
                 <div class="cateMain_asideItem"><a href="/cables-c_3/">Cables</a></div>
                 <div class="cateMain_asideItem"><a href="/cases-c_2/?sort=new">Cases</a></div>
               </div>"#,
            HOME
        );
        let page = RenderedPage::new("https://www.gearbest.com/phones-c_11293/", html);
        let names: Vec<String> = parse_category_links(&page).into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["Cases", "Cables"]);

        let leaf = RenderedPage::new("https://www.gearbest.com/cases-c_2/", HOME);
        assert!(parse_category_links(&leaf).is_empty());
    }

    #[test]
    fn legacy_nav_by_regex() {
        let html = r#"<a class="js-cateNavLink item" href="/old-c_9/"> Old Things </a>"#;
        let page = RenderedPage::new("https://www.gearbest.com/x-c_8/", html);
        let links = parse_category_links(&page);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "Old Things");
        assert_eq!(links[0].url, "https://www.gearbest.com/old-c_9/");
    }

    #[test]
    fn category_name_required() {
        let page = RenderedPage::new("https://x/c_1/", r#"<h1 class="cateMain_title">Phones</h1>"#);
        assert_eq!(parse_category_name(&page).unwrap(), "Phones");

        let page = RenderedPage::new("https://x/c_1/", "<html><head><title>Tablets | Shop</title></head></html>");
        assert_eq!(parse_category_name(&page).unwrap(), "Tablets");

        let page = RenderedPage::new("https://x/c_1/", "<div></div>");
        let err = parse_category_name(&page).unwrap_err();
        assert_eq!(err.field, "category name");
    }

    #[test]
    fn breadcrumbs_form_a_chain() {
        let html = r#"
          <a class="cGoodsCrumb_itemLink" itemprop="item" href="/"><span>Home</span></a>
          <a class="cGoodsCrumb_itemLink" itemprop="item" href="/electronics-c_11293/"><span>Electronics</span></a>
          <a class="cGoodsCrumb_itemLink" itemprop="item" href="/phones-c_11294/"><span>Cell\ Phones</span></a>"#;
        let page = RenderedPage::new("https://www.gearbest.com/p/pp_1.html", html);
        let nodes = parse_breadcrumbs(&page);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "c_11293");
        assert_eq!(nodes[0].parent_id, None);
        assert_eq!(nodes[1].name, "Cell Phones");
        assert_eq!(nodes[1].parent_id.as_deref(), Some("c_11293"));
        assert_eq!(nodes[1].depth, 1);
    }

    #[test]
    fn sort_newest_link() {
        let html = r#"<p class="js-SortItemBox">
            <a class="js-orderItem" href="?odr=relevance">Relevance</a>
            <a class="js-orderItem" href="?odr=new">New Arrivals</a></p>"#;
        let page = RenderedPage::new("https://www.gearbest.com/phones-c_1/", html);
        assert_eq!(
            parse_sort_newest_url(&page).as_deref(),
            Some("https://www.gearbest.com/phones-c_1/?odr=new")
        );
    }
}
