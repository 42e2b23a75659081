//! Pure functions from rendered markup to records.

pub mod catalog;
pub mod category;
pub mod pagination;
pub mod product;
pub mod reviews;
pub mod rules;

pub use catalog::parse_product_summaries;
pub use category::{
    parse_breadcrumbs, parse_category_links, parse_category_name, parse_departments,
    parse_sort_newest_url,
};
pub use pagination::{parse_pagination, Pagination};
pub use product::parse_product_detail;
pub use reviews::{parse_review_sort_newest_url, parse_reviews};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::RenderedPage;

    /// Every rule table is built lazily; an invalid selector or pattern would
    /// only surface on the first page that reaches it.
    #[test]
    fn all_rule_tables_build() {
        let page = RenderedPage::new("https://www.gearbest.com/", "<html></html>");
        assert!(parse_departments(&page, &[]).is_empty());
        assert!(parse_category_links(&page).is_empty());
        assert!(parse_category_name(&page).is_err());
        assert!(parse_breadcrumbs(&page).is_empty());
        assert!(parse_sort_newest_url(&page).is_none());
        assert!(parse_product_summaries(&page).is_empty());
        assert!(parse_pagination(&page).next_url.is_none());
        assert!(parse_product_detail(&page, "c_1").is_err());
        assert!(parse_reviews(&page, "pp_1").is_empty());
        assert!(parse_review_sort_newest_url(&page).is_none());
    }
}
