use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryNode {
    pub id: String,
    pub name: String,
    pub url: String,
    pub parent_id: Option<String>,
    pub depth: u32,
}

/// Root-to-leaf chain of categories. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPath {
    pub nodes: Vec<CategoryNode>,
}

impl CategoryPath {
    pub fn leaf(&self) -> &CategoryNode {
        // constructed by the walker with at least the visited node
        &self.nodes[self.nodes.len() - 1]
    }

    pub fn names(&self) -> String {
        self.nodes
            .iter()
            .map(|n| n.name.as_str())
            .collect::<Vec<_>>()
            .join(" > ")
    }
}

/// A product as listed on a catalog page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRef {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: String,
    pub url: String,
    pub category_id: String,
    pub title: String,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub price: Decimal,
    pub currency_code: String,
    pub discount_percent: Option<u8>,
    pub rating: Option<f32>,
    pub review_count: Option<u32>,
    pub answer_count: Option<u32>,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Review {
    pub id: String,
    pub product_id: String,
    pub author: Option<String>,
    pub rating: Option<u8>,
    pub title: Option<String>,
    pub attributes: Option<String>,
    pub text: String,
    pub posted_at: Option<NaiveDateTime>,
    pub language_code: Option<String>,
    /// Percentage reported by the detection service.
    pub detection_confidence: Option<f32>,
}

impl Review {
    pub fn apply_detection(&mut self, detection: Detection) {
        self.language_code = Some(detection.language_code);
        self.detection_confidence = Some(detection.confidence);
    }

    pub fn is_enriched(&self) -> bool {
        self.language_code.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub language_code: String,
    pub confidence: f32,
}

/// Stable review identity: the site's review id when it has one, otherwise a
/// content key that survives reordering of the review list between crawls.
pub fn review_id(
    product_id: &str,
    site_id: Option<&str>,
    author: Option<&str>,
    posted_at: Option<&NaiveDateTime>,
    text: &str,
) -> String {
    if let Some(site_id) = site_id.filter(|s| !s.is_empty()) {
        return format!("{}-r{}", product_id, site_id);
    }
    let mut hasher = Sha256::new();
    hasher.update(product_id.as_bytes());
    hasher.update([0]);
    hasher.update(author.unwrap_or("").as_bytes());
    hasher.update([0]);
    if let Some(ts) = posted_at {
        hasher.update(ts.format("%Y-%m-%d %H:%M:%S").to_string().as_bytes());
    }
    hasher.update([0]);
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-h{}", product_id, &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_id_wins() {
        assert_eq!(
            review_id("pp_1", Some("778"), Some("ann"), None, "great"),
            "pp_1-r778"
        );
    }

    #[test]
    fn content_key_is_stable_and_distinct() {
        let a = review_id("pp_1", None, Some("ann"), None, "great");
        let b = review_id("pp_1", None, Some("ann"), None, "great");
        let c = review_id("pp_1", None, Some("bob"), None, "great");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("pp_1-h"));
    }

    #[test]
    fn empty_site_id_falls_back_to_content() {
        let id = review_id("pp_1", Some(""), None, None, "x");
        assert!(id.starts_with("pp_1-h"));
    }

    #[test]
    fn path_names() {
        let node = |id: &str, name: &str| CategoryNode {
            id: id.into(),
            name: name.into(),
            url: String::new(),
            parent_id: None,
            depth: 0,
        };
        let path = CategoryPath {
            nodes: vec![node("c_1", "Phones"), node("c_2", "Cases")],
        };
        assert_eq!(path.names(), "Phones > Cases");
        assert_eq!(path.leaf().id, "c_2");
    }
}
