use std::str::FromStr;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use super::rules::{FieldRules, Rule};
use crate::dom::{Document, RenderedPage, Scope};
use crate::error::ExtractionError;
use crate::model::Product;
use crate::urls;

const DEFAULT_CURRENCY: &str = "USD";

/// Currency literal as rendered by the site → currency code.
const CURRENCY_CODES: &[(&str, &str)] = &[
    ("₪", "ILS"),
    ("$", "USD"),
    ("US$", "USD"),
    ("£", "GBP"),
    ("C$", "CAD"),
    ("HK$", "HKD"),
    ("円", "JPY"),
    ("R$", "BRL"),
    ("DKr.", "DKK"),
    ("MXN$", "MXN"),
    ("Rp", "IDR"),
    ("€", "EUR"),
    ("AU$", "AUD"),
    ("CHF", "CHF"),
    ("NZ$", "NZD"),
    ("руб.", "RUB"),
    ("NKr.", "NOK"),
    ("SKr", "SEK"),
    ("Col$", "COP"),
    ("฿", "THB"),
    ("zł", "PLN"),
    ("Ft", "HUF"),
    ("RM", "MYR"),
    ("lei", "RON"),
    ("₴", "UAH"),
    ("NT$", "TWD"),
    ("РСД", "RSD"),
    ("лв.", "BGN"),
    ("¥", "CNY"),
    ("Kn", "HRK"),
    ("د.إ", "AED"),
    ("₩", "KRW"),
    ("ARS$", "ARS"),
    ("TL", "TRY"),
    ("₦", "NGN"),
    ("R", "ZAR"),
    ("S$", "SGD"),
    ("ر.س", "SAR"),
    ("PHP", "PHP"),
    ("CL$", "CLP"),
    ("Kč", "CZK"),
    ("Rs", "INR"),
    ("د.م.", "MAD"),
    ("S/.", "PEN"),
];

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d.,\s]*\d|\d").unwrap());
static ISO_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z]{3}$").unwrap());
static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d,.]*\d|\d").unwrap());

static TITLE: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "title",
        vec![
            Rule::text("intro-title", "div.goodsIntro_infoWrap h1.goodsIntro_title"),
            Rule::text("any-intro-title", "h1.goodsIntro_title"),
            Rule::attr("og-title", r#"meta[property="og:title"]"#, "content"),
            Rule::regex("json-goods-title", r#""goodsTitle"\s*:\s*"([^"]+)""#),
        ],
    )
});

static PRICE: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "price",
        vec![
            Rule::text("intro-price", "span.goodsIntro_price"),
            Rule::attr("intro-price-orgp", "[data-orgp]", "data-orgp"),
            Rule::attr("microdata-price", r#"meta[itemprop="price"]"#, "content"),
            Rule::regex("json-shop-price", r#""shop_?[pP]rice"\s*:\s*"?([0-9][0-9.,]*)"#),
        ],
    )
});

static PRICE_CURRENCY: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "price currency",
        vec![
            Rule::attr("microdata-currency", r#"meta[itemprop="priceCurrency"]"#, "content"),
            Rule::attr("data-currency", "[data-currency]", "data-currency"),
        ],
    )
});

static DISCOUNT: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "discount",
        vec![
            Rule::text("intro-discount", "span.goodsIntro_priceDiscount"),
            Rule::text("discount-tag", ".goodsIntro_discountTag"),
            Rule::regex("percent-off", r"(?i)(\d{1,3})\s*%\s*off"),
        ],
    )
});

static DESCRIPTION: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "description",
        vec![
            Rule::text("intro-summary", "div.goodsIntro_summary"),
            Rule::text("goods-desc", "#js-goodsDesc"),
            Rule::attr("meta-description", r#"meta[name="description"]"#, "content"),
        ],
    )
});

static BRAND: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "brand",
        vec![
            Rule::text("intro-brand", "label.goodsIntro_brand"),
            Rule::attr("microdata-brand", r#"meta[itemprop="brand"]"#, "content"),
        ],
    )
});

static RATING: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "rating",
        vec![
            Rule::text("star-grade", "span.gbStarGrade_count"),
            Rule::attr("microdata-rating", r#"[itemprop="ratingValue"]"#, "content"),
        ],
    )
});

static REVIEW_COUNT: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "review count",
        vec![
            Rule::text("intro-reviews", "a.goodsIntro_reviews"),
            Rule::attr("microdata-review-count", r#"[itemprop="reviewCount"]"#, "content"),
        ],
    )
});

static ANSWER_COUNT: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new("answer count", vec![Rule::text("intro-faq", "a.goodsIntro_faq")])
});

static CANONICAL: LazyLock<FieldRules> = LazyLock::new(|| {
    FieldRules::new(
        "canonical url",
        vec![
            Rule::attr("link-canonical", r#"link[rel="canonical"]"#, "href"),
            Rule::attr("og-url", r#"meta[property="og:url"]"#, "content"),
        ],
    )
});

/// Split a rendered price such as `$267.83`, `€1.299,00` or `267` into amount and currency code.
pub fn parse_price(text: &str) -> Option<(Decimal, String)> {
    let text = text.trim();
    let number = NUMBER_RE.find(text)?;
    let literal = format!("{}{}", &text[..number.start()], &text[number.end()..]);
    let amount = parse_amount(number.as_str())?;
    if amount.is_sign_negative() || text[..number.start()].contains('-') {
        return None;
    }
    Some((amount, currency_code(literal.trim())))
}

fn parse_amount(raw: &str) -> Option<Decimal> {
    let raw: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let normalized = match (raw.rfind('.'), raw.rfind(',')) {
        // 1.299,00
        (Some(dot), Some(comma)) if comma > dot => raw.replace('.', "").replace(',', "."),
        // 1,299.00
        (Some(_), Some(_)) => raw.replace(',', ""),
        // 12,99 vs 1,299
        (None, Some(comma)) if raw.len() - comma - 1 == 2 => raw.replace(',', "."),
        (None, Some(_)) => raw.replace(',', ""),
        _ => raw,
    };
    Decimal::from_str(&normalized).ok()
}

/// Currency code for a literal; bare numbers are in the site's default currency.
pub fn currency_code(literal: &str) -> String {
    let literal = literal.trim();
    if literal.is_empty() {
        return DEFAULT_CURRENCY.to_string();
    }
    if let Some((_, code)) = CURRENCY_CODES.iter().find(|(lit, _)| *lit == literal) {
        return code.to_string();
    }
    if ISO_CODE_RE.is_match(literal) {
        return literal.to_string();
    }
    // "Price: US$" and similar: the longest known literal contained in the text
    CURRENCY_CODES
        .iter()
        .filter(|(lit, _)| literal.contains(lit))
        .max_by_key(|(lit, _)| lit.chars().count())
        .map(|(_, code)| code.to_string())
        .unwrap_or_else(|| {
            debug!(literal, "Unknown currency literal");
            literal.to_uppercase()
        })
}

/// First whole number in the text, thousands separators allowed. Decimals
/// ("4.8" next to the count) are ratings and are passed over.
fn parse_count(text: &str) -> Option<u32> {
    COUNT_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .find(|n| !n.contains('.'))
        .and_then(|n| n.replace(',', "").parse().ok())
}

fn parse_discount(text: &str) -> Option<u8> {
    let value: u32 = DIGITS_RE.find(text)?.as_str().parse().ok()?;
    (value <= 100).then_some(value as u8)
}

fn parse_rating(text: &str) -> Option<f32> {
    let value: f32 = text.trim().parse().ok()?;
    (0.0..=5.0).contains(&value).then_some(value)
}

fn clean_brand(text: &str) -> Option<String> {
    let brand = text.trim_start_matches("Brand:").trim();
    (!brand.is_empty()).then(|| brand.to_string())
}

fn price_with_currency(scope: &Scope<'_>) -> Result<(Decimal, String), ExtractionError> {
    let found = PRICE.require_map(scope, parse_price)?;
    let (amount, mut code) = found.value;
    // microdata and data attributes carry the amount alone
    if found.rule != "intro-price" {
        if let Some(explicit) = PRICE_CURRENCY.find(scope) {
            code = currency_code(&explicit);
        }
    }
    debug!(rule = found.rule, %amount, code, "Price");
    Ok((amount, code))
}

/// Product detail page → product record. Title and price are required.
pub fn parse_product_detail(page: &RenderedPage, category_id: &str) -> Result<Product, ExtractionError> {
    let doc = Document::parse(&page.html);
    let scope = doc.scope();

    let title = TITLE.require(&scope)?.value;
    let (price, currency_code) = price_with_currency(&scope)?;

    let url = CANONICAL
        .find(&scope)
        .and_then(|href| urls::resolve(&page.url, &href))
        .unwrap_or_else(|| page.url.clone());
    let id = urls::site_id(&url)
        .or_else(|| urls::site_id(&page.url))
        .unwrap_or_else(|| urls::natural_id(&url));

    Ok(Product {
        id,
        url,
        category_id: category_id.to_string(),
        title,
        description: DESCRIPTION.find(&scope),
        brand: BRAND.first_map(&scope, clean_brand).map(|m| m.value),
        price,
        currency_code,
        discount_percent: DISCOUNT.first_map(&scope, parse_discount).map(|m| m.value),
        rating: RATING.first_map(&scope, parse_rating).map(|m| m.value),
        review_count: REVIEW_COUNT.first_map(&scope, parse_count).map(|m| m.value),
        answer_count: ANSWER_COUNT.first_map(&scope, parse_count).map(|m| m.value),
        scraped_at: Utc::now(),
    })
}
