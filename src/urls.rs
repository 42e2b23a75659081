use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static SITE_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:^|[/-])((?:pp|c)_[^/.?#]+)").unwrap());
static PAGE_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/\d+\.html$").unwrap());

/// Resolve `href` against `base`. Script and fragment-only links yield `None`.
pub fn resolve(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let joined = match Url::parse(base) {
        Ok(base) => base.join(href).ok()?,
        Err(_) => Url::parse(href).ok()?,
    };
    match joined.scheme() {
        "http" | "https" => Some(joined.to_string()),
        _ => None,
    }
}

/// Identity of a category page for cycle detection: host + lowercased path,
/// without query, fragment, trailing slash or a `/N.html` page suffix.
pub fn normalize_path(url: &str) -> String {
    let (host, path) = match Url::parse(url) {
        Ok(u) => (u.host_str().unwrap_or("").to_lowercase(), u.path().to_string()),
        Err(_) => (String::new(), url.split(['?', '#']).next().unwrap_or("").to_string()),
    };
    let path = path.to_lowercase();
    let path = PAGE_SUFFIX_RE.replace(&path, "");
    let path = path.trim_end_matches('/');
    let host = host.trim_start_matches("www.");
    format!("{}{}", host, path)
}

/// Site-assigned id embedded in the URL (`pp_…` for products, `c_…` for categories).
pub fn site_id(url: &str) -> Option<String> {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    SITE_ID_RE
        .captures(&path)
        .map(|caps| caps[1].to_string())
}

/// Natural key for a URL: the site id when present, else the normalized path.
pub fn natural_id(url: &str) -> String {
    site_id(url).unwrap_or_else(|| normalize_path(url))
}

/// Last path segment without its extension, e.g. `…/pp_123.html` → `pp_123`.
pub fn file_stem(url: &str) -> Option<String> {
    let path = Url::parse(url).ok()?.path().to_string();
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    let stem = last.split('.').next().unwrap_or(last);
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Same URL with its `page` query parameter incremented (absent counts as 1).
pub fn next_page_url(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    let mut current = 1u32;
    let mut kept = Vec::new();
    for (k, v) in parsed.query_pairs() {
        if k == "page" {
            current = v.parse().unwrap_or(1);
        } else {
            kept.push((k.into_owned(), v.into_owned()));
        }
    }
    let next = current.checked_add(1)?;
    {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        pairs.append_pair("page", &next.to_string());
    }
    Some(parsed.to_string())
}
