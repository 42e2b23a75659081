use std::borrow::Cow;

use scraper::{ElementRef, Html, Selector};

/// Rendered markup of one page, as returned by the fetcher.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    pub status: Option<u16>,
}

impl RenderedPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
            status: None,
        }
    }
}

/// Parsed DOM plus the source it came from (regex rules run on the source).
///
/// `Html` is not `Send`; documents are built and dropped between await points.
pub struct Document<'s> {
    html: Html,
    source: &'s str,
}

impl<'s> Document<'s> {
    pub fn parse(source: &'s str) -> Self {
        Self {
            html: Html::parse_document(source),
            source,
        }
    }

    pub fn scope(&self) -> Scope<'_> {
        Scope {
            element: self.html.root_element(),
            source: Cow::Borrowed(self.source),
        }
    }
}

/// A subtree that rules are evaluated against: the whole document or one list item.
pub struct Scope<'a> {
    element: ElementRef<'a>,
    source: Cow<'a, str>,
}

impl<'a> Scope<'a> {
    pub fn of(element: ElementRef<'a>) -> Self {
        Self {
            element,
            source: Cow::Owned(element.html()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn select<'b>(&self, selector: &'b Selector) -> scraper::element_ref::Select<'a, 'b> {
        self.element.select(selector)
    }

    pub fn matches(&self, selector: &Selector) -> bool {
        self.element.select(selector).next().is_some()
    }
}

/// Visible text of an element with whitespace runs collapsed.
pub fn element_text(element: ElementRef<'_>) -> String {
    collapse_ws(&element.text().collect::<Vec<_>>().join(" "))
}

pub fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decode the handful of entities that show up in attribute values matched by regex.
pub fn unescape(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    Cow::Owned(
        s.replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&#039;", "'")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&nbsp;", " ")
            .replace("&amp;", "&"),
    )
}

/// Whether `element` carries `class` among its classes.
pub fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}
