//! Ordered extraction rule tables.
//!
//! Every field the site exposes has been rendered by several page layouts over
//! time. Each field gets a table of named rules in priority order; the first rule
//! that produces a value accepted by the field's normalizer wins.

use regex::Regex;
use scraper::{ElementRef, Selector};

use crate::dom::{collapse_ws, element_text, unescape, Scope};
use crate::error::ExtractionError;

enum Matcher {
    /// Text of the first matching element with non-empty text.
    Text(Selector),
    /// Attribute of the first matching element that carries it.
    Attr(Selector, &'static str),
    /// Number of matching elements, when non-zero.
    Count(Selector),
    /// First capture group over the scope's source markup.
    Regex(Regex),
}

pub struct Rule {
    pub name: &'static str,
    matcher: Matcher,
}

impl Rule {
    pub fn text(name: &'static str, selector: &str) -> Self {
        Self {
            name,
            matcher: Matcher::Text(Selector::parse(selector).unwrap()),
        }
    }

    pub fn attr(name: &'static str, selector: &str, attr: &'static str) -> Self {
        Self {
            name,
            matcher: Matcher::Attr(Selector::parse(selector).unwrap(), attr),
        }
    }

    pub fn count(name: &'static str, selector: &str) -> Self {
        Self {
            name,
            matcher: Matcher::Count(Selector::parse(selector).unwrap()),
        }
    }

    pub fn regex(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            matcher: Matcher::Regex(Regex::new(pattern).unwrap()),
        }
    }

    pub fn apply(&self, scope: &Scope<'_>) -> Option<String> {
        let value = match &self.matcher {
            Matcher::Text(sel) => scope
                .select(sel)
                .map(element_text)
                .find(|t| !t.is_empty()),
            Matcher::Attr(sel, attr) => scope
                .select(sel)
                .filter_map(|el| el.value().attr(attr))
                .map(|v| collapse_ws(&unescape(v)))
                .find(|v| !v.is_empty()),
            Matcher::Count(sel) => match scope.select(sel).count() {
                0 => None,
                n => Some(n.to_string()),
            },
            Matcher::Regex(re) => re
                .captures(scope.source())
                .and_then(|caps| caps.get(1))
                .map(|m| collapse_ws(&unescape(m.as_str()))),
        };
        value.filter(|v| !v.is_empty())
    }
}

/// Which rule produced a value, and the normalized value.
#[derive(Debug, Clone, PartialEq)]
pub struct Match<T> {
    pub rule: &'static str,
    pub value: T,
}

pub struct FieldRules {
    pub field: &'static str,
    rules: Vec<Rule>,
}

impl FieldRules {
    pub fn new(field: &'static str, rules: Vec<Rule>) -> Self {
        Self { field, rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    /// First rule whose raw value the normalizer accepts.
    pub fn first_map<T>(
        &self,
        scope: &Scope<'_>,
        normalize: impl Fn(&str) -> Option<T>,
    ) -> Option<Match<T>> {
        self.rules.iter().find_map(|rule| {
            let raw = rule.apply(scope)?;
            let value = normalize(&raw)?;
            Some(Match {
                rule: rule.name,
                value,
            })
        })
    }

    pub fn first_match(&self, scope: &Scope<'_>) -> Option<Match<String>> {
        self.first_map(scope, |s| Some(s.to_string()))
    }

    pub fn find(&self, scope: &Scope<'_>) -> Option<String> {
        self.first_match(scope).map(|m| m.value)
    }

    pub fn require_map<T>(
        &self,
        scope: &Scope<'_>,
        normalize: impl Fn(&str) -> Option<T>,
    ) -> Result<Match<T>, ExtractionError> {
        self.first_map(scope, normalize).ok_or_else(|| {
            ExtractionError::new(
                self.field,
                format!("no rule matched (tried {})", self.rule_names().join(", ")),
            )
        })
    }

    pub fn require(&self, scope: &Scope<'_>) -> Result<Match<String>, ExtractionError> {
        self.require_map(scope, |s| Some(s.to_string()))
    }
}

// ── Link lists ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub href: String,
}

enum LinkMatcher {
    /// Each match is an `<a>` or contains one; name from an attribute or the text.
    Css {
        selector: Selector,
        name_attr: Option<&'static str>,
    },
    /// Named groups `href` and `name`.
    Regex(Regex),
}

pub struct LinkRule {
    pub name: &'static str,
    matcher: LinkMatcher,
}

static ANCHOR: std::sync::LazyLock<Selector> =
    std::sync::LazyLock::new(|| Selector::parse("a[href]").unwrap());

impl LinkRule {
    pub fn css(name: &'static str, selector: &str) -> Self {
        Self {
            name,
            matcher: LinkMatcher::Css {
                selector: Selector::parse(selector).unwrap(),
                name_attr: None,
            },
        }
    }

    pub fn css_named_by(name: &'static str, selector: &str, name_attr: &'static str) -> Self {
        Self {
            name,
            matcher: LinkMatcher::Css {
                selector: Selector::parse(selector).unwrap(),
                name_attr: Some(name_attr),
            },
        }
    }

    pub fn regex(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            matcher: LinkMatcher::Regex(Regex::new(pattern).unwrap()),
        }
    }

    fn apply(&self, scope: &Scope<'_>) -> Vec<Link> {
        match &self.matcher {
            LinkMatcher::Css {
                selector,
                name_attr,
            } => scope
                .select(selector)
                .filter_map(|el| {
                    let anchor = anchor_of(el)?;
                    let href = anchor.value().attr("href")?.trim().to_string();
                    let name = name_attr
                        .and_then(|a| anchor.value().attr(a).or_else(|| el.value().attr(a)))
                        .map(collapse_ws)
                        .filter(|v| !v.is_empty())
                        .unwrap_or_else(|| element_text(el));
                    Some(Link { name, href })
                })
                .collect(),
            LinkMatcher::Regex(re) => re
                .captures_iter(scope.source())
                .filter_map(|caps| {
                    let href = unescape(caps.name("href")?.as_str()).into_owned();
                    let name = caps
                        .name("name")
                        .map(|m| collapse_ws(&unescape(m.as_str())))
                        .unwrap_or_default();
                    Some(Link { name, href })
                })
                .collect(),
        }
    }
}

fn anchor_of(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    if el.value().name() == "a" && el.value().attr("href").is_some() {
        Some(el)
    } else {
        el.select(&ANCHOR).next()
    }
}

pub struct LinkRules {
    pub list: &'static str,
    rules: Vec<LinkRule>,
}

impl LinkRules {
    pub fn new(list: &'static str, rules: Vec<LinkRule>) -> Self {
        Self { list, rules }
    }

    /// Links from the first rule that finds any.
    pub fn first_nonempty(&self, scope: &Scope<'_>) -> Option<Match<Vec<Link>>> {
        self.rules.iter().find_map(|rule| {
            let links = rule.apply(scope);
            (!links.is_empty()).then_some(Match {
                rule: rule.name,
                value: links,
            })
        })
    }
}

// ── Repeated items ──

/// Alternative selectors for the repeated element of a list (one review, one product card).
pub struct ItemRules {
    pub items: &'static str,
    rules: Vec<(&'static str, Selector)>,
}

impl ItemRules {
    pub fn new(items: &'static str, rules: &[(&'static str, &str)]) -> Self {
        Self {
            items,
            rules: rules
                .iter()
                .map(|(name, sel)| (*name, Selector::parse(sel).unwrap()))
                .collect(),
        }
    }

    pub fn first_nonempty<'a>(&self, scope: &Scope<'a>) -> Option<Match<Vec<ElementRef<'a>>>> {
        self.rules.iter().find_map(|(name, sel)| {
            let found: Vec<ElementRef<'a>> = scope.select(sel).collect();
            (!found.is_empty()).then_some(Match {
                rule: *name,
                value: found,
            })
        })
    }
}
