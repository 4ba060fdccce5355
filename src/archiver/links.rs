//! Link discovery and crawl policy.

use std::fmt;
use std::str::FromStr;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::constants::HTML_EXTENSIONS;

/// Which links a crawl follows by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkScope {
    SameDomain,
    External,
    All,
}

impl fmt::Display for LinkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameDomain => write!(f, "same_domain"),
            Self::External => write!(f, "external"),
            Self::All => write!(f, "all"),
        }
    }
}

impl FromStr for LinkScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "same_domain" => Ok(Self::SameDomain),
            "external" => Ok(Self::External),
            "all" => Ok(Self::All),
            other => Err(format!(
                "must be 'same_domain', 'external' or 'all', got '{other}'"
            )),
        }
    }
}

/// Which links to follow, and how deep.
///
/// The allow list forces a link on; the deny list is checked afterwards
/// and always wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPolicy {
    pub scope: LinkScope,
    /// Substrings that force a link to be followed.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Substrings that prevent a link from being followed.
    #[serde(default)]
    pub deny: Vec<String>,
    /// Remaining crawl depth; pages archived at 0 do not crawl.
    pub levels: u32,
}

impl LinkPolicy {
    #[must_use]
    pub fn new(scope: LinkScope, levels: u32) -> Self {
        Self {
            scope,
            allow: Vec::new(),
            deny: Vec::new(),
            levels,
        }
    }

    /// Follow links on the seed's host only.
    #[must_use]
    pub fn same_domain(seed: &Url, levels: u32) -> Self {
        let mut policy = Self::new(LinkScope::SameDomain, levels);
        if let Some(host) = seed.host_str() {
            let authority = match seed.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            policy.allow.push(format!("//{authority}/"));
        }
        policy
    }

    #[must_use]
    pub fn should_scrape(&self, url: &str) -> bool {
        let mut scrape = self.scope == LinkScope::All;
        if self.allow.iter().any(|s| url.contains(s.as_str())) {
            scrape = true;
        }
        if self.deny.iter().any(|s| url.contains(s.as_str())) {
            scrape = false;
        }
        scrape
    }

    /// Policy for pages one level further down.
    #[must_use]
    pub fn descend(&self) -> Self {
        Self {
            levels: self.levels.saturating_sub(1),
            ..self.clone()
        }
    }
}

/// What an eligible link points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    /// Archived recursively as a page.
    Page,
    /// Downloaded as a plain file.
    File,
}

/// A link that passed the crawl policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCandidate {
    /// Reference as written in markup.
    pub raw: String,
    /// Absolute URL without fragment.
    pub url: Url,
    pub fragment: Option<String>,
    pub target: LinkTarget,
}

/// Whether a URL looks like an HTML page: no extension, or an `.htm*` one.
#[must_use]
pub fn is_html_like(url: &Url) -> bool {
    let leaf = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    match leaf.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => HTML_EXTENSIONS
            .iter()
            .any(|html| ext.eq_ignore_ascii_case(html)),
        _ => true,
    }
}

#[must_use]
pub fn classify(url: &Url) -> LinkTarget {
    if is_html_like(url) {
        LinkTarget::Page
    } else {
        LinkTarget::File
    }
}

static LINK_SELECTORS: std::sync::LazyLock<[(Selector, &'static str); 2]> =
    std::sync::LazyLock::new(|| {
        [
            (Selector::parse("iframe[src]").unwrap(), "src"),
            (Selector::parse("a[href]").unwrap(), "href"),
        ]
    });

/// `iframe[src]` then `a[href]` values, de-duplicated, in document order.
#[must_use]
pub fn collect_links(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut links: Vec<String> = Vec::new();
    for (selector, attribute) in LINK_SELECTORS.iter() {
        for element in document.select(selector) {
            if let Some(value) = element.value().attr(attribute) {
                if !value.trim().is_empty() && !links.iter().any(|l| l == value) {
                    links.push(value.to_string());
                }
            }
        }
    }
    links
}

/// Resolve a link for crawling: fragment stripped, `http(s)` only.
#[must_use]
pub fn resolve_link(raw: &str, page_url: &Url) -> Option<(Url, Option<String>)> {
    let mut url = page_url.join(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let fragment = url.fragment().map(str::to_string);
    url.set_fragment(None);
    Some((url, fragment))
}

/// Links in `html` that `policy` says to follow.
#[must_use]
pub fn eligible_links(html: &str, page_url: &Url, policy: &LinkPolicy) -> Vec<LinkCandidate> {
    collect_links(html)
        .into_iter()
        .filter_map(|raw| {
            let (url, fragment) = resolve_link(&raw, page_url)?;
            if !policy.should_scrape(url.as_str()) {
                return None;
            }
            let target = classify(&url);
            Some(LinkCandidate {
                raw,
                url,
                fragment,
                target,
            })
        })
        .collect()
}
