//! Reference rewriting in raw markup.
//!
//! Replacement only happens inside quoted attribute values and CSS `url()`
//! tokens, so the same URL appearing in visible text is left alone.

use std::collections::{BTreeMap, BTreeSet};

use url::Url;

use super::paths::resolve_reference;

/// What a reference in the original markup becomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Points at a downloaded copy, relative to the download destination.
    Local(String),
    /// Removed (block-listed or rejected by a node filter).
    Blank,
    /// Whole attribute value replaced as written, e.g. a `srcset` list or a
    /// `style` attribute.
    Verbatim(String),
    /// Left pointing at the original URL.
    Unchanged,
}

/// Original reference (as written in markup) to its rewrite, for one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteMap {
    entries: BTreeMap<String, Rewrite>,
    resources: Vec<String>,
}

impl RewriteMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `original` at a local copy and record the copy as a resource.
    pub fn record_rewrite(&mut self, original: &str, local: &str) {
        self.entries
            .insert(original.to_string(), Rewrite::Local(local.to_string()));
        self.add_resource(local);
    }

    /// Point a followed link at its archived copy. Links are not resources.
    pub fn record_link(&mut self, original: &str, local: &str) {
        self.entries
            .insert(original.to_string(), Rewrite::Local(local.to_string()));
    }

    /// Record a reference that could not be localized. Never overrides an
    /// earlier successful rewrite of the same reference.
    pub fn record_unrewritten(&mut self, original: &str) {
        self.entries
            .entry(original.to_string())
            .or_insert(Rewrite::Unchanged);
    }

    pub fn record_blank(&mut self, original: &str) {
        self.entries.insert(original.to_string(), Rewrite::Blank);
    }

    pub fn record_verbatim(&mut self, original: &str, replacement: &str) {
        self.entries.insert(
            original.to_string(),
            Rewrite::Verbatim(replacement.to_string()),
        );
    }

    /// Record a resource pulled in indirectly (from a stylesheet or `srcset`).
    pub fn add_resource(&mut self, local: &str) {
        if !self.resources.iter().any(|r| r == local) {
            self.resources.push(local.to_string());
        }
    }

    #[must_use]
    pub fn get(&self, original: &str) -> Option<&Rewrite> {
        self.entries.get(original)
    }

    /// Local path for `original`, if it was localized.
    #[must_use]
    pub fn local_path(&self, original: &str) -> Option<&str> {
        match self.entries.get(original) {
            Some(Rewrite::Local(local)) => Some(local),
            _ => None,
        }
    }

    /// Archive-relative paths of everything this page depends on, in
    /// first-seen order.
    #[must_use]
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rewrite)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold another page-local map into this one.
    pub fn merge(&mut self, other: Self) {
        for (original, rewrite) in other.entries {
            match rewrite {
                Rewrite::Unchanged => self.record_unrewritten(&original),
                rewrite => {
                    self.entries.insert(original, rewrite);
                }
            }
        }
        for resource in other.resources {
            self.add_resource(&resource);
        }
    }

    /// Apply every rewrite to `html`, matching each reference in all of its
    /// surface forms relative to `page_url`.
    #[must_use]
    pub fn apply(&self, html: &str, page_url: Option<&Url>) -> String {
        let mut html = html.to_string();
        // Longest first, so a reference never clobbers a longer one it prefixes.
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|(original, _)| std::cmp::Reverse(original.len()));

        for (original, rewrite) in entries {
            let (forms, target) = match rewrite {
                Rewrite::Unchanged => continue,
                Rewrite::Local(local) => (surface_forms(original, page_url), local.as_str()),
                Rewrite::Blank => (surface_forms(original, page_url), ""),
                Rewrite::Verbatim(value) => {
                    html = replace_attribute_value(&html, original, value);
                    continue;
                }
            };
            for form in forms {
                html = replace_quoted(&html, &form, target).0;
            }
        }
        html
    }
}

/// Replace a whole quoted attribute value given in decoded form. The value
/// may be spelled with `&amp;` or with its quote character as an entity;
/// the replacement is escaped to stay inside the attribute's quotes.
#[must_use]
pub fn replace_attribute_value(haystack: &str, decoded: &str, replacement: &str) -> String {
    if decoded.is_empty() {
        return haystack.to_string();
    }

    let mut text = haystack.to_string();
    for (quote, entities) in [('"', ["&quot;", "&#34;"]), ('\'', ["&#39;", "&#x27;"])] {
        let mut forms: BTreeMap<String, String> = BTreeMap::new();
        for encode_amp in [false, true] {
            let encode = |value: &str| {
                if encode_amp {
                    value.replace('&', "&amp;")
                } else {
                    value.to_string()
                }
            };
            let form = encode(decoded);
            let target = encode(replacement).replace(quote, entities[0]);

            // The first spelling registered for a form wins.
            if !form.contains(quote) {
                forms.entry(form.clone()).or_insert_with(|| target.clone());
            }
            for entity in entities {
                forms
                    .entry(form.replace(quote, entity))
                    .or_insert_with(|| target.clone());
            }
        }

        for (form, target) in forms {
            let needle = format!("={quote}{form}{quote}");
            if text.contains(&needle) {
                text = text.replace(&needle, &format!("={quote}{target}{quote}"));
            }
        }
    }
    text
}

/// Ways a reference may be spelled in markup: as written, absolute,
/// protocol-relative and (for same-host URLs) path-only, each also with
/// `&` encoded as `&amp;`.
#[must_use]
pub fn surface_forms(original: &str, page_url: Option<&Url>) -> Vec<String> {
    let mut forms = BTreeSet::from([original.to_string()]);

    if let Ok(url) = resolve_reference(original, page_url) {
        let mut path_only = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        if let Some(fragment) = url.fragment() {
            path_only = format!("{path_only}#{fragment}");
        }
        forms.insert(url.to_string());
        if let Some(host) = url.host_str() {
            let authority = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            forms.insert(format!("//{authority}{path_only}"));
        }
        let same_host = page_url
            .is_some_and(|page| page.host_str() == url.host_str() && page.port() == url.port());
        if same_host {
            forms.insert(path_only);
        }
    }

    let encoded: Vec<String> = forms
        .iter()
        .filter(|f| f.contains('&'))
        .map(|f| f.replace('&', "&amp;"))
        .collect();
    forms.extend(encoded);
    forms.into_iter().collect()
}

/// Quoted contexts a reference is replaced in.
const QUOTED_CONTEXTS: &[(&str, &str)] = &[
    ("=\"", "\""),
    ("='", "'"),
    ("url(\"", "\")"),
    ("url('", "')"),
    ("url(", ")"),
];

/// Replace `from` with `to` where it appears as a whole quoted attribute
/// value or `url()` argument. Returns the new text and the replacement count.
#[must_use]
pub fn replace_quoted(haystack: &str, from: &str, to: &str) -> (String, usize) {
    if from.is_empty() || from == to {
        return (haystack.to_string(), 0);
    }

    let mut text = haystack.to_string();
    let mut count = 0;
    for (open, close) in QUOTED_CONTEXTS {
        let needle = format!("{open}{from}{close}");
        let hits = text.matches(&needle).count();
        if hits > 0 {
            text = text.replace(&needle, &format!("{open}{to}{close}"));
            count += hits;
        }
    }
    (text, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_quoted_attributes() {
        let html = r#"<img src="a.png"><img src='a.png'>"#;
        let (out, count) = replace_quoted(html, "a.png", "example.com/a.png");
        assert_eq!(count, 2);
        assert_eq!(
            out,
            r#"<img src="example.com/a.png"><img src='example.com/a.png'>"#
        );
    }

    #[test]
    fn test_replace_quoted_css_urls() {
        let css = r#"a{background:url(a.png)} b{background:url("a.png")} c{background:url('a.png')}"#;
        let (out, count) = replace_quoted(css, "a.png", "x/a.png");
        assert_eq!(count, 3);
        assert_eq!(
            out,
            r#"a{background:url(x/a.png)} b{background:url("x/a.png")} c{background:url('x/a.png')}"#
        );
    }

    #[test]
    fn test_replace_quoted_leaves_text_alone() {
        let html = r#"<p>Download a.png from https://example.com/a.png</p><img src="https://example.com/a.png">"#;
        let (out, count) = replace_quoted(html, "https://example.com/a.png", "example.com/a.png");
        assert_eq!(count, 1);
        assert!(out.contains("<p>Download a.png from https://example.com/a.png</p>"));
        assert!(out.contains(r#"<img src="example.com/a.png">"#));
    }

    #[test]
    fn test_replace_quoted_requires_whole_value() {
        let html = r#"<a href="a.png.html">x</a>"#;
        let (out, count) = replace_quoted(html, "a.png", "b.png");
        assert_eq!(count, 0);
        assert_eq!(out, html);
    }

    #[test]
    fn test_replace_quoted_empty_needle() {
        assert_eq!(replace_quoted("src=\"\"", "", "x"), ("src=\"\"".to_string(), 0));
    }

    #[test]
    fn test_surface_forms() {
        let page = Url::parse("https://example.com/a/index.html").unwrap();
        let forms = surface_forms("https://example.com/b/img.png?x=1&y=2", Some(&page));
        for expected in [
            "https://example.com/b/img.png?x=1&y=2",
            "//example.com/b/img.png?x=1&y=2",
            "/b/img.png?x=1&y=2",
            "/b/img.png?x=1&amp;y=2",
        ] {
            assert!(forms.iter().any(|f| f == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_surface_forms_other_host_has_no_path_only_form() {
        let page = Url::parse("https://example.com/a/index.html").unwrap();
        let forms = surface_forms("https://cdn.net/lib.js", Some(&page));
        assert!(!forms.iter().any(|f| f == "/lib.js"));
        assert!(forms.iter().any(|f| f == "//cdn.net/lib.js"));
    }

    #[test]
    fn test_unrewritten_never_overrides_rewrite() {
        let mut map = RewriteMap::new();
        map.record_rewrite("a.png", "example.com/a.png");
        map.record_unrewritten("a.png");
        assert_eq!(map.local_path("a.png"), Some("example.com/a.png"));

        map.record_unrewritten("b.png");
        assert_eq!(map.get("b.png"), Some(&Rewrite::Unchanged));
        assert_eq!(map.resources(), ["example.com/a.png"]);
    }

    #[test]
    fn test_resources_are_deduplicated_in_order() {
        let mut map = RewriteMap::new();
        map.record_rewrite("/b.css", "example.com/b.css");
        map.add_resource("example.com/font.woff");
        map.record_rewrite("https://example.com/b.css", "example.com/b.css");
        assert_eq!(
            map.resources(),
            ["example.com/b.css", "example.com/font.woff"]
        );
    }

    #[test]
    fn test_verbatim_matches_encoded_ampersands() {
        let mut map = RewriteMap::new();
        map.record_verbatim("a.png?x=1&y=2 1x", "example.com/a_x_1_y_2.png 1x");

        let html = r#"<img srcset="a.png?x=1&amp;y=2 1x">"#;
        assert_eq!(
            map.apply(html, None),
            r#"<img srcset="example.com/a_x_1_y_2.png 1x">"#
        );
    }

    #[test]
    fn test_replace_attribute_value_escapes_quotes() {
        let decoded = r#"background:url("tile.png")"#;
        let replacement = r#"background:url("example.com/tile.png")"#;

        let html = r#"<div style="background:url(&quot;tile.png&quot;)"></div>"#;
        assert_eq!(
            replace_attribute_value(html, decoded, replacement),
            r#"<div style="background:url(&quot;example.com/tile.png&quot;)"></div>"#
        );

        let html = r#"<div style='background:url("tile.png")'></div>"#;
        assert_eq!(
            replace_attribute_value(html, decoded, replacement),
            r#"<div style='background:url("example.com/tile.png")'></div>"#
        );

        let html = r#"<div style="background:url(tile.png)"></div>"#;
        assert_eq!(
            replace_attribute_value(html, "background:url(tile.png)", replacement),
            r#"<div style="background:url(&quot;example.com/tile.png&quot;)"></div>"#
        );
    }

    #[test]
    fn test_apply() {
        let page = Url::parse("https://example.com/a/index.html").unwrap();
        let mut map = RewriteMap::new();
        map.record_rewrite("/b/img.png", "example.com/b/img.png");
        map.record_blank("https://ads.example.net/track.js");
        map.record_unrewritten("https://broken.example.org/x.png");
        map.record_verbatim("s.png 1x, t.png 2x", "example.com/a/s.png 1x, example.com/a/t.png 2x");

        let html = concat!(
            r#"<img src="/b/img.png"><img src="https://example.com/b/img.png">"#,
            r#"<script src="https://ads.example.net/track.js"></script>"#,
            r#"<img src="https://broken.example.org/x.png">"#,
            r#"<img srcset="s.png 1x, t.png 2x">"#,
            "<p>/b/img.png</p>",
        );
        let out = map.apply(html, Some(&page));

        assert_eq!(out.matches(r#"src="example.com/b/img.png""#).count(), 2);
        assert!(out.contains(r#"<script src=""></script>"#));
        assert!(out.contains(r#"src="https://broken.example.org/x.png""#));
        assert!(out.contains(r#"srcset="example.com/a/s.png 1x, example.com/a/t.png 2x""#));
        assert!(out.contains("<p>/b/img.png</p>"));
    }
}
