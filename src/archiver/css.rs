//! CSS `url()` scanning.

use regex::{Captures, Regex};

static CSS_URL: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r#"url\(\s*['"]?(.*?)['"]?\s*\)"#).unwrap());

/// Distinct, non-empty `url()` arguments in `css`, in order of appearance.
#[must_use]
pub fn css_references(css: &str) -> Vec<String> {
    let mut references: Vec<String> = Vec::new();
    for caps in CSS_URL.captures_iter(css) {
        let value = caps[1].trim();
        if !value.is_empty() && !references.iter().any(|r| r == value) {
            references.push(value.to_string());
        }
    }
    references
}

/// Rewrite every `url()` whose argument `replace` maps to a new value.
///
/// Replacements are written quoted as `url("…")`; an empty replacement
/// becomes `url()`. Unmapped tokens are left exactly as written.
pub fn rewrite_css_urls<F>(css: &str, mut replace: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    CSS_URL
        .replace_all(css, |caps: &Captures<'_>| match replace(caps[1].trim()) {
            Some(value) if value.is_empty() => "url()".to_string(),
            Some(value) => format!("url(\"{value}\")"),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Whether a CSS reference is the `//localhost` placeholder some builds
/// leave behind.
#[must_use]
pub fn is_localhost_sentinel(reference: &str) -> bool {
    reference.starts_with("//localhost")
}

/// Resolve a reference found in an archived stylesheet against the
/// stylesheet's own archive-relative path.
///
/// Returns `None` for absolute URLs, `data:` URIs, and paths that would
/// climb above the archive root.
#[must_use]
pub fn resolve_local(stylesheet: &str, reference: &str) -> Option<String> {
    if reference.is_empty() || reference.starts_with("data:") || reference.contains("://") {
        return None;
    }
    if reference.starts_with('/') {
        return None;
    }

    let mut parts: Vec<&str> = stylesheet.split('/').collect();
    parts.pop();
    for segment in reference.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            segment => parts.push(segment),
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}
