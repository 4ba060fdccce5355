//! Static asset discovery, download and reference rewriting.
//!
//! References are collected from the parsed document up front; the parsed
//! document is dropped before any download starts, then the raw markup is
//! rewritten textually through a [`RewriteMap`].

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use super::css::{self, css_references, is_localhost_sentinel, rewrite_css_urls};
use super::paths::{relative_path, resolve_reference, FilenameDeriver};
use super::rewrite::RewriteMap;
use crate::error::{io_at, ArchiveError, Result};
use crate::fetch::{Fetcher, RenderMode};

/// Rewrites the text of a downloaded script or stylesheet.
pub trait ContentTransform: Send + Sync {
    fn transform(&self, content: &str, url: &Url) -> String;
}

/// Decides whether a referencing element keeps its asset. Rejected
/// references are blanked.
pub trait NodeFilter: Send + Sync {
    fn accept(&self, reference: &AssetReference) -> bool;
}

/// Replaces `https://` literals with `//`-relative ones, so scripts stop
/// loading remote content when served from an offline copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct StripAbsoluteUrls;

impl ContentTransform for StripAbsoluteUrls {
    fn transform(&self, content: &str, _url: &Url) -> String {
        content.replace("https://", "//")
    }
}

/// An asset reference found in markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReference {
    /// Element name, e.g. `img`.
    pub tag: String,
    /// Attribute name, e.g. `src`.
    pub attribute: String,
    /// Attribute value as written (entities decoded).
    pub value: String,
}

impl AssetReference {
    fn kind(&self) -> AssetKind {
        match self.tag.as_str() {
            "link" => AssetKind::Stylesheet,
            "script" => AssetKind::Script,
            _ => AssetKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetKind {
    Stylesheet,
    Script,
    Other,
}

impl AssetKind {
    fn from_url(url: &Url) -> Self {
        let path = url.path().to_lowercase();
        if path.ends_with(".css") {
            Self::Stylesheet
        } else if path.ends_with(".js") {
            Self::Script
        } else {
            Self::Other
        }
    }
}

/// Asset rewriting knobs.
#[derive(Clone, Default)]
pub struct RewriteOptions {
    /// Case-insensitive substrings; matching URLs are blanked, never fetched.
    pub blocklist: Vec<String>,
    pub js_transform: Option<Arc<dyn ContentTransform>>,
    pub css_transform: Option<Arc<dyn ContentTransform>>,
    pub node_filter: Option<Arc<dyn NodeFilter>>,
}

impl RewriteOptions {
    #[must_use]
    pub fn is_blocked(&self, url: &str) -> bool {
        let url = url.to_lowercase();
        self.blocklist
            .iter()
            .filter(|entry| !entry.is_empty())
            .any(|entry| url.contains(&entry.to_lowercase()))
    }
}

impl fmt::Debug for RewriteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewriteOptions")
            .field("blocklist", &self.blocklist)
            .field("js_transform", &self.js_transform.is_some())
            .field("css_transform", &self.css_transform.is_some())
            .field("node_filter", &self.node_filter.is_some())
            .finish()
    }
}

/// Markup with its references rewritten.
#[derive(Debug, Clone)]
pub struct RewrittenDocument {
    pub html: String,
    pub rewrites: RewriteMap,
}

impl RewrittenDocument {
    #[must_use]
    pub fn resources(&self) -> &[String] {
        self.rewrites.resources()
    }
}

/// References pulled out of a document before any I/O happens.
#[derive(Debug, Default)]
struct Collected {
    references: Vec<AssetReference>,
    /// `<style>` bodies, exactly as they appear in the markup.
    style_blocks: Vec<String>,
    /// `style` attribute values (entities decoded).
    style_attributes: Vec<String>,
    /// Bodies of `<script>` elements without `src`.
    inline_scripts: Vec<String>,
}

/// Outcome of localizing one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Localized {
    /// Not a fetchable reference (`data:`, empty, non-HTTP scheme).
    Skipped,
    Blanked,
    Failed,
    Local(String),
}

/// Per-document mutable state threaded through the download recursion.
struct RewriteState<'d> {
    deriver: &'d mut dyn FilenameDeriver,
    map: RewriteMap,
    /// Stylesheets currently being rewritten, to break `@import` cycles.
    in_progress: HashSet<String>,
}

/// Downloads a document's assets and rewrites its references.
pub struct AssetRewriter<'a> {
    fetcher: &'a Fetcher,
    options: &'a RewriteOptions,
    destination: &'a Path,
    base_url: &'a Url,
}

impl<'a> AssetRewriter<'a> {
    /// `destination` is the directory derived paths are relative to;
    /// references in the document resolve against `base_url`.
    #[must_use]
    pub fn new(
        fetcher: &'a Fetcher,
        options: &'a RewriteOptions,
        destination: &'a Path,
        base_url: &'a Url,
    ) -> Self {
        Self {
            fetcher,
            options,
            destination,
            base_url,
        }
    }

    /// Download every asset `html` references and point the references at
    /// the local copies.
    ///
    /// Failures on individual assets are logged and leave that reference
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::PathEscape`] if a derived path leaves its
    /// domain directory, or an I/O error if a downloaded asset cannot be
    /// written.
    pub async fn rewrite(
        &self,
        html: &str,
        deriver: &mut dyn FilenameDeriver,
    ) -> Result<RewrittenDocument> {
        let collected = collect_references(html);
        debug!(
            base_url = %self.base_url,
            references = collected.references.len(),
            style_blocks = collected.style_blocks.len(),
            style_attributes = collected.style_attributes.len(),
            "Collected asset references"
        );

        let mut state = RewriteState {
            deriver,
            map: RewriteMap::new(),
            in_progress: HashSet::new(),
        };

        for reference in &collected.references {
            if let Some(filter) = &self.options.node_filter {
                if !filter.accept(reference) {
                    debug!(tag = %reference.tag, value = %reference.value, "Reference rejected by node filter");
                    state.map.record_blank(&reference.value);
                    continue;
                }
            }

            if reference.attribute == "srcset" {
                self.rewrite_srcset(&reference.value, &mut state).await?;
                continue;
            }

            match self
                .localize(&reference.value, self.base_url, reference.kind(), &mut state)
                .await?
            {
                Localized::Local(local) => state.map.record_rewrite(&reference.value, &local),
                Localized::Blanked => state.map.record_blank(&reference.value),
                Localized::Failed => state.map.record_unrewritten(&reference.value),
                Localized::Skipped => {}
            }
        }

        let mut style_blocks = Vec::new();
        for block in &collected.style_blocks {
            let css = match &self.options.css_transform {
                Some(transform) => transform.transform(block, self.base_url),
                None => block.clone(),
            };
            let rewritten = self
                .rewrite_stylesheet(&css, self.base_url, None, &mut state)
                .await?;
            if rewritten != *block {
                style_blocks.push((block, rewritten));
            }
        }
        for style in &collected.style_attributes {
            let rewritten = self
                .rewrite_stylesheet(style, self.base_url, None, &mut state)
                .await?;
            if rewritten != *style {
                state.map.record_verbatim(style, &rewritten);
            }
        }

        let mut html = html.to_string();
        for (block, rewritten) in style_blocks {
            html = html.replace(block.as_str(), &rewritten);
        }
        if let Some(transform) = &self.options.js_transform {
            for script in &collected.inline_scripts {
                let transformed = transform.transform(script, self.base_url);
                if transformed != *script {
                    html = html.replacen(script.as_str(), &transformed, 1);
                }
            }
        }

        let html = state.map.apply(&html, Some(self.base_url));
        Ok(RewrittenDocument {
            html,
            rewrites: state.map,
        })
    }

    async fn rewrite_srcset(&self, value: &str, state: &mut RewriteState<'_>) -> Result<()> {
        if value.trim_start().starts_with("data:") {
            return Ok(());
        }

        let mut candidates = Vec::new();
        let mut changed = false;
        for candidate in value.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            let (url, descriptor) = candidate
                .split_once(char::is_whitespace)
                .map_or((candidate, ""), |(u, d)| (u, d.trim()));

            let replacement = match self
                .localize(url, self.base_url, AssetKind::Other, state)
                .await?
            {
                Localized::Local(local) => {
                    state.map.add_resource(&local);
                    changed = true;
                    Some(local)
                }
                Localized::Blanked => {
                    changed = true;
                    None
                }
                Localized::Failed | Localized::Skipped => Some(url.to_string()),
            };

            if let Some(replacement) = replacement {
                candidates.push(if descriptor.is_empty() {
                    replacement
                } else {
                    format!("{replacement} {descriptor}")
                });
            }
        }

        if changed {
            state.map.record_verbatim(value, &candidates.join(", "));
        }
        Ok(())
    }

    /// Resolve, download (when missing) and transform one reference.
    async fn localize(
        &self,
        raw: &str,
        base: &Url,
        kind: AssetKind,
        state: &mut RewriteState<'_>,
    ) -> Result<Localized> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("data:") || raw.starts_with('#') {
            return Ok(Localized::Skipped);
        }
        if self.options.is_blocked(raw) {
            debug!(url = %raw, "Blocked asset reference");
            return Ok(Localized::Blanked);
        }

        let url = match resolve_reference(raw, Some(base)) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(_) => return Ok(Localized::Skipped),
            Err(e) => {
                warn!(url = %raw, "Unresolvable asset reference: {e}");
                return Ok(Localized::Failed);
            }
        };
        if self.options.is_blocked(url.as_str()) {
            debug!(url = %url, "Blocked asset reference");
            return Ok(Localized::Blanked);
        }

        let relative = match state.deriver.derive(&url).await {
            Ok(relative) => relative,
            Err(e @ ArchiveError::PathEscape { .. }) => return Err(e),
            Err(e) => {
                warn!(url = %url, "Failed to derive asset path: {e}");
                return Ok(Localized::Failed);
            }
        };
        let target = self.destination.join(&relative);

        if state.in_progress.contains(&relative) {
            return Ok(Localized::Local(relative));
        }

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!(url = %url, path = %target.display(), "Asset already downloaded");
            if kind == AssetKind::Stylesheet {
                self.rescan_stylesheet(&target, &relative, &mut state.map)
                    .await;
            }
            return Ok(Localized::Local(relative));
        }

        let fetched = match self.fetcher.fetch(url.as_str(), RenderMode::Plain, false).await {
            Ok(fetched) if fetched.is_success() => fetched,
            Ok(fetched) => {
                warn!(url = %url, status = fetched.status, "Asset not downloaded");
                return Ok(Localized::Failed);
            }
            Err(e) => {
                warn!(url = %url, "Failed to download asset: {e}");
                return Ok(Localized::Failed);
            }
        };

        let body = match kind {
            AssetKind::Stylesheet => {
                let mut text = fetched.text();
                if let Some(transform) = &self.options.css_transform {
                    text = transform.transform(&text, &url);
                }
                state.in_progress.insert(relative.clone());
                let rewritten =
                    Box::pin(self.rewrite_stylesheet(&text, &url, Some(&relative), state)).await;
                state.in_progress.remove(&relative);
                rewritten?.into_bytes()
            }
            AssetKind::Script => match &self.options.js_transform {
                Some(transform) => transform.transform(&fetched.text(), &url).into_bytes(),
                None => fetched.body,
            },
            AssetKind::Other => fetched.body,
        };

        write_file(&target, &body).await?;
        info!(url = %url, path = %target.display(), "Downloaded asset");
        Ok(Localized::Local(relative))
    }

    /// Localize every `url()` in a stylesheet, writing references relative
    /// to the stylesheet's own location. Inline CSS (`css_relative` of
    /// `None`) gets archive-root-relative references like the rest of the
    /// page.
    async fn rewrite_stylesheet(
        &self,
        css: &str,
        css_url: &Url,
        css_relative: Option<&str>,
        state: &mut RewriteState<'_>,
    ) -> Result<String> {
        let mut replacements = Vec::new();
        for value in css_references(css) {
            if value.starts_with("data:") {
                continue;
            }
            if is_localhost_sentinel(&value) {
                replacements.push((value, String::new()));
                continue;
            }
            let kind = resolve_reference(&value, Some(css_url))
                .map_or(AssetKind::Other, |url| AssetKind::from_url(&url));
            match self.localize(&value, css_url, kind, state).await? {
                Localized::Local(local) => {
                    state.map.add_resource(&local);
                    let reference = match css_relative {
                        Some(css_relative) => relative_path(css_relative, &local),
                        None => local,
                    };
                    replacements.push((value, reference));
                }
                Localized::Blanked => replacements.push((value, String::new())),
                Localized::Failed | Localized::Skipped => {}
            }
        }

        Ok(rewrite_css_urls(css, |value| {
            replacements
                .iter()
                .find(|(original, _)| original == value)
                .map(|(_, replacement)| replacement.clone())
        }))
    }

    /// Record the resources an already-archived stylesheet points at, so a
    /// re-run reports the same resource list as the first run.
    async fn rescan_stylesheet(&self, target: &Path, relative: &str, map: &mut RewriteMap) {
        let css = match tokio::fs::read_to_string(target).await {
            Ok(css) => css,
            Err(e) => {
                debug!(path = %target.display(), "Could not rescan stylesheet: {e}");
                return;
            }
        };
        for value in css_references(&css) {
            let Some(local) = css::resolve_local(relative, &value) else {
                continue;
            };
            if tokio::fs::try_exists(self.destination.join(&local))
                .await
                .unwrap_or(false)
            {
                map.add_resource(&local);
            }
        }
    }
}

/// Download `url` to `destination/{derived path}` unless it already exists.
///
/// Returns the derived path, or `None` when the server answered with a
/// non-200 status.
///
/// # Errors
///
/// Returns fetch, path or I/O errors.
pub async fn download_file(
    fetcher: &Fetcher,
    url: &Url,
    destination: &Path,
    deriver: &mut dyn FilenameDeriver,
) -> Result<Option<String>> {
    let relative = deriver.derive(url).await?;
    let target = destination.join(&relative);
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        debug!(url = %url, path = %target.display(), "File already downloaded");
        return Ok(Some(relative));
    }

    let fetched = fetcher.fetch(url.as_str(), RenderMode::Plain, false).await?;
    if !fetched.is_success() {
        return Ok(None);
    }
    write_file(&target, &fetched.body).await?;
    info!(url = %url, path = %target.display(), "Downloaded file");
    Ok(Some(relative))
}

async fn write_file(target: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_at(parent))?;
    }
    tokio::fs::write(target, body).await.map_err(io_at(target))
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

static ASSET_SELECTORS: std::sync::LazyLock<Vec<(Selector, &'static str, &'static str)>> =
    std::sync::LazyLock::new(|| {
        vec![
            (selector("img[src]"), "img", "src"),
            (selector("img[srcset]"), "img", "srcset"),
            (selector("link[href]"), "link", "href"),
            (selector("script[src]"), "script", "src"),
            (selector("source[src]"), "source", "src"),
            (selector("source[srcset]"), "source", "srcset"),
        ]
    });

static STYLE_ELEMENTS: std::sync::LazyLock<Selector> =
    std::sync::LazyLock::new(|| selector("style"));
static STYLE_ATTRIBUTES: std::sync::LazyLock<Selector> =
    std::sync::LazyLock::new(|| selector("[style]"));
static INLINE_SCRIPTS: std::sync::LazyLock<Selector> =
    std::sync::LazyLock::new(|| selector("script:not([src])"));

/// Whether a `<link>` element pulls in a stylesheet.
fn is_stylesheet_link(rel: Option<&str>, href: &str) -> bool {
    let rel_says_stylesheet = rel.is_some_and(|rel| {
        rel.split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case("stylesheet"))
    });
    let path = href.split(['?', '#']).next().unwrap_or(href);
    rel_says_stylesheet || path.to_lowercase().ends_with(".css")
}

fn collect_references(html: &str) -> Collected {
    let document = Html::parse_document(html);
    let mut collected = Collected::default();

    for (selector, tag, attribute) in ASSET_SELECTORS.iter() {
        for element in document.select(selector) {
            let Some(value) = element.value().attr(attribute) else {
                continue;
            };
            if *tag == "link" && !is_stylesheet_link(element.value().attr("rel"), value) {
                continue;
            }
            let reference = AssetReference {
                tag: (*tag).to_string(),
                attribute: (*attribute).to_string(),
                value: value.to_string(),
            };
            if !collected.references.contains(&reference) {
                collected.references.push(reference);
            }
        }
    }

    for element in document.select(&STYLE_ELEMENTS) {
        let text: String = element.text().collect();
        if !text.trim().is_empty() && !collected.style_blocks.contains(&text) {
            collected.style_blocks.push(text);
        }
    }
    for element in document.select(&STYLE_ATTRIBUTES) {
        if let Some(style) = element.value().attr("style") {
            if !style.trim().is_empty() && !collected.style_attributes.iter().any(|s| s == style) {
                collected.style_attributes.push(style.to_string());
            }
        }
    }
    for element in document.select(&INLINE_SCRIPTS) {
        let text: String = element.text().collect();
        if !text.trim().is_empty() {
            collected.inline_scripts.push(text);
        }
    }

    collected
}
