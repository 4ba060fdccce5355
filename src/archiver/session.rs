//! Crawl sessions: archive pages, follow links, remember what was done.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use super::assets::{download_file, AssetRewriter, RewriteOptions};
use super::cache::{ArchiveCache, ArchivedPage};
use super::links::{eligible_links, LinkPolicy, LinkTarget};
use super::paths::{page_index_path, PathMapper};
use super::rewrite::RewriteMap;
use crate::error::{io_at, ArchiveError, Result};
use crate::fetch::{Fetcher, RenderMode};
use crate::journal::FailureJournal;
use crate::retry::RetryPolicy;

/// How pages are loaded and rewritten for a session.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Render pages with JavaScript before archiving.
    pub render_js: bool,
    /// Fail on render timeouts instead of retrying with lenient idle.
    pub strict: bool,
    pub rewrite: RewriteOptions,
    /// Retry policy for [`SiteArchiver::first_iframe_source`].
    pub caller_retry: RetryPolicy,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            render_js: false,
            strict: false,
            rewrite: RewriteOptions::default(),
            caller_retry: RetryPolicy::caller(),
        }
    }
}

/// One crawl over an archive root.
///
/// Owns the archive index and the set of URLs visited so far, so two
/// sessions never share crawl state.
pub struct SiteArchiver {
    root: PathBuf,
    fetcher: Arc<Fetcher>,
    cache: ArchiveCache,
    visited: HashSet<String>,
    /// Visited URLs that produced no archived page.
    failed: HashSet<String>,
    options: ArchiveOptions,
    journal: FailureJournal,
}

impl SiteArchiver {
    /// Open a session on `root`, loading its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or its index is
    /// unreadable.
    pub async fn open(
        root: impl Into<PathBuf>,
        fetcher: Arc<Fetcher>,
        options: ArchiveOptions,
    ) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(io_at(&root))?;
        let cache = ArchiveCache::load(&root).await?;
        let journal = FailureJournal::new(&root);

        info!(root = %root.display(), pages = cache.len(), "Opened archive");
        Ok(Self {
            root,
            fetcher,
            cache,
            visited: HashSet::new(),
            failed: HashSet::new(),
            options,
            journal,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ArchiveCache {
        &mut self.cache
    }

    #[must_use]
    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    #[must_use]
    pub fn journal(&self) -> &FailureJournal {
        &self.journal
    }

    /// URLs archived (or attempted) in this session.
    #[must_use]
    pub fn visited(&self) -> &HashSet<String> {
        &self.visited
    }

    /// Cached metadata for `url`, archiving it first if it is missing or
    /// `refresh` is set. The index is saved after every archive.
    ///
    /// # Errors
    ///
    /// Returns fetch, path or I/O errors from archiving `url` itself.
    /// Failures on linked pages are journaled instead.
    pub async fn get_page(
        &mut self,
        url: &str,
        refresh: bool,
        policy: Option<&LinkPolicy>,
    ) -> Result<Option<ArchivedPage>> {
        if !refresh {
            if let Some(page) = self.cache.get(url) {
                debug!(url = %url, "Page already archived");
                self.visited.insert(url.to_string());
                return Ok(Some(page.clone()));
            }
        }

        let page = match self.archive_page(url, refresh, policy).await {
            Ok(Some(page)) => page,
            Ok(None) => {
                self.failed.insert(url.to_string());
                return Ok(None);
            }
            Err(e) => {
                self.failed.insert(url.to_string());
                return Err(e);
            }
        };
        self.failed.remove(url);
        self.cache.insert(url, page.clone());
        self.cache.save().await?;
        Ok(Some(page))
    }

    /// Archive `url` and its assets, recursing into links per `policy`.
    ///
    /// Returns `None` when the page has no content.
    ///
    /// # Errors
    ///
    /// Returns fetch, path or I/O errors.
    pub async fn archive_page(
        &mut self,
        url: &str,
        refresh: bool,
        policy: Option<&LinkPolicy>,
    ) -> Result<Option<ArchivedPage>> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_at(&self.root))?;
        self.visited.insert(url.to_string());

        let mode = if self.options.render_js {
            RenderMode::Javascript {
                strict: self.options.strict,
            }
        } else {
            RenderMode::Plain
        };
        let fetched = self.fetcher.fetch(url, mode, true).await?;
        if fetched.is_empty() || !fetched.is_success() {
            warn!(url = %url, status = fetched.status, "Page has no content to archive");
            return Ok(None);
        }

        let page_url = Url::parse(&fetched.final_url).map_err(|source| ArchiveError::InvalidUrl {
            url: fetched.final_url.clone(),
            source,
        })?;
        let index_path = page_index_path(&page_url)?;
        self.visited.insert(page_url.to_string());
        let base_url = base_url_of(&page_url);
        let html = fetched.text();

        info!(url = %page_url, "Archiving page");

        let fetcher = Arc::clone(&self.fetcher);
        let rewritten = {
            let mut mapper = PathMapper::new(&fetcher, &self.root, page_url.clone());
            AssetRewriter::new(&fetcher, &self.options.rewrite, &self.root, &base_url)
                .rewrite(&html, &mut mapper)
                .await?
        };
        let mut rewrites = rewritten.rewrites;
        let mut html = rewritten.html;

        if let Some(policy) = policy.filter(|p| p.levels > 0) {
            let links = self.crawl_links(&html, &page_url, refresh, policy).await?;
            html = links.apply(&html, Some(&page_url));
            rewrites.merge(links);
        }

        let target = self.root.join(&index_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_at(parent))?;
        }
        tokio::fs::write(&target, html.as_bytes())
            .await
            .map_err(io_at(&target))?;

        info!(
            url = %page_url,
            path = %target.display(),
            resources = rewrites.resources().len(),
            "Archived page"
        );

        Ok(Some(ArchivedPage {
            url: page_url.to_string(),
            cookies: fetched.cookies,
            index_path,
            resources: rewrites.resources().to_vec(),
        }))
    }

    /// Follow eligible links depth-first. Linked pages and their resources
    /// become resources of the linking page, so its bundle is navigable.
    async fn crawl_links(
        &mut self,
        html: &str,
        page_url: &Url,
        refresh: bool,
        policy: &LinkPolicy,
    ) -> Result<RewriteMap> {
        let mut links = RewriteMap::new();
        let child_policy = policy.descend();
        let mut this_page = page_url.clone();
        this_page.set_fragment(None);

        for link in eligible_links(html, page_url, policy) {
            if link.url == this_page {
                continue;
            }
            let local = match link.target {
                LinkTarget::Page => {
                    if self.failed.contains(link.url.as_str()) {
                        None
                    } else if self.visited.contains(link.url.as_str()) {
                        // Already archived (or in progress) this session.
                        match self.cache.get(link.url.as_str()) {
                            Some(page) => Some(page.index_path.clone()),
                            None => page_index_path(&link.url).ok(),
                        }
                    } else {
                        match Box::pin(self.get_page(link.url.as_str(), refresh, Some(&child_policy)))
                            .await
                        {
                            Ok(Some(page)) => {
                                links.add_resource(&page.index_path);
                                for resource in &page.resources {
                                    links.add_resource(resource);
                                }
                                Some(page.index_path)
                            }
                            Ok(None) => {
                                warn!(url = %link.url, "Linked page has no content to archive");
                                self.journal
                                    .record_or_warn(link.url.as_str(), &"page returned no content")
                                    .await;
                                None
                            }
                            Err(e) => {
                                warn!(url = %link.url, "Failed to archive linked page: {e}");
                                self.journal.record_or_warn(link.url.as_str(), &e).await;
                                None
                            }
                        }
                    }
                }
                LinkTarget::File => {
                    let fetcher = Arc::clone(&self.fetcher);
                    let mut mapper = PathMapper::new(&fetcher, &self.root, page_url.clone());
                    match download_file(&fetcher, &link.url, &self.root, &mut mapper).await {
                        Ok(Some(local)) => {
                            links.add_resource(&local);
                            Some(local)
                        }
                        Ok(None) => None,
                        Err(e @ ArchiveError::PathEscape { .. }) => return Err(e),
                        Err(e) => {
                            warn!(url = %link.url, "Failed to download linked file: {e}");
                            self.journal.record_or_warn(link.url.as_str(), &e).await;
                            None
                        }
                    }
                }
            };

            match local {
                Some(local) => {
                    let local = match &link.fragment {
                        Some(fragment) => format!("{local}#{fragment}"),
                        None => local,
                    };
                    links.record_link(&link.raw, &local);
                }
                None => links.record_unrewritten(&link.raw),
            }
        }

        Ok(links)
    }

    /// Absolute URL of the first `<iframe>` on `url`, retried while the
    /// page is still rendering it in.
    ///
    /// # Errors
    ///
    /// Returns the last fetch or render error once the retry budget is spent.
    pub async fn first_iframe_source(&self, url: &str) -> Result<Url> {
        let render_js = self.options.render_js;
        let mode = if render_js {
            RenderMode::Javascript {
                strict: self.options.strict,
            }
        } else {
            RenderMode::Plain
        };

        self.options
            .caller_retry
            .run(
                url,
                |attempt| async move {
                    debug!(url = %url, attempt, "Looking for iframe");
                    let fetched = self.fetcher.fetch(url, mode, true).await?;
                    let base = Url::parse(&fetched.final_url).map_err(|source| {
                        ArchiveError::InvalidUrl {
                            url: fetched.final_url.clone(),
                            source,
                        }
                    })?;
                    let src = first_iframe(&fetched.text()).ok_or_else(|| ArchiveError::Render {
                        url: url.to_string(),
                        message: "page has no iframe".to_string(),
                    })?;
                    base.join(&src).map_err(|source| ArchiveError::InvalidUrl { url: src, source })
                },
                |e| {
                    e.is_retryable()
                        || (render_js
                            && matches!(
                                e,
                                ArchiveError::Render { .. } | ArchiveError::RenderTimeout { .. }
                            ))
                },
            )
            .await
    }

    /// Bundle resources shared by at least `count_threshold` pages.
    ///
    /// # Errors
    ///
    /// See [`ArchiveCache::create_dependency_zip`].
    pub async fn create_dependency_zip(&self, count_threshold: usize, out: &Path) -> Result<bool> {
        self.cache.create_dependency_zip(count_threshold, out).await
    }

    /// Package an archived page as a standalone zip rooted at `index.html`.
    ///
    /// # Errors
    ///
    /// See [`ArchiveCache::export_page_as_zip`].
    pub async fn export_page_as_zip(&self, url: &str, out: &Path) -> Result<()> {
        self.cache.export_page_as_zip(url, out).await
    }
}

fn first_iframe(html: &str) -> Option<String> {
    static IFRAME: std::sync::LazyLock<Selector> =
        std::sync::LazyLock::new(|| Selector::parse("iframe[src]").unwrap());
    let document = Html::parse_document(html);
    document
        .select(&IFRAME)
        .find_map(|element| element.value().attr("src"))
        .map(str::to_string)
}

/// Page URL truncated after its last `/`, without query or fragment.
#[must_use]
pub fn base_url_of(page_url: &Url) -> Url {
    let mut base = page_url.clone();
    base.set_query(None);
    base.set_fragment(None);
    let path = base.path();
    let dir = path.rfind('/').map_or("/", |idx| &path[..=idx]).to_string();
    base.set_path(&dir);
    base
}
