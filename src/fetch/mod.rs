//! Single-resource fetching: HTTP(S), JavaScript rendering, and local files.
//!
//! Plain HTTP requests are retried with linear backoff and successful
//! responses are cached with no expiry, so fetching the same URL twice in a
//! crawl costs one request.

pub mod cache;
pub mod host_limits;
pub mod render;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::constants::{ARCHIVAL_USER_AGENT, PARALLEL_BATCH_SIZE};
use crate::error::{io_at, ArchiveError, Result};
use crate::retry::RetryPolicy;

pub use cache::ResponseCache;
pub use host_limits::HostLimits;
pub use render::{ChromiumConfig, ChromiumRenderer, RenderBackend, Rendered, Renderer};

/// Default timeout for a single HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default timeout for a JavaScript render.
pub const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 30;

/// Concurrent requests per host allowed by [`Fetcher::fetch_in_parallel`].
pub const DEFAULT_PER_DOMAIN_CONCURRENCY: usize = 4;

/// A fetched resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fetched {
    /// URL (or path) that was requested.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    /// Media type without parameters, e.g. `text/css`.
    pub content_type: Option<String>,
    /// Cookies set while fetching.
    pub cookies: BTreeMap<String, String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl Fetched {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// How a page should be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Plain HTTP GET.
    Plain,
    /// Render with JavaScript. Unless `strict`, a render timeout is retried
    /// once with the lenient idle heuristic.
    Javascript { strict: bool },
}

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub request_timeout: Duration,
    pub render_timeout: Duration,
    pub retry: RetryPolicy,
    /// Raise [`ArchiveError::UnexpectedStatus`] instead of returning non-200
    /// responses.
    pub strict_status: bool,
    /// On-disk response cache. `None` caches in memory only.
    pub cache_dir: Option<PathBuf>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            render_timeout: Duration::from_secs(DEFAULT_RENDER_TIMEOUT_SECS),
            retry: RetryPolicy::fetch(),
            strict_status: false,
            cache_dir: None,
        }
    }
}

/// Fetches pages and assets for the archiver.
pub struct Fetcher {
    client: Client,
    options: FetchOptions,
    cache: ResponseCache,
    /// Session cookies per host, fed back on later requests.
    cookies: Mutex<HashMap<String, BTreeMap<String, String>>>,
    renderer: Option<Arc<dyn Renderer>>,
}

impl Fetcher {
    /// Create a fetcher without a JavaScript renderer.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(options: FetchOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .user_agent(ARCHIVAL_USER_AGENT)
            .build()
            .map_err(|source| ArchiveError::Fetch {
                url: String::new(),
                source,
            })?;

        let cache = ResponseCache::new(options.cache_dir.clone());

        Ok(Self {
            client,
            options,
            cache,
            cookies: Mutex::new(HashMap::new()),
            renderer: None,
        })
    }

    /// Attach the renderer used for [`RenderMode::Javascript`] fetches.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    #[must_use]
    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    #[must_use]
    pub fn has_renderer(&self) -> bool {
        self.renderer.is_some()
    }

    /// Fetch a URL, or read a local file when `url` is not an HTTP(S) URL.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Fetch`] once retries are exhausted,
    /// [`ArchiveError::UnexpectedStatus`] for non-200 responses in strict
    /// mode, or a render error for JavaScript fetches.
    pub async fn fetch(&self, url: &str, mode: RenderMode, clear_cookies: bool) -> Result<Fetched> {
        if !is_remote(url) {
            return self.read_local(url).await;
        }

        match mode {
            RenderMode::Plain => self.get(url, clear_cookies).await,
            RenderMode::Javascript { strict } => self.render(url, strict).await,
        }
    }

    /// Plain GET through the response cache.
    ///
    /// # Errors
    ///
    /// See [`Fetcher::fetch`].
    pub async fn get(&self, url: &str, clear_cookies: bool) -> Result<Fetched> {
        if clear_cookies {
            self.clear_cookies();
        }

        if let Some(hit) = self.cache.get(url).await {
            debug!(url = %url, "Response cache hit");
            return Ok(hit);
        }

        let fetched = self
            .options
            .retry
            .run(url, |_| self.get_once(url), ArchiveError::is_retryable)
            .await?;

        if !fetched.is_success() {
            error!(url = %url, status = fetched.status, "Unexpected status while downloading");
            if self.options.strict_status {
                return Err(ArchiveError::UnexpectedStatus {
                    url: url.to_string(),
                    status: fetched.status,
                });
            }
            return Ok(fetched);
        }

        if let Err(e) = self.cache.put(url, &fetched).await {
            warn!(url = %url, "Failed to cache response: {e}");
        }
        Ok(fetched)
    }

    async fn get_once(&self, url: &str) -> Result<Fetched> {
        let fetch_err = |source| ArchiveError::Fetch {
            url: url.to_string(),
            source,
        };

        let host = host_key(url);
        let mut request = self.client.get(url);
        if let Some(cookie_header) = host.as_deref().and_then(|h| self.cookie_header(h)) {
            request = request.header(COOKIE, cookie_header);
        }

        let response = request.send().await.map_err(fetch_err)?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(media_type);
        let cookies: BTreeMap<String, String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        let body = response.bytes().await.map_err(fetch_err)?.to_vec();

        if let Some(host) = host {
            self.remember_cookies(&host, &cookies);
        }

        Ok(Fetched {
            url: url.to_string(),
            final_url,
            status,
            content_type,
            cookies,
            body,
        })
    }

    async fn render(&self, url: &str, strict: bool) -> Result<Fetched> {
        let Some(renderer) = self.renderer.as_ref() else {
            return Err(ArchiveError::Render {
                url: url.to_string(),
                message: "no render backend configured".to_string(),
            });
        };
        let timeout = self.options.render_timeout;

        let rendered = match renderer.render(url, timeout, true).await {
            Err(ArchiveError::RenderTimeout { .. }) if !strict => {
                info!(url = %url, "Render timed out, retrying with lenient network idle");
                renderer.render(url, timeout, false).await?
            }
            other => other?,
        };

        Ok(Fetched {
            url: url.to_string(),
            final_url: rendered.final_url,
            status: StatusCode::OK.as_u16(),
            content_type: Some("text/html".to_string()),
            cookies: rendered.cookies,
            body: rendered.html.into_bytes(),
        })
    }

    async fn read_local(&self, input: &str) -> Result<Fetched> {
        let path = local_path(input).ok_or_else(|| ArchiveError::AmbiguousUrl(input.to_string()))?;
        let body = tokio::fs::read(&path).await.map_err(io_at(&path))?;
        let final_url = tokio::fs::canonicalize(&path)
            .await
            .ok()
            .and_then(|abs| Url::from_file_path(abs).ok())
            .map_or_else(|| input.to_string(), |u| u.to_string());

        debug!(path = %path.display(), size = body.len(), "Read local file");

        Ok(Fetched {
            url: input.to_string(),
            final_url,
            status: StatusCode::OK.as_u16(),
            content_type: mime_guess::from_path(&path)
                .first()
                .map(|m| m.essence_str().to_string()),
            cookies: BTreeMap::new(),
            body,
        })
    }

    /// Media type of `url` via the cache or a `HEAD` request.
    ///
    /// Returns `None` when the type cannot be determined.
    pub async fn probe_content_type(&self, url: &str) -> Option<String> {
        if let Some(hit) = self.cache.get(url).await {
            return hit.content_type;
        }
        if !is_remote(url) {
            return mime_guess::from_path(url)
                .first()
                .map(|m| m.essence_str().to_string());
        }

        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(media_type),
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "Content-type probe rejected");
                None
            }
            Err(e) => {
                debug!(url = %url, "Content-type probe failed: {e}");
                None
            }
        }
    }

    /// Fetch many URLs concurrently, in batches of at most 100.
    ///
    /// Not used by the recursive crawl, whose state is not shared safely
    /// between concurrent page archives.
    pub async fn fetch_in_parallel(
        &self,
        urls: &[String],
        max_workers: usize,
    ) -> HashMap<String, Result<Fetched>> {
        let mut results = HashMap::with_capacity(urls.len());

        for batch in urls.chunks(PARALLEL_BATCH_SIZE) {
            let limits = HostLimits::for_urls(batch, DEFAULT_PER_DOMAIN_CONCURRENCY);
            let fetched: Vec<(String, Result<Fetched>)> = stream::iter(batch.iter().cloned())
                .map(|url| {
                    let limits = &limits;
                    async move {
                        let _permit = limits.acquire(&url).await;
                        let result = self.fetch(&url, RenderMode::Plain, false).await;
                        (url, result)
                    }
                })
                .buffer_unordered(max_workers.max(1))
                .collect()
                .await;
            results.extend(fetched);
        }

        results
    }

    /// Drop all session cookies.
    pub fn clear_cookies(&self) {
        self.lock_cookies().clear();
    }

    fn cookie_header(&self, host: &str) -> Option<String> {
        let jar = self.lock_cookies();
        let cookies = jar.get(host).filter(|c| !c.is_empty())?;
        Some(
            cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn remember_cookies(&self, host: &str, cookies: &BTreeMap<String, String>) {
        if cookies.is_empty() {
            return;
        }
        self.lock_cookies()
            .entry(host.to_string())
            .or_default()
            .extend(cookies.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    fn lock_cookies(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, String>>> {
        self.cookies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Whether `input` is an HTTP(S) URL rather than a local path.
#[must_use]
pub fn is_remote(input: &str) -> bool {
    Url::parse(input).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

fn host_key(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

/// `text/html; charset=utf-8` -> `text/html`.
fn media_type(header: &str) -> String {
    header
        .split(';')
        .next()
        .unwrap_or(header)
        .trim()
        .to_lowercase()
}

/// `name=value; Path=/; HttpOnly` -> `(name, value)`.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Local path a `file://` URL or bare path refers to.
#[must_use]
pub fn local_path(input: &str) -> Option<PathBuf> {
    match Url::parse(input) {
        Ok(u) if u.scheme() == "file" => u.to_file_path().ok(),
        Ok(_) => None,
        Err(_) => Some(Path::new(input).to_path_buf()),
    }
}
