//! JavaScript rendering through a headless Chrome/Chromium.
//!
//! Rendering is consumed through the [`Renderer`] trait so the crawl never
//! depends on a particular browser backend. The backend is picked once at
//! startup from configuration.

use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, Result};

/// Default viewport width in pixels.
pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;

/// Default viewport height in pixels.
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 800;

/// Quiet period that counts as "network idle".
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_millis(500);

/// Resource loads tolerated inside the idle window in lenient mode.
pub const LENIENT_IDLE_ALLOWANCE: u64 = 2;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A fully rendered document.
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    /// Serialized document, including the doctype.
    pub html: String,
    pub final_url: String,
    pub cookies: BTreeMap<String, String>,
}

/// Renders a URL after executing its JavaScript.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `url`, waiting for load and network idle.
    ///
    /// With `strict_idle` the page must go fully quiet; otherwise a trickle
    /// of background requests (polling APIs) is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::RenderTimeout`] if the page does not settle
    /// within `timeout`.
    async fn render(&self, url: &str, timeout: Duration, strict_idle: bool) -> Result<Rendered>;
}

/// Which rendering backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderBackend {
    /// Plain HTTP only; JavaScript is never executed.
    #[default]
    None,
    Chromium,
}

impl FromStr for RenderBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "none" | "off" | "" => Ok(Self::None),
            "chromium" | "chrome" => Ok(Self::Chromium),
            other => Err(format!("must be 'none' or 'chromium', got '{other}'")),
        }
    }
}

/// Chromium renderer configuration.
#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Path to Chrome/Chromium executable (None for auto-detection).
    pub chrome_path: Option<String>,
    pub idle_window: Duration,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self {
            viewport_width: DEFAULT_VIEWPORT_WIDTH,
            viewport_height: DEFAULT_VIEWPORT_HEIGHT,
            chrome_path: None,
            idle_window: DEFAULT_IDLE_WINDOW,
        }
    }
}

/// Renderer that launches one headless browser per render.
///
/// The browser is closed on every exit path, including timeouts, so no
/// browser processes outlive a render.
#[derive(Debug, Clone)]
pub struct ChromiumRenderer {
    config: ChromiumConfig,
}

impl ChromiumRenderer {
    /// Create the renderer, verifying that a browser executable exists.
    ///
    /// # Errors
    ///
    /// Returns an error if no Chrome/Chromium executable can be found.
    pub fn new(config: ChromiumConfig) -> Result<Self> {
        let renderer = Self { config };
        renderer.browser_config(Duration::from_secs(30), "<startup>")?;
        info!("Chromium renderer available");
        Ok(renderer)
    }

    fn browser_config(&self, timeout: Duration, url: &str) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .window_size(self.config.viewport_width, self.config.viewport_height)
            .request_timeout(timeout)
            .no_sandbox()
            .disable_default_args()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-extensions")
            .arg("--disable-sync")
            .arg("--mute-audio");

        if let Some(ref chrome_path) = self.config.chrome_path {
            builder = builder.chrome_executable(chrome_path);
        }

        builder.build().map_err(|message| ArchiveError::Render {
            url: url.to_string(),
            message: format!("failed to build browser config: {message}"),
        })
    }

    async fn load(&self, browser: &Browser, url: &str, strict_idle: bool) -> Result<Rendered> {
        let render_err = |message: String| ArchiveError::Render {
            url: url.to_string(),
            message,
        };

        let page = browser
            .new_page(url)
            .await
            .map_err(|e| render_err(format!("failed to open page: {e}")))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| render_err(format!("navigation failed: {e}")))?;

        wait_for_network_idle(&page, self.config.idle_window, strict_idle).await?;

        let html = page
            .content()
            .await
            .map_err(|e| render_err(format!("failed to read document: {e}")))?;
        let cookies = page
            .get_cookies()
            .await
            .map(|cookies| {
                cookies
                    .into_iter()
                    .map(|c| (c.name, c.value))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        if let Err(e) = page.close().await {
            warn!("Failed to close page: {e}");
        }

        Ok(Rendered {
            html,
            final_url,
            cookies,
        })
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render(&self, url: &str, timeout: Duration, strict_idle: bool) -> Result<Rendered> {
        debug!(url = %url, strict_idle, "Rendering page");

        let config = self.browser_config(timeout, url)?;
        let (mut browser, mut handler) =
            Browser::launch(config)
                .await
                .map_err(|e| ArchiveError::Render {
                    url: url.to_string(),
                    message: format!("failed to launch browser: {e}"),
                })?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        let outcome = tokio::time::timeout(timeout, self.load(&browser, url, strict_idle)).await;

        if let Err(e) = browser.close().await {
            warn!(url = %url, "Failed to close browser: {e}");
        }
        if let Err(e) = browser.wait().await {
            warn!(url = %url, "Failed to reap browser process: {e}");
        }
        handler_task.abort();

        match outcome {
            Ok(rendered) => rendered,
            Err(_) => Err(ArchiveError::RenderTimeout {
                url: url.to_string(),
                timeout,
            }),
        }
    }
}

/// Poll the page until its resource count stops growing.
async fn wait_for_network_idle(page: &Page, window: Duration, strict_idle: bool) -> Result<()> {
    let allowance = if strict_idle { 0 } else { LENIENT_IDLE_ALLOWANCE };
    let mut tracker = IdleTracker::new(window, allowance);

    loop {
        let state = page
            .evaluate(
                "[document.readyState, performance.getEntriesByType('resource').length]",
            )
            .await
            .ok()
            .and_then(|result| result.into_value::<(String, u64)>().ok());

        if let Some((ready_state, resources)) = state {
            if tracker.observe(Instant::now(), &ready_state, resources) {
                return Ok(());
            }
        }

        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
    }
}

/// Sliding-window detector for network quiet.
#[derive(Debug)]
struct IdleTracker {
    window: Duration,
    allowance: u64,
    samples: VecDeque<(Instant, u64)>,
}

impl IdleTracker {
    fn new(window: Duration, allowance: u64) -> Self {
        Self {
            window,
            allowance,
            samples: VecDeque::new(),
        }
    }

    /// Record a sample; returns true once the page counts as idle.
    fn observe(&mut self, now: Instant, ready_state: &str, resources: u64) -> bool {
        self.samples.push_back((now, resources));
        // Keep the newest sample that is at least one window old as baseline.
        while self.samples.len() > 1
            && now.duration_since(self.samples[1].0) >= self.window
        {
            self.samples.pop_front();
        }

        if ready_state != "complete" {
            return false;
        }

        let Some(&(oldest_at, oldest)) = self.samples.front() else {
            return false;
        };
        if now.duration_since(oldest_at) < self.window {
            return false;
        }

        resources.saturating_sub(oldest) <= self.allowance
    }
}
