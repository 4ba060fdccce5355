use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use site_archiver::archiver::{bundle_file_name, ArchiveOptions, SiteArchiver};
use site_archiver::config::Config;
use site_archiver::fetch::{ChromiumRenderer, Fetcher, RenderBackend};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting site-archiver");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        seeds = config.seed_urls.len(),
        archive_root = %config.archive_root.display(),
        backend = ?config.render_backend,
        "Configuration loaded"
    );

    let mut fetcher = Fetcher::new(config.fetch_options()).context("Failed to build HTTP client")?;
    if config.render_backend == RenderBackend::Chromium {
        let renderer = ChromiumRenderer::new(config.chromium_config())
            .context("RENDER_BACKEND=chromium but no usable browser was found")?;
        fetcher = fetcher.with_renderer(Arc::new(renderer));
    }

    let options = ArchiveOptions {
        render_js: config.render_backend != RenderBackend::None,
        strict: config.strict,
        rewrite: config.rewrite_options(),
        ..ArchiveOptions::default()
    };
    let mut archiver = SiteArchiver::open(&config.archive_root, Arc::new(fetcher), options)
        .await
        .context("Failed to open archive")?;

    let policy = config.link_policy();
    let mut archived = Vec::new();

    for seed in &config.seed_urls {
        match archiver.get_page(seed, config.refresh, policy.as_ref()).await {
            Ok(Some(page)) => {
                info!(
                    url = %seed,
                    index_path = %page.index_path,
                    resources = page.resources.len(),
                    "Seed archived"
                );
                archived.push(seed.clone());
            }
            Ok(None) => warn!(url = %seed, "Seed returned no content"),
            Err(e) => {
                error!(url = %seed, "Failed to archive seed: {e:#}");
                archiver.journal().record_or_warn(seed, &e).await;
            }
        }
    }

    if archived.is_empty() {
        anyhow::bail!(
            "No seed could be archived; see {}",
            archiver.journal().path().display()
        );
    }

    if config.export_bundles {
        tokio::fs::create_dir_all(&config.bundle_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create bundle directory: {}",
                    config.bundle_dir.display()
                )
            })?;

        for seed in &archived {
            let url = Url::parse(seed).with_context(|| format!("Invalid seed URL: {seed}"))?;
            let out = config.bundle_dir.join(bundle_file_name(&url));
            if let Err(e) = archiver.export_page_as_zip(seed, &out).await {
                error!(url = %seed, "Failed to export bundle: {e:#}");
            }
        }
    }

    if let Some(threshold) = config.dependency_zip_threshold {
        let out = config.bundle_dir.join("dependencies.zip");
        archiver
            .create_dependency_zip(threshold, &out)
            .await
            .context("Failed to create dependency zip")?;
    }

    info!(
        archived = archived.len(),
        pages = archiver.cache().len(),
        "Archive run complete"
    );
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,site_archiver=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}
