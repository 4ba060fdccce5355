//! Persistent index of archived pages and the bundles built from it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

use super::bundle::create_predictable_zip;
use crate::constants::ARCHIVE_INDEX_FILE;
use crate::error::{io_at, ArchiveError, Result};
use crate::fs_utils::copy_resources_best_effort;

/// Metadata for one archived page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedPage {
    /// Final URL, after redirects.
    pub url: String,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// Page markup, relative to the archive root.
    pub index_path: String,
    /// Files the page depends on, relative to the archive root.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// URL → [`ArchivedPage`] for one archive root, mirrored to
/// `archive_files.json`.
#[derive(Debug)]
pub struct ArchiveCache {
    root: PathBuf,
    pages: BTreeMap<String, ArchivedPage>,
}

impl ArchiveCache {
    /// Load the index under `root`, starting empty if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the index exists but cannot be read or parsed.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = root.join(ARCHIVE_INDEX_FILE);
        let pages = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_at(&path)(e)),
        };
        debug!(path = %path.display(), pages = pages.len(), "Loaded archive index");

        Ok(Self {
            root: root.to_path_buf(),
            pages,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn index_file(&self) -> PathBuf {
        self.root.join(ARCHIVE_INDEX_FILE)
    }

    /// Write the index as pretty-printed UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub async fn save(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_at(&self.root))?;

        let path = self.index_file();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.pages)?;
        tokio::fs::write(&tmp, json).await.map_err(io_at(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_at(&path))?;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, url: &str) -> Option<&ArchivedPage> {
        self.pages.get(url)
    }

    pub fn insert(&mut self, url: &str, page: ArchivedPage) {
        self.pages.insert(url.to_string(), page);
    }

    pub fn pages(&self) -> impl Iterator<Item = (&str, &ArchivedPage)> {
        self.pages.iter().map(|(url, page)| (url.as_str(), page))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Page whose markup lives at `index_path` (relative to the root;
    /// a leading `./` or `/` is ignored).
    #[must_use]
    pub fn find_page_by_index_path(&self, index_path: &str) -> Option<&ArchivedPage> {
        let wanted = index_path.trim_start_matches("./").trim_start_matches('/');
        self.pages.values().find(|page| page.index_path == wanted)
    }

    /// Archived markup of `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::PageNotArchived`] if `url` is not in the
    /// index, or an I/O error if its file cannot be read.
    pub async fn page_html(&self, url: &str) -> Result<String> {
        let page = self
            .get(url)
            .ok_or_else(|| ArchiveError::PageNotArchived(url.to_string()))?;
        let path = self.root.join(&page.index_path);
        tokio::fs::read_to_string(&path).await.map_err(io_at(&path))
    }

    /// Delete everything under the archive root and forget all pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be removed or recreated.
    pub async fn clear(&mut self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_at(&self.root)(e)),
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_at(&self.root))?;
        self.pages.clear();
        info!(root = %self.root.display(), "Cleared archive");
        Ok(())
    }

    /// Resources referenced by at least `count_threshold` distinct pages,
    /// sorted.
    #[must_use]
    pub fn shared_resources(&self, count_threshold: usize) -> Vec<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for page in self.pages.values() {
            let mut seen: Vec<&str> = Vec::new();
            for resource in &page.resources {
                if !seen.contains(&resource.as_str()) {
                    seen.push(resource);
                    *counts.entry(resource).or_default() += 1;
                }
            }
        }

        let mut shared: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count >= count_threshold.max(1))
            .map(|(resource, _)| resource.to_string())
            .collect();
        shared.sort();
        shared
    }

    /// Bundle resources shared by at least `count_threshold` pages into
    /// `out`. Returns `false` (and writes nothing) when nothing is shared.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle cannot be built.
    pub async fn create_dependency_zip(&self, count_threshold: usize, out: &Path) -> Result<bool> {
        let shared = self.shared_resources(count_threshold);
        if shared.is_empty() {
            info!(count_threshold, "No shared resources to bundle");
            return Ok(false);
        }

        let staging = TempDir::new().map_err(io_at(&self.root))?;
        copy_resources_best_effort(&self.root, staging.path(), &shared, "dependency zip").await?;
        let entries = create_predictable_zip(staging.path(), out).await?;
        info!(path = %out.display(), entries, "Created dependency zip");
        Ok(true)
    }

    /// Stage a page for bundling: its markup as `index.html` at the top plus
    /// its resources at their archive paths.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::PageNotArchived`] if `url` is unknown.
    pub async fn create_zip_dir_for_page(&self, url: &str) -> Result<TempDir> {
        let page = self
            .get(url)
            .ok_or_else(|| ArchiveError::PageNotArchived(url.to_string()))?;
        let staging = TempDir::new().map_err(io_at(&self.root))?;

        let index_src = self.root.join(&page.index_path);
        let index_dst = staging.path().join("index.html");
        tokio::fs::copy(&index_src, &index_dst)
            .await
            .map_err(io_at(&index_src))?;
        copy_resources_best_effort(&self.root, staging.path(), &page.resources, "page zip").await?;

        Ok(staging)
    }

    /// Package a page and its resources into `out`.
    ///
    /// # Errors
    ///
    /// See [`ArchiveCache::create_zip_dir_for_page`].
    pub async fn export_page_as_zip(&self, url: &str, out: &Path) -> Result<()> {
        let staging = self.create_zip_dir_for_page(url).await?;
        let entries = create_predictable_zip(staging.path(), out).await?;
        info!(url = %url, path = %out.display(), entries, "Exported page bundle");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str, index_path: &str, resources: &[&str]) -> ArchivedPage {
        ArchivedPage {
            url: url.to_string(),
            cookies: BTreeMap::new(),
            index_path: index_path.to_string(),
            resources: resources.iter().map(|r| (*r).to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cache = ArchiveCache::load(dir.path()).await.unwrap();
        assert!(cache.is_empty());

        let mut archived = page(
            "https://example.com/é/",
            "example.com/é/index.html",
            &["example.com/a.css"],
        );
        archived.cookies.insert("sid".to_string(), "1".to_string());
        cache.insert("https://example.com/é/", archived.clone());
        cache.save().await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(ARCHIVE_INDEX_FILE)).unwrap();
        assert!(raw.contains("\n  \"https://example.com/é/\": {"));
        assert!(raw.contains("\"index_path\": \"example.com/é/index.html\""));

        let reloaded = ArchiveCache::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.get("https://example.com/é/"), Some(&archived));
    }

    #[tokio::test]
    async fn test_find_page_by_index_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cache = ArchiveCache::load(dir.path()).await.unwrap();
        cache.insert(
            "https://example.com/a/",
            page("https://example.com/a/", "example.com/a/index.html", &[]),
        );

        let found = cache.find_page_by_index_path("./example.com/a/index.html");
        assert_eq!(found.map(|p| p.url.as_str()), Some("https://example.com/a/"));
        assert!(cache.find_page_by_index_path("example.com/b/index.html").is_none());
    }

    #[tokio::test]
    async fn test_shared_resources() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cache = ArchiveCache::load(dir.path()).await.unwrap();
        cache.insert(
            "https://example.com/1",
            page("https://example.com/1", "example.com/1/index.html", &["x.css", "x.css", "a.png"]),
        );
        cache.insert(
            "https://example.com/2",
            page("https://example.com/2", "example.com/2/index.html", &["x.css", "b.png"]),
        );

        assert_eq!(cache.shared_resources(2), vec!["x.css"]);
        assert_eq!(cache.shared_resources(1), vec!["a.png", "b.png", "x.css"]);
        assert!(cache.shared_resources(3).is_empty());
    }

    #[tokio::test]
    async fn test_page_html_unknown_page() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = ArchiveCache::load(dir.path()).await.unwrap();
        let err = cache.page_html("https://nowhere.example/").await.unwrap_err();
        assert!(matches!(err, ArchiveError::PageNotArchived(_)));
    }

    #[tokio::test]
    async fn test_clear_removes_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("archive");
        std::fs::create_dir_all(root.join("example.com")).unwrap();
        std::fs::write(root.join("example.com/index.html"), "x").unwrap();

        let mut cache = ArchiveCache::load(&root).await.unwrap();
        cache.insert(
            "https://example.com/",
            page("https://example.com/", "example.com/index.html", &[]),
        );
        cache.clear().await.unwrap();

        assert!(cache.is_empty());
        assert!(root.exists());
        assert!(!root.join("example.com").exists());
    }
}
