//! Response cache with no expiry.
//!
//! Successful responses are kept for the lifetime of the process and,
//! when a cache directory is configured, on disk across runs. Entries are
//! keyed by the request URL; the file stem is the SHA-256 of that URL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::Fetched;
use crate::error::{io_at, Result};

#[derive(Debug, Default)]
pub struct ResponseCache {
    dir: Option<PathBuf>,
    memory: Mutex<HashMap<String, Fetched>>,
}

impl ResponseCache {
    /// Create a cache. `dir` of `None` keeps entries in memory only.
    #[must_use]
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            memory: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Look up a cached response, loading it from disk if necessary.
    pub async fn get(&self, url: &str) -> Option<Fetched> {
        let hit = self.lock().get(url).cloned();
        if hit.is_some() {
            return hit;
        }

        let dir = self.dir.as_ref()?;
        let (meta_path, body_path) = entry_paths(dir, url);
        let meta = tokio::fs::read(&meta_path).await.ok()?;
        let mut fetched: Fetched = match serde_json::from_slice(&meta) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %meta_path.display(), "Ignoring corrupt cache entry: {e}");
                return None;
            }
        };
        fetched.body = tokio::fs::read(&body_path).await.ok()?;

        debug!(url = %url, "Response served from disk cache");
        self.lock().insert(url.to_string(), fetched.clone());
        Some(fetched)
    }

    /// Store a successful response.
    ///
    /// # Errors
    ///
    /// Returns an error if the on-disk entry cannot be written.
    pub async fn put(&self, url: &str, fetched: &Fetched) -> Result<()> {
        self.lock().insert(url.to_string(), fetched.clone());

        let Some(dir) = self.dir.as_ref() else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await.map_err(io_at(dir))?;

        let (meta_path, body_path) = entry_paths(dir, url);
        tokio::fs::write(&body_path, &fetched.body)
            .await
            .map_err(io_at(&body_path))?;
        let meta = serde_json::to_vec(fetched)?;
        tokio::fs::write(&meta_path, meta)
            .await
            .map_err(io_at(&meta_path))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Fetched>> {
        // A poisoned map only ever holds fully inserted entries.
        self.memory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

fn entry_paths(dir: &Path, url: &str) -> (PathBuf, PathBuf) {
    let key = cache_key(url);
    (
        dir.join(format!("{key}.json")),
        dir.join(format!("{key}.body")),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use super::*;

    fn sample(url: &str) -> Fetched {
        Fetched {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 200,
            content_type: Some("text/css".to_string()),
            cookies: BTreeMap::new(),
            body: b"body { color: red }".to_vec(),
        }
    }

    #[test]
    fn test_cache_key_is_stable() {
        assert_eq!(
            cache_key("https://example.com/a.css"),
            cache_key("https://example.com/a.css")
        );
        assert_ne!(
            cache_key("https://example.com/a.css"),
            cache_key("https://example.com/b.css")
        );
    }

    #[tokio::test]
    async fn test_memory_only_cache() {
        let cache = ResponseCache::new(None);
        let url = "https://example.com/a.css";
        assert!(cache.get(url).await.is_none());

        cache.put(url, &sample(url)).await.unwrap();
        let hit = cache.get(url).await.unwrap();
        assert_eq!(hit.body, b"body { color: red }");
    }

    #[tokio::test]
    async fn test_disk_cache_survives_new_instance() {
        let temp = TempDir::new().unwrap();
        let url = "https://example.com/a.css";

        let first = ResponseCache::new(Some(temp.path().to_path_buf()));
        first.put(url, &sample(url)).await.unwrap();

        let second = ResponseCache::new(Some(temp.path().to_path_buf()));
        let hit = second.get(url).await.unwrap();
        assert_eq!(hit.content_type.as_deref(), Some("text/css"));
        assert_eq!(hit.body, b"body { color: red }");
    }
}
