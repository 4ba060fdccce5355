//! Per-host concurrency cap for parallel fetches.

use std::collections::HashMap;

use tokio::sync::{Semaphore, SemaphorePermit};

use super::host_key;

/// One semaphore per host in a batch of URLs, built before the batch runs
/// so no lock is needed while requests are in flight.
#[derive(Debug)]
pub struct HostLimits {
    semaphores: HashMap<String, Semaphore>,
}

impl HostLimits {
    /// Allow at most `per_host` concurrent requests to each host in `urls`.
    #[must_use]
    pub fn for_urls<'u>(urls: impl IntoIterator<Item = &'u String>, per_host: usize) -> Self {
        let mut semaphores = HashMap::new();
        for host in urls.into_iter().filter_map(|url| host_key(url)) {
            semaphores
                .entry(host)
                .or_insert_with(|| Semaphore::new(per_host.max(1)));
        }
        Self { semaphores }
    }

    /// Wait for a request slot on `url`'s host.
    ///
    /// URLs without a host (local files) are not limited and get `None`.
    pub async fn acquire(&self, url: &str) -> Option<SemaphorePermit<'_>> {
        let semaphore = self.semaphores.get(&host_key(url)?)?;
        // The semaphores are never closed, so this only fails if they were.
        semaphore.acquire().await.ok()
    }

    #[must_use]
    pub fn host_count(&self) -> usize {
        self.semaphores.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_hosts_are_limited_independently() {
        let batch = urls(&[
            "https://example.com/a",
            "https://EXAMPLE.com/b",
            "https://other.com/c",
        ]);
        let limits = HostLimits::for_urls(&batch, 1);
        assert_eq!(limits.host_count(), 2);

        let held = limits.acquire("https://example.com/a").await;
        assert!(held.is_some());

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            limits.acquire("https://example.com/b"),
        )
        .await;
        assert!(blocked.is_err());

        assert!(limits.acquire("https://other.com/c").await.is_some());

        drop(held);
        assert!(limits.acquire("https://example.com/b").await.is_some());
    }

    #[tokio::test]
    async fn test_local_paths_are_not_limited() {
        let batch = urls(&["/tmp/page.html"]);
        let limits = HostLimits::for_urls(&batch, 0);
        assert_eq!(limits.host_count(), 0);
        assert!(limits.acquire("/tmp/page.html").await.is_none());
    }
}
