//! Append-only journal of pages that failed to archive.
//!
//! One JSON object per line, so a later run (or a person) can pick the
//! failed URLs back up.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::constants::FAILURE_JOURNAL_FILE;
use crate::error::{io_at, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPage {
    pub url: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailureJournal {
    path: PathBuf,
}

impl FailureJournal {
    /// Journal stored in `root`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(FAILURE_JOURNAL_FILE),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be written.
    pub async fn record(&self, url: &str, error: &dyn Display) -> Result<()> {
        let entry = FailedPage {
            url: url.to_string(),
            error: format!("{error:#}"),
            failed_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_at(parent))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_at(&self.path))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(io_at(&self.path))?;
        file.flush().await.map_err(io_at(&self.path))
    }

    /// Record a failure, logging instead of failing if the journal itself
    /// cannot be written.
    pub async fn record_or_warn(&self, url: &str, error: &dyn Display) {
        if let Err(e) = self.record(url, error).await {
            warn!(url = %url, path = %self.path.display(), "Failed to journal failure: {e}");
        }
    }

    /// All recorded failures, oldest first. Unparseable lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal exists but cannot be read.
    pub async fn entries(&self) -> Result<Vec<FailedPage>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_at(&self.path)(e)),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(path = %self.path.display(), "Skipping corrupt journal line: {e}");
                    None
                }
            })
            .collect())
    }
}
