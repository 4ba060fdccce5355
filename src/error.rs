//! Error types for the archival engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Errors produced while fetching, mapping, rewriting or packaging pages.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Network failure that survived every retry attempt.
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// A relative URL was given without a page to resolve it against.
    #[error("relative URL {0:?} has no referencing page to resolve against")]
    AmbiguousUrl(String),
    /// A derived local path would leave its domain directory.
    #[error("derived path {path:?} for {url} escapes its domain directory")]
    PathEscape { url: String, path: String },
    /// Non-2xx response in strict mode.
    #[error("unexpected HTTP status {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },
    /// JavaScript rendering did not settle before the timeout.
    #[error("rendering {url} timed out after {timeout:?}")]
    RenderTimeout { url: String, timeout: Duration },
    #[error("renderer failed for {url}: {message}")]
    Render { url: String, message: String },
    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("page {0} has not been archived")]
    PageNotArchived(String),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode archive index: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write bundle: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ArchiveError {
    /// Whether a retry could plausibly succeed (connection errors and timeouts).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch { source, .. } => source.is_connect() || source.is_timeout(),
            _ => false,
        }
    }
}

/// Build a closure that attaches `path` to an I/O error.
pub fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
