//! Shared constants used across the application.

/// User agent string used for archival HTTP requests.
///
/// Identifies the archiver honestly so site operators can tell offline-copy
/// traffic apart from regular browsing.
pub const ARCHIVAL_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; site-archiver/0.1; +https://github.com/site-archiver/site-archiver)";

/// Name of the per-root JSON index mapping URLs to archived page metadata.
pub const ARCHIVE_INDEX_FILE: &str = "archive_files.json";

/// Name of the per-root journal of pages that failed to archive.
pub const FAILURE_JOURNAL_FILE: &str = "failed_pages.jsonl";

/// Extensions that mark a link target as an HTML page rather than a file.
pub const HTML_EXTENSIONS: &[&str] = &["htm", "html", "xhtml"];

/// Maximum number of URLs handed to the worker pool in one parallel batch.
pub const PARALLEL_BATCH_SIZE: usize = 100;
