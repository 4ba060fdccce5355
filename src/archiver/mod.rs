//! The site archival engine.
//!
//! A [`SiteArchiver`] session fetches a page, localizes its assets through
//! the [`AssetRewriter`], follows links according to a [`LinkPolicy`] and
//! records the result in the [`ArchiveCache`].

pub mod assets;
pub mod bundle;
pub mod cache;
pub mod css;
pub mod links;
pub mod paths;
pub mod rewrite;
pub mod session;

use url::Url;

pub use assets::{
    download_file, AssetReference, AssetRewriter, ContentTransform, NodeFilter, RewriteOptions,
    RewrittenDocument, StripAbsoluteUrls,
};
pub use bundle::create_predictable_zip;
pub use cache::{ArchiveCache, ArchivedPage};
pub use links::{LinkPolicy, LinkScope, LinkTarget};
pub use paths::{FilenameDeriver, FlatFilenames, LocalPath, PathMapper};
pub use rewrite::{replace_quoted, Rewrite, RewriteMap};
pub use session::{ArchiveOptions, SiteArchiver};

const MAX_BUNDLE_NAME_LENGTH: usize = 200;

/// Filesystem-safe zip file name for a page's bundle.
///
/// # Examples
///
/// ```
/// # use site_archiver::archiver::bundle_file_name;
/// let url = url::Url::parse("https://example.com/a/index.html?x=1").unwrap();
/// assert_eq!(bundle_file_name(&url), "example.com_a_index.html_x_1.zip");
/// ```
#[must_use]
pub fn bundle_file_name(url: &Url) -> String {
    let raw = format!(
        "{}{}{}",
        url.host_str().unwrap_or("page"),
        url.path(),
        url.query().map(|q| format!("?{q}")).unwrap_or_default()
    );

    let sanitized: String = raw
        .chars()
        .map(|c| match c {
            '-' | '.' => c,
            c if c.is_alphanumeric() => c,
            _ => '_',
        })
        .collect();

    // Collapse runs of underscores and trim them from the edges.
    let name = sanitized
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    let name: String = name.chars().take(MAX_BUNDLE_NAME_LENGTH).collect();
    format!("{name}.zip")
}
