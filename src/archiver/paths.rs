//! Mapping URLs to paths inside the archive root.
//!
//! Every URL maps to `{domain}/{path}` where `domain` is the host (plus port)
//! with `:` replaced by `_`. The mapping is a pure function of the URL, so
//! re-archiving the same page lands on the same files.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;
use url::Url;

use crate::error::{io_at, ArchiveError, Result};
use crate::fetch::Fetcher;

/// Extension used when a directory-like URL's content type is unknown.
pub const DEFAULT_INDEX_EXTENSION: &str = "html";

/// Archive-relative location of a URL, before any index file is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPath {
    /// `host` or `host_port`.
    pub domain: String,
    /// Directory segments below the domain directory.
    pub dirs: Vec<String>,
    /// File name, or `None` for directory-like URLs that need an index file.
    pub file_name: Option<String>,
    /// Sanitized query string; already folded into `file_name` when present.
    pub query_suffix: Option<String>,
}

impl LocalPath {
    #[must_use]
    pub fn is_directory_like(&self) -> bool {
        self.file_name.is_none()
    }

    /// `/`-separated path relative to the archive root. Directory-like URLs
    /// get an `index.{index_ext}` leaf.
    #[must_use]
    pub fn to_relative(&self, index_ext: &str) -> String {
        let leaf = self.file_name.clone().unwrap_or_else(|| {
            let suffix = self
                .query_suffix
                .as_deref()
                .map(|q| format!("_{q}"))
                .unwrap_or_default();
            format!("index{suffix}.{index_ext}")
        });

        std::iter::once(self.domain.as_str())
            .chain(self.dirs.iter().map(String::as_str))
            .chain(std::iter::once(leaf.as_str()))
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Resolve a reference as written in markup against the page it came from.
///
/// # Errors
///
/// Returns [`ArchiveError::AmbiguousUrl`] for a relative reference without a
/// page, or [`ArchiveError::InvalidUrl`] if it cannot be parsed.
pub fn resolve_reference(raw: &str, page_url: Option<&Url>) -> Result<Url> {
    let raw = raw.trim();
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let page = page_url.ok_or_else(|| ArchiveError::AmbiguousUrl(raw.to_string()))?;
            page.join(raw).map_err(|source| ArchiveError::InvalidUrl {
                url: raw.to_string(),
                source,
            })
        }
        Err(source) => Err(ArchiveError::InvalidUrl {
            url: raw.to_string(),
            source,
        }),
    }
}

/// Domain directory name for a URL: host plus optional port, `:` → `_`.
#[must_use]
pub fn domain_dir(url: &Url) -> Option<String> {
    let host = url.host_str().filter(|h| !h.is_empty())?;
    let domain = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Some(domain.replace(':', "_"))
}

/// Map an absolute URL to its archive-relative location.
///
/// # Errors
///
/// Returns [`ArchiveError::AmbiguousUrl`] if the URL has no host and
/// [`ArchiveError::PathEscape`] if a segment would climb out of the domain.
pub fn archive_relative_path(url: &Url) -> Result<LocalPath> {
    let domain = domain_dir(url).ok_or_else(|| ArchiveError::AmbiguousUrl(url.to_string()))?;

    let path = url.path();
    let mut dirs = Vec::new();
    for raw in path.split('/') {
        let segment = raw.replace('%', "_");
        match segment.as_str() {
            "" | "." => {}
            ".." => {
                return Err(ArchiveError::PathEscape {
                    url: url.to_string(),
                    path: path.to_string(),
                })
            }
            _ => dirs.push(segment),
        }
    }

    let query_suffix = url.query().filter(|q| !q.is_empty()).map(sanitize_query);

    let file_name = if path.ends_with('/') {
        None
    } else {
        dirs.last()
            .filter(|leaf| split_extension(leaf).is_some())
            .cloned()
    };
    if file_name.is_some() {
        dirs.pop();
    }
    let file_name = file_name.map(|name| match query_suffix.as_deref() {
        Some(q) => insert_before_extension(&name, q),
        None => name,
    });

    Ok(LocalPath {
        domain,
        dirs,
        file_name,
        query_suffix,
    })
}

/// Resolve `raw` against `page_url` and map it to its archive location.
///
/// # Errors
///
/// See [`resolve_reference`] and [`archive_relative_path`].
pub fn derive_local_path(raw: &str, page_url: Option<&Url>) -> Result<LocalPath> {
    archive_relative_path(&resolve_reference(raw, page_url)?)
}

/// Archive-relative path of the HTML file a page is written to.
///
/// Directory-like URLs get `index.html`; a leaf whose extension is not an
/// `.htm*` variant gets `.html` appended.
///
/// # Errors
///
/// See [`archive_relative_path`].
pub fn page_index_path(url: &Url) -> Result<String> {
    let local = archive_relative_path(url)?;
    let relative = match local.file_name.as_deref() {
        None => local.to_relative(DEFAULT_INDEX_EXTENSION),
        Some(name) if split_extension(name).is_some_and(|(_, ext)| ext.contains("htm")) => {
            local.to_relative(DEFAULT_INDEX_EXTENSION)
        }
        Some(_) => format!("{}.html", local.to_relative(DEFAULT_INDEX_EXTENSION)),
    };
    ensure_contained(url, &local.domain, &relative)?;
    Ok(relative)
}

/// Check that `relative` stays strictly inside the `domain` directory.
///
/// # Errors
///
/// Returns [`ArchiveError::PathEscape`] on violation.
pub fn ensure_contained(url: &Url, domain: &str, relative: &str) -> Result<()> {
    let mut components = Path::new(relative).components();
    let first_ok = matches!(components.next(), Some(Component::Normal(c)) if c == domain);
    let mut rest = 0usize;
    let rest_ok = components.all(|c| {
        rest += 1;
        matches!(c, Component::Normal(_))
    });

    if first_ok && rest_ok && rest > 0 {
        Ok(())
    } else {
        Err(ArchiveError::PathEscape {
            url: url.to_string(),
            path: relative.to_string(),
        })
    }
}

/// File extension for a media type, defaulting to `html`.
#[must_use]
pub fn extension_for_content_type(content_type: Option<&str>) -> String {
    let Some(content_type) = content_type else {
        return DEFAULT_INDEX_EXTENSION.to_string();
    };
    let known = match content_type {
        "text/html" => Some("html"),
        "application/xhtml+xml" => Some("xhtml"),
        "text/css" => Some("css"),
        "text/javascript" | "application/javascript" | "application/x-javascript" => Some("js"),
        "application/json" => Some("json"),
        "image/jpeg" => Some("jpg"),
        "image/svg+xml" => Some("svg"),
        "text/plain" => Some("txt"),
        _ => None,
    };
    known
        .map(str::to_string)
        .or_else(|| {
            mime_guess::get_mime_extensions_str(content_type)
                .and_then(|exts| exts.first())
                .map(|ext| (*ext).to_string())
        })
        .unwrap_or_else(|| DEFAULT_INDEX_EXTENSION.to_string())
}

/// Path from the directory of `from_file` to `to`, both archive-relative.
#[must_use]
pub fn relative_path(from_file: &str, to: &str) -> String {
    let mut from_dir: Vec<&str> = from_file.split('/').collect();
    from_dir.pop();
    let to_parts: Vec<&str> = to.split('/').collect();

    let common = from_dir
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts = vec![".."; from_dir.len() - common];
    parts.extend(&to_parts[common..]);
    parts.join("/")
}

fn sanitize_query(query: &str) -> String {
    query
        .chars()
        .map(|c| match c {
            '=' | '&' | '/' | '\\' | '%' => '_',
            c => c,
        })
        .collect()
}

fn split_extension(name: &str) -> Option<(&str, &str)> {
    name.rsplit_once('.')
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
}

fn insert_before_extension(name: &str, suffix: &str) -> String {
    match split_extension(name) {
        Some((stem, ext)) => format!("{stem}_{suffix}.{ext}"),
        None => format!("{name}_{suffix}"),
    }
}

/// Strategy for naming downloaded assets.
#[async_trait]
pub trait FilenameDeriver: Send {
    /// `/`-separated path, relative to the download destination, for `url`.
    async fn derive(&mut self, url: &Url) -> Result<String>;
}

/// Page-scoped mapper into the archive layout.
///
/// Directory-like URLs are probed for their content type so the index file
/// gets a fitting extension.
pub struct PathMapper<'a> {
    fetcher: &'a Fetcher,
    root: PathBuf,
    page_url: Url,
}

impl<'a> PathMapper<'a> {
    #[must_use]
    pub fn new(fetcher: &'a Fetcher, root: &Path, page_url: Url) -> Self {
        Self {
            fetcher,
            root: root.to_path_buf(),
            page_url,
        }
    }

    #[must_use]
    pub fn page_url(&self) -> &Url {
        &self.page_url
    }

    /// Derive the archive path for a reference as written in this page.
    ///
    /// # Errors
    ///
    /// See [`PathMapper::derive_path`].
    pub async fn derive_reference(&self, raw: &str) -> Result<String> {
        let url = resolve_reference(raw, Some(&self.page_url))?;
        self.derive_path(&url).await
    }

    /// Derive the archive path for an absolute URL and create its directory.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::PathEscape`] if the path leaves the domain
    /// directory, or an I/O error if the directory cannot be created.
    pub async fn derive_path(&self, url: &Url) -> Result<String> {
        let local = archive_relative_path(url)?;
        let relative = if local.is_directory_like() {
            match self.existing_index(&local).await {
                Some(existing) => existing,
                None => {
                    let content_type = self.fetcher.probe_content_type(url.as_str()).await;
                    local.to_relative(&extension_for_content_type(content_type.as_deref()))
                }
            }
        } else {
            local.to_relative(DEFAULT_INDEX_EXTENSION)
        };
        ensure_contained(url, &local.domain, &relative)?;

        if let Some(parent) = self.root.join(&relative).parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_at(parent))?;
        }

        debug!(url = %url, path = %relative, "Derived archive path");
        Ok(relative)
    }

    /// Index file already on disk for a directory-like URL, so a re-run
    /// needs no content-type probe. Ambiguous directories are probed again.
    async fn existing_index(&self, local: &LocalPath) -> Option<String> {
        let placeholder = local.to_relative(DEFAULT_INDEX_EXTENSION);
        let (dir, _) = placeholder.rsplit_once('/')?;
        let prefix = match local.query_suffix.as_deref() {
            Some(q) => format!("index_{q}."),
            None => "index.".to_string(),
        };

        let mut entries = tokio::fs::read_dir(self.root.join(dir)).await.ok()?;
        let mut found = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let is_index = name
                .strip_prefix(&prefix)
                .is_some_and(|ext| !ext.is_empty() && !ext.contains('.'));
            if is_index && entry.file_type().await.is_ok_and(|t| t.is_file()) {
                found.push(format!("{dir}/{name}"));
            }
        }
        if found.len() == 1 {
            found.pop()
        } else {
            None
        }
    }
}

#[async_trait]
impl FilenameDeriver for PathMapper<'_> {
    async fn derive(&mut self, url: &Url) -> Result<String> {
        self.derive_path(url).await
    }
}

/// Flat naming: a random prefix plus the URL's basename, all in one directory.
///
/// Names are unique per call, so re-runs download again.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatFilenames;

#[async_trait]
impl FilenameDeriver for FlatFilenames {
    async fn derive(&mut self, url: &Url) -> Result<String> {
        let basename = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("index")
            .replace('%', "_");
        let prefix: u128 = rand::thread_rng().gen();
        Ok(format!("{prefix:032x}.{basename}").to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_absolute_url() {
        let local = derive_local_path("https://learningequality.org/kolibri.png", None).unwrap();
        assert_eq!(local.to_relative("html"), "learningequality.org/kolibri.png");
    }

    #[test]
    fn test_relative_url_against_page() {
        let page = url("https://learningequality.org/team/index.html");
        let local = derive_local_path("../kolibri.png", Some(&page)).unwrap();
        assert_eq!(local.to_relative("html"), "learningequality.org/kolibri.png");
    }

    #[test]
    fn test_relative_url_against_directory_page() {
        let page = url("https://example.com/docs/");
        let local = derive_local_path("img/a.png", Some(&page)).unwrap();
        assert_eq!(local.to_relative("html"), "example.com/docs/img/a.png");

        let page = url("https://example.com/docs/guide");
        let local = derive_local_path("img/a.png", Some(&page)).unwrap();
        assert_eq!(local.to_relative("html"), "example.com/docs/img/a.png");
    }

    #[test]
    fn test_root_relative_and_protocol_relative() {
        let page = url("https://example.com/a/index.html");
        let local = derive_local_path("/b/img.png", Some(&page)).unwrap();
        assert_eq!(local.to_relative("html"), "example.com/b/img.png");

        let local = derive_local_path("//cdn.example.net/lib.js", Some(&page)).unwrap();
        assert_eq!(local.to_relative("html"), "cdn.example.net/lib.js");
    }

    #[test]
    fn test_relative_without_page_is_ambiguous() {
        let err = derive_local_path("img/a.png", None).unwrap_err();
        assert!(matches!(err, ArchiveError::AmbiguousUrl(_)));
    }

    #[test]
    fn test_port_colon_replaced() {
        let local = derive_local_path("http://localhost:8080/app.js", None).unwrap();
        assert_eq!(local.to_relative("html"), "localhost_8080/app.js");
    }

    #[test]
    fn test_query_variants_do_not_collide() {
        let a = derive_local_path("https://example.com/style.css?v=1", None).unwrap();
        let b = derive_local_path("https://example.com/style.css?v=2", None).unwrap();
        assert_eq!(a.to_relative("html"), "example.com/style_v_1.css");
        assert_eq!(b.to_relative("html"), "example.com/style_v_2.css");
    }

    #[test]
    fn test_query_on_directory_like_url() {
        let local = derive_local_path("https://example.com/?page=sixieme&x=1", None).unwrap();
        assert!(local.is_directory_like());
        assert_eq!(
            local.to_relative("html"),
            "example.com/index_page_sixieme_x_1.html"
        );
    }

    #[test]
    fn test_directory_like_urls() {
        let local = derive_local_path("https://example.com/fonts/roboto", None).unwrap();
        assert!(local.is_directory_like());
        assert_eq!(local.to_relative("woff"), "example.com/fonts/roboto/index.woff");

        let local = derive_local_path("https://example.com/", None).unwrap();
        assert_eq!(local.to_relative("html"), "example.com/index.html");
    }

    #[test]
    fn test_percent_replaced() {
        let local = derive_local_path("https://example.com/my%20file.png", None).unwrap();
        assert_eq!(local.to_relative("html"), "example.com/my_20file.png");
    }

    #[test]
    fn test_dot_segments_never_escape() {
        let page = url("https://example.com/a/b/index.html");
        let local = derive_local_path("../../../../../etc/passwd.txt", Some(&page)).unwrap();
        let relative = local.to_relative("html");
        assert_eq!(relative, "example.com/etc/passwd.txt");
        assert!(!relative.split('/').any(|s| s == ".."));

        let local = derive_local_path("https://example.com/%2e%2e/x.png", None).unwrap();
        assert_eq!(local.to_relative("html"), "example.com/_2e_2e/x.png");
    }

    #[test]
    fn test_mapping_is_stable() {
        let page = url("https://example.com/a/index.html");
        let first = derive_local_path("img/x.png?size=2", Some(&page)).unwrap();
        let second = derive_local_path("img/x.png?size=2", Some(&page)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_page_index_path() {
        assert_eq!(
            page_index_path(&url("https://example.com/a/index.html")).unwrap(),
            "example.com/a/index.html"
        );
        assert_eq!(
            page_index_path(&url("https://example.com/docs/")).unwrap(),
            "example.com/docs/index.html"
        );
        assert_eq!(
            page_index_path(&url("https://example.com/docs")).unwrap(),
            "example.com/docs/index.html"
        );
        assert_eq!(
            page_index_path(&url("https://example.com/view.php")).unwrap(),
            "example.com/view.php.html"
        );
        assert_eq!(
            page_index_path(&url("https://example.com/page.htm")).unwrap(),
            "example.com/page.htm"
        );
    }

    #[test]
    fn test_ensure_contained() {
        let u = url("https://example.com/");
        assert!(ensure_contained(&u, "example.com", "example.com/a.png").is_ok());
        assert!(ensure_contained(&u, "example.com", "example.com").is_err());
        assert!(ensure_contained(&u, "example.com", "example.com/../x").is_err());
        assert!(ensure_contained(&u, "example.com", "other.com/a.png").is_err());
        assert!(ensure_contained(&u, "example.com", "/example.com/a.png").is_err());
    }

    #[test]
    fn test_extension_for_content_type() {
        assert_eq!(extension_for_content_type(None), "html");
        assert_eq!(extension_for_content_type(Some("text/html")), "html");
        assert_eq!(extension_for_content_type(Some("text/css")), "css");
        assert_eq!(extension_for_content_type(Some("image/jpeg")), "jpg");
        assert_eq!(extension_for_content_type(Some("image/png")), "png");
        assert_eq!(
            extension_for_content_type(Some("application/x-unknown-thing")),
            "html"
        );
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path("example.com/css/site.css", "example.com/img/a.png"),
            "../img/a.png"
        );
        assert_eq!(
            relative_path("example.com/css/site.css", "example.com/css/fonts/f.woff"),
            "fonts/f.woff"
        );
        assert_eq!(
            relative_path("example.com/css/site.css", "cdn.net/x.png"),
            "../../cdn.net/x.png"
        );
    }

    #[tokio::test]
    async fn test_existing_index_is_reused() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("unreachable.invalid/theme")).unwrap();
        std::fs::write(root.join("unreachable.invalid/theme/index.css"), "p{}").unwrap();

        // The host does not resolve, so a HEAD request would fall back to `.html`.
        let fetcher = Fetcher::new(crate::fetch::FetchOptions::default()).unwrap();
        let mapper = PathMapper::new(&fetcher, root, url("https://unreachable.invalid/"));
        assert_eq!(
            mapper
                .derive_path(&url("https://unreachable.invalid/theme"))
                .await
                .unwrap(),
            "unreachable.invalid/theme/index.css"
        );

        // Two candidates are ambiguous, so the content type decides.
        std::fs::write(root.join("unreachable.invalid/theme/index.js"), "x").unwrap();
        assert_eq!(
            mapper
                .derive_path(&url("https://unreachable.invalid/theme"))
                .await
                .unwrap(),
            "unreachable.invalid/theme/index.html"
        );
    }

    #[tokio::test]
    async fn test_flat_filenames_keep_basename() {
        let mut deriver = FlatFilenames;
        let name = deriver
            .derive(&url("https://example.com/js/App.JS"))
            .await
            .unwrap();
        assert!(name.ends_with(".app.js"));
        assert_eq!(name.len(), 32 + ".app.js".len());
    }
}
